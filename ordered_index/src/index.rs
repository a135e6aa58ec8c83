use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

use log::debug;
use serde::Serialize;
use thiserror::Error;

/// Three-way element comparison supplied at init time.  Only the key part
/// of an element may feed the comparison if values are mutated in place.
pub type Comparator<T> = fn(&T, &T) -> Ordering;

/// Slot count after a [`OrderedIndex::reset`].
pub const DEFAULT_SLOTS: usize = 8;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("index full at {0} slots and expansion is disabled")]
    OutOfSpace(usize),
    #[error("allocation failed growing the index to {0} slots")]
    OutOfMemory(usize),
    #[error("no matching element")]
    NotFound,
    #[error("index is frozen by an active traversal")]
    Busy,
}

/// Outcome of a successful [`OrderedIndex::insert`].
#[derive(Debug, PartialEq, Eq)]
pub enum Inserted<T> {
    /// went into a fresh slot
    Fresh,
    /// an equal element was already present and kept; the probe comes back
    Declined(T),
    /// an equal element was present and overwritten in place; here it is
    Replaced(T),
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct IndexStats {
    pub inserts: u64,
    pub insert_failures: u64,
    pub searches: u64,
    pub search_failures: u64,
    pub removes: u64,
    pub remove_failures: u64,
}

enum Probe {
    Hit(usize),
    /// not present; carries the slot the element belongs in
    Miss(usize),
}

/// Sorted dynamic array of elements with binary search over a caller
/// supplied comparator.  Capacity is explicit: the index holds
/// `maximum_size` slots, grows only in `expansion_size` steps when full
/// and shrinks only when a remove asks for it.
pub struct OrderedIndex<T> {
    cmp: Comparator<T>,
    elements: Vec<T>,
    maximum_size: usize,
    expansion_size: usize,
    frozen: bool,
    inserts: u64,
    insert_failures: u64,
    removes: u64,
    remove_failures: u64,
    // relaxed atomics so search stays `&self` under a reader lock
    searches: AtomicU64,
    search_failures: AtomicU64,
}

impl<T> OrderedIndex<T> {
    pub fn new(
        cmp: Comparator<T>,
        maximum_size: usize,
        expansion_size: usize,
    ) -> Result<Self, IndexError> {
        if maximum_size <= 1 {
            return Err(IndexError::InvalidArgument("need at least 2 slots"));
        }
        let mut elements = Vec::new();
        if elements.try_reserve_exact(maximum_size).is_err() {
            return Err(IndexError::OutOfMemory(maximum_size));
        }
        Ok(Self {
            cmp,
            elements,
            maximum_size,
            expansion_size,
            frozen: false,
            inserts: 0,
            insert_failures: 0,
            removes: 0,
            remove_failures: 0,
            searches: AtomicU64::new(0),
            search_failures: AtomicU64::new(0),
        })
    }

    /// The heart of the object: binary search, recording the insertion
    /// point from the sign of the last comparison on a miss.
    fn find_position(&self, probe: &T) -> Probe {
        let mut lo: isize = 0;
        let mut hi: isize = self.elements.len() as isize - 1;
        let mut mid: isize = 0;
        let mut diff = Ordering::Equal;

        while lo <= hi {
            mid = (lo + hi) >> 1;
            diff = (self.cmp)(probe, &self.elements[mid as usize]);
            match diff {
                Ordering::Greater => lo = mid + 1,
                Ordering::Less => hi = mid - 1,
                Ordering::Equal => return Probe::Hit(mid as usize),
            }
        }
        let at = if diff == Ordering::Greater { mid + 1 } else { mid };
        Probe::Miss(at as usize)
    }

    pub fn insert(&mut self, element: T, overwrite: bool) -> Result<Inserted<T>, IndexError> {
        if self.frozen {
            self.insert_failures += 1;
            return Err(IndexError::Busy);
        }
        let at = match self.find_position(&element) {
            Probe::Hit(i) => {
                if overwrite {
                    let old = std::mem::replace(&mut self.elements[i], element);
                    self.inserts += 1;
                    return Ok(Inserted::Replaced(old));
                }
                return Ok(Inserted::Declined(element));
            }
            Probe::Miss(at) => at,
        };
        if self.elements.len() >= self.maximum_size {
            if self.expansion_size == 0 {
                self.insert_failures += 1;
                return Err(IndexError::OutOfSpace(self.maximum_size));
            }
            let grown = self.maximum_size + self.expansion_size;
            let wanted = grown - self.elements.len();
            if self.elements.try_reserve_exact(wanted).is_err() {
                self.insert_failures += 1;
                return Err(IndexError::OutOfMemory(grown));
            }
            self.maximum_size = grown;
        }
        // shift the tail right by one and drop the element into the gap
        self.elements.insert(at, element);
        self.inserts += 1;
        Ok(Inserted::Fresh)
    }

    pub fn search(&self, probe: &T) -> Result<(usize, &T), IndexError> {
        match self.find_position(probe) {
            Probe::Hit(i) => {
                self.searches.fetch_add(1, Relaxed);
                Ok((i, &self.elements[i]))
            }
            Probe::Miss(_) => {
                self.search_failures.fetch_add(1, Relaxed);
                Err(IndexError::NotFound)
            }
        }
    }

    /// Positional overwrite, no search, no ordering check.  Only legal when
    /// the replacement compares equal to what sits at `at`; anything else
    /// silently corrupts the sort order.  Intended for value updates where
    /// the key part of the element is untouched.
    pub fn replace(&mut self, at: usize, element: T) -> Result<T, IndexError> {
        if at >= self.elements.len() {
            return Err(IndexError::InvalidArgument("slot out of range"));
        }
        Ok(std::mem::replace(&mut self.elements[at], element))
    }

    pub fn remove(&mut self, probe: &T, shrink_threshold: usize) -> Result<T, IndexError> {
        if self.frozen {
            self.remove_failures += 1;
            return Err(IndexError::Busy);
        }
        let i = match self.find_position(probe) {
            Probe::Hit(i) => i,
            Probe::Miss(_) => {
                self.remove_failures += 1;
                return Err(IndexError::NotFound);
            }
        };
        // pull the tail left by one
        let removed = self.elements.remove(i);
        self.removes += 1;

        // opportunistic shrink; the remove already succeeded either way
        if shrink_threshold > 0 && self.maximum_size > self.elements.len() + shrink_threshold {
            self.maximum_size = self.elements.len() + shrink_threshold;
            self.elements.shrink_to(self.maximum_size);
        }
        Ok(removed)
    }

    /// Blocks insert and remove until [`OrderedIndex::unfreeze`], for the
    /// duration of an external traversal over the element slice.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn unfreeze(&mut self) {
        self.frozen = false;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Back to an empty index with [`DEFAULT_SLOTS`] slots.
    pub fn reset(&mut self) {
        self.elements.clear();
        self.elements.shrink_to(DEFAULT_SLOTS);
        self.maximum_size = DEFAULT_SLOTS;
        self.reset_stats();
        debug!("index reset to {} slots", DEFAULT_SLOTS);
    }

    /// Consumes the index, handing every live element to `handler`.
    pub fn destroy<F>(mut self, mut handler: F)
    where
        F: FnMut(T),
    {
        self.frozen = true;
        for element in self.elements.drain(..) {
            handler(element);
        }
    }

    pub fn get(&self, at: usize) -> Option<&T> {
        self.elements.get(at)
    }

    /// Value-only mutation; the key part feeding the comparator must not
    /// change through this.
    pub fn get_mut(&mut self, at: usize) -> Option<&mut T> {
        self.elements.get_mut(at)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.elements.iter()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.maximum_size
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            inserts: self.inserts,
            insert_failures: self.insert_failures,
            searches: self.searches.load(Relaxed),
            search_failures: self.search_failures.load(Relaxed),
            removes: self.removes,
            remove_failures: self.remove_failures,
        }
    }

    pub fn reset_stats(&mut self) {
        self.inserts = 0;
        self.insert_failures = 0;
        self.removes = 0;
        self.remove_failures = 0;
        self.searches.store(0, Relaxed);
        self.search_failures.store(0, Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;

    fn by_value(a: &u32, b: &u32) -> Ordering {
        a.cmp(b)
    }

    fn by_key(a: &(u32, u32), b: &(u32, u32)) -> Ordering {
        a.0.cmp(&b.0)
    }

    #[test]
    fn init_rejects_tiny_size() {
        assert_eq!(
            OrderedIndex::new(by_value, 1, 0).err(),
            Some(IndexError::InvalidArgument("need at least 2 slots"))
        );
        assert!(OrderedIndex::new(by_value, 2, 0).is_ok());
    }

    #[test]
    fn random_inserts_match_direct_sort() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..50 {
            let mut idx = OrderedIndex::new(by_value, 4, 4).unwrap();
            let mut expected: Vec<u32> = Vec::new();
            for _ in 0..200 {
                let v = rng.gen_range(0..10_000);
                match idx.insert(v, false).unwrap() {
                    Inserted::Fresh => expected.push(v),
                    Inserted::Declined(d) => assert_eq!(d, v),
                    Inserted::Replaced(_) => panic!("no overwrite requested"),
                }
            }
            expected.sort();
            let got: Vec<u32> = idx.iter().copied().collect();
            assert_eq!(got, expected);
        }
    }

    #[test]
    fn duplicate_and_overwrite() {
        let mut idx = OrderedIndex::new(by_key, 4, 0).unwrap();
        assert_eq!(idx.insert((7, 1), false).unwrap(), Inserted::Fresh);
        assert_eq!(
            idx.insert((7, 2), false).unwrap(),
            Inserted::Declined((7, 2))
        );
        assert_eq!(idx.search(&(7, 0)).unwrap().1, &(7, 1));
        assert_eq!(
            idx.insert((7, 2), true).unwrap(),
            Inserted::Replaced((7, 1))
        );
        assert_eq!(idx.search(&(7, 0)).unwrap().1, &(7, 2));
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn fixed_capacity_fills_up() {
        let mut idx = OrderedIndex::new(by_value, 3, 0).unwrap();
        for v in [5, 1, 9] {
            idx.insert(v, false).unwrap();
        }
        assert_eq!(idx.insert(7, false), Err(IndexError::OutOfSpace(3)));
        // duplicates still come back fine on a full index
        assert_eq!(idx.insert(5, false).unwrap(), Inserted::Declined(5));
        assert_eq!(idx.stats().insert_failures, 1);
    }

    #[test]
    fn expansion_in_steps() {
        let mut idx = OrderedIndex::new(by_value, 2, 3).unwrap();
        for v in 0..10 {
            idx.insert(v, false).unwrap();
        }
        assert_eq!(idx.len(), 10);
        assert_eq!(idx.capacity(), 11); // 2 + 3 + 3 + 3
    }

    #[test]
    fn remove_and_shrink() {
        let mut idx = OrderedIndex::new(by_value, 2, 8).unwrap();
        for v in 0..10 {
            idx.insert(v, false).unwrap();
        }
        assert_eq!(idx.capacity(), 10);
        assert_eq!(idx.remove(&3, 0), Ok(3));
        assert_eq!(idx.capacity(), 10); // no shrink asked for
        assert_eq!(idx.remove(&7, 2), Ok(7));
        assert_eq!(idx.capacity(), 10); // spare of 2 does not exceed threshold 2
        for v in [0, 1, 2, 4, 5] {
            assert_eq!(idx.remove(&v, 0), Ok(v));
        }
        assert_eq!(idx.remove(&6, 2), Ok(6));
        assert_eq!(idx.capacity(), 4); // 2 live + threshold 2
        assert_eq!(idx.remove(&42, 0), Err(IndexError::NotFound));
        let got: Vec<u32> = idx.iter().copied().collect();
        assert_eq!(got, vec![8, 9]);
    }

    #[test]
    fn freeze_blocks_structural_changes() {
        let mut idx = OrderedIndex::new(by_value, 4, 0).unwrap();
        idx.insert(1, false).unwrap();
        idx.freeze();
        assert_eq!(idx.insert(2, false), Err(IndexError::Busy));
        assert_eq!(idx.remove(&1, 0), Err(IndexError::Busy));
        // positional replace is deliberately not guarded
        assert_eq!(idx.replace(0, 1), Ok(1));
        idx.unfreeze();
        assert!(idx.insert(2, false).is_ok());
    }

    #[test]
    fn replace_keeps_slot() {
        let mut idx = OrderedIndex::new(by_key, 4, 0).unwrap();
        for k in [2, 4, 6] {
            idx.insert((k, 0), false).unwrap();
        }
        let (at, _) = idx.search(&(4, 0)).unwrap();
        assert_eq!(idx.replace(at, (4, 99)), Ok((4, 0)));
        assert_eq!(idx.search(&(4, 0)).unwrap(), (at, &(4, 99)));
        assert_eq!(
            idx.replace(3, (8, 0)),
            Err(IndexError::InvalidArgument("slot out of range"))
        );
    }

    #[test]
    fn reset_and_destroy() {
        let mut idx = OrderedIndex::new(by_value, 2, 2).unwrap();
        for v in 0..6 {
            idx.insert(v, false).unwrap();
        }
        idx.reset();
        assert!(idx.is_empty());
        assert_eq!(idx.capacity(), DEFAULT_SLOTS);

        for v in 0..4 {
            idx.insert(v, false).unwrap();
        }
        let mut seen = Vec::new();
        idx.destroy(|v| seen.push(v));
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn edge_insertion_points() {
        let mut idx = OrderedIndex::new(by_value, 8, 0).unwrap();
        idx.insert(50, false).unwrap();
        idx.insert(10, false).unwrap(); // front
        idx.insert(90, false).unwrap(); // back
        idx.insert(30, false).unwrap(); // middle
        let got: Vec<u32> = idx.iter().copied().collect();
        assert_eq!(got, vec![10, 30, 50, 90]);
        assert_eq!(idx.search(&10).unwrap().0, 0);
        assert_eq!(idx.search(&90).unwrap().0, 3);
        assert_eq!(idx.search(&40), Err(IndexError::NotFound));
    }
}
