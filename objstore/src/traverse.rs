use log::trace;

use crate::store::{ObjectKey, ObjectStore, StoreError};

/// An in-progress walk over one object's subtree.
///
/// The walk state is a heap work-list of (object, next child) pairs, so the
/// depth it can handle is bounded by the tree, not by the call stack.  While
/// a `Traversal` is outstanding the store refuses structural mutation;
/// [`ObjectStore::end_traversal`] hands the store back.
pub struct Traversal {
    stack: Vec<(handle_pool::Handle, usize)>,
}

impl Traversal {
    /// Next descendant in depth-first order; the object the walk started
    /// from is not part of the result.
    pub fn next(&mut self, store: &ObjectStore) -> Option<ObjectKey> {
        loop {
            let (h, at) = *self.stack.last()?;
            let node = match store.node_by_handle(h) {
                Some(n) => n,
                None => {
                    self.stack.pop();
                    continue;
                }
            };
            if at >= node.children.len() {
                self.stack.pop();
                continue;
            }
            if let Some(top) = self.stack.last_mut() {
                top.1 = at + 1;
            }
            let child = node.children[at];
            self.stack.push((child, 0));
            if let Some(c) = store.node_by_handle(child) {
                return Some(c.key);
            }
            self.stack.pop();
        }
    }
}

impl ObjectStore {
    /// Marks the store busy and opens a walk over the subtree of `key`.
    /// Every structural mutation fails with [`StoreError::Busy`] until the
    /// matching [`ObjectStore::end_traversal`].
    pub fn begin_traversal(&mut self, key: ObjectKey) -> Result<Traversal, StoreError> {
        if self.busy {
            return Err(StoreError::Busy);
        }
        let h = self.handle_of(&key).ok_or(StoreError::NoSuchObject(key))?;
        self.busy = true;
        self.stats.traversals += 1;
        trace!("traversal of {} begins", key);
        Ok(Traversal {
            stack: vec![(h, 0)],
        })
    }

    pub fn end_traversal(&mut self, _walk: Traversal) {
        self.busy = false;
    }

    /// Applies `visit` to every descendant of `key` (excluding `key`),
    /// depth first, without recursing.
    pub fn traverse<F>(&mut self, key: ObjectKey, mut visit: F) -> Result<(), StoreError>
    where
        F: FnMut(&ObjectStore, ObjectKey),
    {
        let mut walk = self.begin_traversal(key)?;
        while let Some(k) = walk.next(self) {
            visit(self, k);
        }
        self.end_traversal(walk);
        Ok(())
    }

    /// All descendant keys of `key`, collected in visit order.
    pub fn descendants(&mut self, key: ObjectKey) -> Result<Vec<ObjectKey>, StoreError> {
        let mut out = Vec::new();
        self.traverse(key, |_, k| out.push(k))?;
        Ok(out)
    }
}
