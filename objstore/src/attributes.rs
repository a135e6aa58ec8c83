use std::cmp::Ordering;

/// One attribute of one object: an integer id, unique within the owning
/// object, and a byte payload.  An empty payload is a real state ("present
/// with no value"), distinct from the attribute being absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    id: i32,
    value: Vec<u8>,
}

impl Attribute {
    pub fn new(id: i32, value: &[u8]) -> Self {
        Self {
            id,
            value: value.to_vec(),
        }
    }

    /// Comparison probe; only the id takes part in the ordering.
    pub(crate) fn probe(id: i32) -> Self {
        Self {
            id,
            value: Vec::new(),
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Byte-for-byte patch, legal only when the length is unchanged; a
    /// different length needs a fresh record swapped in at the same slot.
    pub(crate) fn patch_value(&mut self, value: &[u8]) {
        self.value.copy_from_slice(value);
    }

    /// Exactly 8-byte values travel as simple (integer) records in the
    /// store file, big-endian.
    pub fn as_simple(&self) -> Option<i64> {
        let arr: [u8; 8] = self.value.as_slice().try_into().ok()?;
        Some(i64::from_be_bytes(arr))
    }

    pub fn is_valueless(&self) -> bool {
        self.value.is_empty()
    }
}

pub(crate) fn compare_attributes(a: &Attribute, b: &Attribute) -> Ordering {
    a.id.cmp(&b.id)
}

/// The simple-record encoding used by [`Attribute::as_simple`].
pub(crate) fn simple_value_bytes(value: i64) -> [u8; 8] {
    value.to_be_bytes()
}
