mod index;

pub use index::{Comparator, IndexError, IndexStats, Inserted, OrderedIndex, DEFAULT_SLOTS};

//definitions
//sorted array of elements, binary searched, shifted on insert/remove
//search is O(log n), structural changes are O(n), memory is one element
//per slot and nothing else
