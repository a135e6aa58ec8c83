use serde::Serialize;

/// Per-store knobs, fixed at init time.
#[derive(Debug, Clone, Serialize)]
pub struct StoreConfig {
    /// goes into the persisted file name (`om_<store_id>`)
    pub store_id: u32,
    /// slots in the object arena; bounded by the handle encoding
    pub object_capacity: usize,
    /// initial attribute slots per object
    pub attribute_slots: usize,
    /// attribute index growth step; doubles as the shrink hint on removes
    pub attribute_expansion: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_id: 0,
            object_capacity: 4096,
            attribute_slots: 8,
            attribute_expansion: 8,
        }
    }
}

impl StoreConfig {
    pub fn with_id(store_id: u32) -> Self {
        Self {
            store_id,
            ..Self::default()
        }
    }
}
