use std::fmt;
use std::io;

use handle_pool::{Handle, HandlePool, PoolError, PoolStats};
use hashbrown::HashMap;
use log::{debug, trace, warn};
use ordered_index::{IndexError, OrderedIndex};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::attributes::{compare_attributes, simple_value_bytes, Attribute};
use crate::config::StoreConfig;

/// The unique identity of an object; never reused for a different logical
/// object while it exists.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct ObjectKey {
    pub object_type: i32,
    pub object_instance: i32,
}

impl ObjectKey {
    pub const ROOT: ObjectKey = ObjectKey {
        object_type: 0,
        object_instance: 0,
    };

    pub fn new(object_type: i32, object_instance: i32) -> Self {
        Self {
            object_type,
            object_instance,
        }
    }

    pub fn is_root(&self) -> bool {
        *self == Self::ROOT
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.object_type, self.object_instance)
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("no object {0}")]
    NoSuchObject(ObjectKey),
    #[error("object {0} has no attribute {1}")]
    NoSuchAttribute(ObjectKey, i32),
    #[error("object {key} already exists under {existing}, refusing parent {requested}")]
    ParentConflict {
        key: ObjectKey,
        existing: ObjectKey,
        requested: ObjectKey,
    },
    #[error("store is busy with an active traversal")]
    Busy,
    #[error("object arena full at {0} objects")]
    OutOfSpace(usize),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("attribute index: {0}")]
    Index(#[from] IndexError),
    #[error("object arena: {0}")]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("store file: {0}")]
    Format(String),
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct StoreStats {
    pub objects_created: u64,
    pub create_conflicts: u64,
    pub objects_removed: u64,
    pub attribute_sets: u64,
    pub attribute_removes: u64,
    pub traversals: u64,
    pub saves: u64,
    pub loads: u64,
}

/// How an object points at its parent.  `Unresolved` appears during bulk
/// load, before the parent object necessarily exists.
pub(crate) enum ParentRef {
    Root,
    Unresolved(ObjectKey),
    Resolved(Handle),
}

pub(crate) struct ObjectNode {
    pub(crate) key: ObjectKey,
    pub(crate) parent: ParentRef,
    pub(crate) children: Vec<Handle>,
    /// my slot in my parent's `children`, for O(1) detachment
    pub(crate) child_slot: usize,
    pub(crate) attributes: OrderedIndex<Attribute>,
}

impl ObjectNode {
    fn new(key: ObjectKey, parent: ParentRef, config: &StoreConfig) -> Result<Self, StoreError> {
        Ok(Self {
            key,
            parent,
            children: Vec::new(),
            child_slot: 0,
            attributes: OrderedIndex::new(
                compare_attributes,
                config.attribute_slots,
                config.attribute_expansion,
            )?,
        })
    }
}

/// A forest of (type, instance)-keyed objects rooted at `(0, 0)`, each with
/// one parent, any number of children and a sorted set of attributes.
pub struct ObjectStore {
    pub(crate) config: StoreConfig,
    pub(crate) objects: HandlePool<ObjectNode>,
    pub(crate) lookup: HashMap<ObjectKey, Handle>,
    pub(crate) root: Handle,
    pub(crate) busy: bool,
    pub(crate) stats: StoreStats,
}

impl ObjectStore {
    pub fn new(config: StoreConfig) -> Result<Self, StoreError> {
        if config.attribute_slots <= 1 {
            return Err(StoreError::InvalidArgument(
                "attribute_slots must be at least 2",
            ));
        }
        let mut objects = HandlePool::with_capacity(config.object_capacity)
            .map_err(|_| StoreError::InvalidArgument("object_capacity out of range"))?;
        let root_node = ObjectNode::new(ObjectKey::ROOT, ParentRef::Root, &config)?;
        let root = objects.store(root_node)?;
        let mut lookup = HashMap::new();
        lookup.insert(ObjectKey::ROOT, root);
        debug!("store {} initialized", config.store_id);
        Ok(Self {
            config,
            objects,
            lookup,
            root,
            busy: false,
            stats: StoreStats::default(),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub(crate) fn handle_of(&self, key: &ObjectKey) -> Option<Handle> {
        self.lookup.get(key).copied()
    }

    pub(crate) fn node_by_handle(&self, handle: Handle) -> Option<&ObjectNode> {
        self.objects.resolve(handle)
    }

    fn node_of(&self, key: &ObjectKey) -> Option<(Handle, &ObjectNode)> {
        let h = self.handle_of(key)?;
        self.objects.resolve(h).map(|n| (h, n))
    }

    /// Parent identity of a node, resolved or not; the root reports itself.
    pub(crate) fn parent_key_of(&self, node: &ObjectNode) -> ObjectKey {
        match node.parent {
            ParentRef::Root => ObjectKey::ROOT,
            ParentRef::Unresolved(key) => key,
            ParentRef::Resolved(h) => match self.objects.resolve(h) {
                Some(parent) => parent.key,
                None => ObjectKey::ROOT,
            },
        }
    }

    pub(crate) fn attach_child(&mut self, parent: Handle, child: Handle) {
        let slot = match self.objects.resolve_mut(parent) {
            Some(p) => {
                p.children.push(child);
                p.children.len() - 1
            }
            None => return,
        };
        if let Some(c) = self.objects.resolve_mut(child) {
            c.child_slot = slot;
        }
    }

    /// O(1) removal from the parent's child list via the recorded slot;
    /// the sibling swapped into the gap gets its slot patched.
    fn detach_child(&mut self, child: Handle) {
        let (parent, slot) = match self.objects.resolve(child) {
            Some(node) => match node.parent {
                ParentRef::Resolved(p) => (p, node.child_slot),
                _ => return,
            },
            None => return,
        };
        let moved = match self.objects.resolve_mut(parent) {
            Some(p) => {
                if slot >= p.children.len() || p.children[slot] != child {
                    return;
                }
                p.children.swap_remove(slot);
                p.children.get(slot).copied()
            }
            None => return,
        };
        if let Some(m) = moved {
            if let Some(n) = self.objects.resolve_mut(m) {
                n.child_slot = slot;
            }
        }
    }

    pub(crate) fn create_node(
        &mut self,
        parent: ObjectKey,
        key: ObjectKey,
    ) -> Result<Handle, StoreError> {
        trace!("creating {} under {}", key, parent);
        if let Some((h, node)) = self.node_of(&key) {
            let existing = self.parent_key_of(node);
            if existing == parent {
                return Ok(h);
            }
            self.stats.create_conflicts += 1;
            warn!(
                "object {} already under {}, refusing parent {}",
                key, existing, parent
            );
            return Err(StoreError::ParentConflict {
                key,
                existing,
                requested: parent,
            });
        }
        // parent lookup happens before self-registration, so an object
        // naming itself as parent just stays unresolved
        let parent_ref = match self.handle_of(&parent) {
            Some(p) => ParentRef::Resolved(p),
            None => ParentRef::Unresolved(parent),
        };
        let attach_to = match &parent_ref {
            ParentRef::Resolved(p) => Some(*p),
            _ => None,
        };
        let node = ObjectNode::new(key, parent_ref, &self.config)?;
        let h = match self.objects.store(node) {
            Ok(h) => h,
            Err(PoolError::Full(n)) => return Err(StoreError::OutOfSpace(n)),
            Err(e) => return Err(e.into()),
        };
        self.lookup.insert(key, h);
        if let Some(p) = attach_to {
            self.attach_child(p, h);
        }
        self.stats.objects_created += 1;
        Ok(h)
    }

    /// Creates `key` under `parent`.  Re-creating an existing object is a
    /// no-op when the parent matches and a conflict otherwise.
    pub fn create(&mut self, parent: ObjectKey, key: ObjectKey) -> Result<(), StoreError> {
        if self.busy {
            return Err(StoreError::Busy);
        }
        self.create_node(parent, key).map(|_| ())
    }

    pub fn exists(&self, key: ObjectKey) -> bool {
        self.node_of(&key).is_some()
    }

    pub fn object_count(&self) -> usize {
        self.lookup.len()
    }

    /// `None` for the root object.
    pub fn parent_of(&self, key: ObjectKey) -> Result<Option<ObjectKey>, StoreError> {
        let (_, node) = self.node_of(&key).ok_or(StoreError::NoSuchObject(key))?;
        Ok(match node.parent {
            ParentRef::Root => None,
            _ => Some(self.parent_key_of(node)),
        })
    }

    /// Direct children only, in child-list order.
    pub fn children_of(&self, key: ObjectKey) -> Result<Vec<ObjectKey>, StoreError> {
        let (_, node) = self.node_of(&key).ok_or(StoreError::NoSuchObject(key))?;
        Ok(node
            .children
            .iter()
            .filter_map(|&c| self.objects.resolve(c).map(|n| n.key))
            .collect())
    }

    /// Every handle in the subtree under `start`, start included, collected
    /// iteratively through a work-list.
    fn collect_subtree(&self, start: Handle) -> Vec<Handle> {
        let mut doomed = vec![start];
        let mut at = 0;
        while at < doomed.len() {
            if let Some(node) = self.objects.resolve(doomed[at]) {
                doomed.extend_from_slice(&node.children);
            }
            at += 1;
        }
        doomed
    }

    fn remove_subtree(&mut self, start: Handle) {
        let doomed = self.collect_subtree(start);
        // no fallible work from here on: the cascade runs to completion
        for h in doomed {
            if let Ok(node) = self.objects.release(h) {
                self.lookup.remove(&node.key);
                self.stats.objects_removed += 1;
            }
        }
    }

    /// Cascading removal of `key` and its entire subtree.
    pub fn remove(&mut self, key: ObjectKey) -> Result<(), StoreError> {
        if self.busy {
            return Err(StoreError::Busy);
        }
        if key.is_root() {
            return Err(StoreError::InvalidArgument("the root object stays"));
        }
        let h = self.handle_of(&key).ok_or(StoreError::NoSuchObject(key))?;
        self.detach_child(h);
        let before = self.lookup.len();
        self.remove_subtree(h);
        debug!(
            "removed {} with {} descendants",
            key,
            before - self.lookup.len() - 1
        );
        Ok(())
    }

    /// Empties the store back to a lone root; the root keeps its identity
    /// but loses children and attributes.
    pub fn clear(&mut self) -> Result<(), StoreError> {
        if self.busy {
            return Err(StoreError::Busy);
        }
        let top: Vec<Handle> = match self.objects.resolve(self.root) {
            Some(root) => root.children.clone(),
            None => Vec::new(),
        };
        for h in top {
            self.remove_subtree(h);
        }
        if let Some(root) = self.objects.resolve_mut(self.root) {
            root.children.clear();
            root.attributes.reset();
        }
        Ok(())
    }

    pub fn attribute_set(
        &mut self,
        key: ObjectKey,
        attribute_id: i32,
        value: &[u8],
    ) -> Result<(), StoreError> {
        if self.busy {
            return Err(StoreError::Busy);
        }
        let h = self.handle_of(&key).ok_or(StoreError::NoSuchObject(key))?;
        let node = match self.objects.resolve_mut(h) {
            Some(n) => n,
            None => return Err(StoreError::NoSuchObject(key)),
        };
        let found = match node.attributes.search(&Attribute::probe(attribute_id)) {
            Ok((at, existing)) => Some((at, existing.value().len())),
            Err(IndexError::NotFound) => None,
            Err(e) => return Err(e.into()),
        };
        match found {
            // same length: patch the bytes, ordering untouched
            Some((at, old_len)) if old_len == value.len() => {
                if let Some(a) = node.attributes.get_mut(at) {
                    a.patch_value(value);
                }
            }
            // length changed: fresh record swapped into the same slot,
            // which keeps the ordinal position since the id is the same
            Some((at, _)) => {
                node.attributes.replace(at, Attribute::new(attribute_id, value))?;
            }
            None => {
                if let Err(e) = node.attributes.insert(Attribute::new(attribute_id, value), true) {
                    warn!("attribute {} insert failed on {}: {}", attribute_id, key, e);
                    return Err(e.into());
                }
            }
        }
        self.stats.attribute_sets += 1;
        Ok(())
    }

    /// Stores `value` as an 8-byte simple value (the `SAV` encoding).
    pub fn attribute_set_simple(
        &mut self,
        key: ObjectKey,
        attribute_id: i32,
        value: i64,
    ) -> Result<(), StoreError> {
        self.attribute_set(key, attribute_id, &simple_value_bytes(value))
    }

    pub fn attribute_get(&self, key: ObjectKey, attribute_id: i32) -> Result<&[u8], StoreError> {
        let (_, node) = self.node_of(&key).ok_or(StoreError::NoSuchObject(key))?;
        match node.attributes.search(&Attribute::probe(attribute_id)) {
            Ok((_, a)) => Ok(a.value()),
            Err(IndexError::NotFound) => Err(StoreError::NoSuchAttribute(key, attribute_id)),
            Err(e) => Err(e.into()),
        }
    }

    pub fn attribute_simple(&self, key: ObjectKey, attribute_id: i32) -> Result<i64, StoreError> {
        let (_, node) = self.node_of(&key).ok_or(StoreError::NoSuchObject(key))?;
        match node.attributes.search(&Attribute::probe(attribute_id)) {
            Ok((_, a)) => a
                .as_simple()
                .ok_or(StoreError::InvalidArgument("attribute value is not simple")),
            Err(IndexError::NotFound) => Err(StoreError::NoSuchAttribute(key, attribute_id)),
            Err(e) => Err(e.into()),
        }
    }

    pub fn attribute_exists(&self, key: ObjectKey, attribute_id: i32) -> bool {
        match self.node_of(&key) {
            Some((_, node)) => node
                .attributes
                .search(&Attribute::probe(attribute_id))
                .is_ok(),
            None => false,
        }
    }

    /// Attribute ids of `key` in index (ascending id) order.
    pub fn attribute_ids(&self, key: ObjectKey) -> Result<Vec<i32>, StoreError> {
        let (_, node) = self.node_of(&key).ok_or(StoreError::NoSuchObject(key))?;
        Ok(node.attributes.iter().map(|a| a.id()).collect())
    }

    pub fn attribute_remove(
        &mut self,
        key: ObjectKey,
        attribute_id: i32,
    ) -> Result<(), StoreError> {
        if self.busy {
            return Err(StoreError::Busy);
        }
        let shrink = self.config.attribute_expansion;
        let h = self.handle_of(&key).ok_or(StoreError::NoSuchObject(key))?;
        let node = match self.objects.resolve_mut(h) {
            Some(n) => n,
            None => return Err(StoreError::NoSuchObject(key)),
        };
        match node.attributes.remove(&Attribute::probe(attribute_id), shrink) {
            Ok(_) => {
                self.stats.attribute_removes += 1;
                Ok(())
            }
            Err(IndexError::NotFound) => Err(StoreError::NoSuchAttribute(key, attribute_id)),
            Err(e) => Err(e.into()),
        }
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = StoreStats::default();
        self.objects.reset_stats();
    }

    /// One JSON document with the store, arena and config counters.
    pub fn stats_report(&self) -> String {
        #[derive(Serialize)]
        struct Report<'a> {
            config: &'a StoreConfig,
            objects: usize,
            store: &'a StoreStats,
            arena: PoolStats,
        }
        let report = Report {
            config: &self.config,
            objects: self.object_count(),
            store: &self.stats,
            arena: self.objects.stats(),
        };
        serde_json::to_string_pretty(&report).unwrap_or_default()
    }
}
