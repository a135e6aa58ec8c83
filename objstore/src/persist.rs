use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::{FromStr, SplitWhitespace};

use handle_pool::Handle;
use log::{debug, warn};

use crate::attributes::simple_value_bytes;
use crate::store::{ObjectKey, ObjectStore, ParentRef, StoreError};

const OBJECT_TAG: &str = "OBJ";
const ATTRIBUTE_TAG: &str = "AID";
const SIMPLE_VALUE_TAG: &str = "SAV";
const COMPLEX_VALUE_TAG: &str = "CAV";

fn next_int<T: FromStr>(tokens: &mut SplitWhitespace<'_>) -> Result<T, StoreError> {
    let tok = tokens
        .next()
        .ok_or_else(|| StoreError::Format("record cut short".to_string()))?;
    tok.parse()
        .map_err(|_| StoreError::Format(format!("bad integer {:?}", tok)))
}

impl ObjectStore {
    /// `om_<store_id>`, the live file name inside the save directory.
    pub fn store_file_name(&self) -> String {
        format!("om_{}", self.config.store_id)
    }

    /// Writes the whole store under `dir`, rotating the previous backup to
    /// `_BACKUP_tmp` and the previous live file to `_BACKUP` first.  The
    /// walk goes over the lookup map, not the parent/child tree, so no
    /// recursion and no order guarantee; load copes with either.  Not
    /// transactional: a failed write leaves the rotated backup behind.
    pub fn save(&mut self, dir: &Path) -> Result<(), StoreError> {
        let live = dir.join(self.store_file_name());
        let backup = dir.join(format!("{}_BACKUP", self.store_file_name()));
        let backup_tmp = dir.join(format!("{}_BACKUP_tmp", self.store_file_name()));

        // rotation failures are the normal case on a first save
        let _ = fs::remove_file(&backup_tmp);
        let _ = fs::rename(&backup, &backup_tmp);
        let _ = fs::rename(&live, &backup);

        let mut out = BufWriter::new(File::create(&live)?);
        for (&key, &h) in self.lookup.iter() {
            let node = match self.objects.resolve(h) {
                Some(n) => n,
                None => continue,
            };
            let parent = self.parent_key_of(node);
            writeln!(
                out,
                "{} {} {} {} {}",
                OBJECT_TAG,
                parent.object_type,
                parent.object_instance,
                key.object_type,
                key.object_instance
            )?;
            for attribute in node.attributes.iter() {
                writeln!(out, "  {} {}", ATTRIBUTE_TAG, attribute.id())?;
                match attribute.as_simple() {
                    Some(v) => writeln!(out, "    {} 1 {}", SIMPLE_VALUE_TAG, v)?,
                    None => {
                        write!(
                            out,
                            "    {} 1 {}",
                            COMPLEX_VALUE_TAG,
                            attribute.value().len()
                        )?;
                        for byte in attribute.value() {
                            write!(out, " {}", byte)?;
                        }
                        writeln!(out)?;
                    }
                }
            }
        }
        out.flush()?;
        self.stats.saves += 1;
        debug!(
            "store {} saved, {} objects",
            self.config.store_id,
            self.lookup.len()
        );
        Ok(())
    }

    /// Replaces the store contents with the file under `dir`.
    ///
    /// Two passes: the first creates every object, leaving parent keys
    /// unresolved whenever the parent has not been created yet; the second
    /// resolves all of them now that the full set exists.  One pass would
    /// break on any file where a child precedes its parent.
    ///
    /// On a parse error the store stays re-initialized with whatever loaded
    /// before the bad record.
    pub fn load(&mut self, dir: &Path) -> Result<(), StoreError> {
        if self.busy {
            return Err(StoreError::Busy);
        }
        let text = fs::read_to_string(dir.join(self.store_file_name()))?;
        *self = ObjectStore::new(self.config.clone())?;

        let mut tokens = text.split_whitespace();
        let mut current_object: Option<ObjectKey> = None;
        let mut current_attribute: Option<i32> = None;
        while let Some(tag) = tokens.next() {
            match tag {
                OBJECT_TAG => {
                    let parent = ObjectKey::new(next_int(&mut tokens)?, next_int(&mut tokens)?);
                    let key = ObjectKey::new(next_int(&mut tokens)?, next_int(&mut tokens)?);
                    self.create_node(parent, key)?;
                    current_object = Some(key);
                    current_attribute = None;
                }
                ATTRIBUTE_TAG => {
                    let id = next_int(&mut tokens)?;
                    let key = current_object
                        .ok_or_else(|| StoreError::Format("AID before any OBJ".to_string()))?;
                    self.attribute_set(key, id, &[])?;
                    current_attribute = Some(id);
                }
                SIMPLE_VALUE_TAG => {
                    let (key, id) = self.value_context(current_object, current_attribute)?;
                    let _ref_count: i64 = next_int(&mut tokens)?;
                    let value: i64 = next_int(&mut tokens)?;
                    self.attribute_set(key, id, &simple_value_bytes(value))?;
                }
                COMPLEX_VALUE_TAG => {
                    let (key, id) = self.value_context(current_object, current_attribute)?;
                    let _ref_count: i64 = next_int(&mut tokens)?;
                    let length: usize = next_int(&mut tokens)?;
                    let mut value = Vec::with_capacity(length);
                    for _ in 0..length {
                        value.push(next_int::<u8>(&mut tokens)?);
                    }
                    self.attribute_set(key, id, &value)?;
                }
                other => {
                    warn!("store file for {} has record {:?}", self.config.store_id, other);
                    return Err(StoreError::Format(format!("unknown record tag {:?}", other)));
                }
            }
        }
        self.resolve_all_parents();
        self.stats.loads += 1;
        debug!(
            "store {} loaded, {} objects",
            self.config.store_id,
            self.lookup.len()
        );
        Ok(())
    }

    fn value_context(
        &self,
        object: Option<ObjectKey>,
        attribute: Option<i32>,
    ) -> Result<(ObjectKey, i32), StoreError> {
        match (object, attribute) {
            (Some(key), Some(id)) => Ok((key, id)),
            _ => Err(StoreError::Format(
                "value record outside an attribute context".to_string(),
            )),
        }
    }

    /// Second load pass: every object still carrying a parent key gets the
    /// direct reference, and with it the child-list membership, now that
    /// the full object set exists.  Parents that never appeared stay
    /// unresolved, as in a partially loaded store.
    fn resolve_all_parents(&mut self) {
        let handles: Vec<Handle> = self.lookup.values().copied().collect();
        for h in handles {
            let pending = match self.objects.resolve(h) {
                Some(node) => match node.parent {
                    ParentRef::Unresolved(key) => Some(key),
                    _ => None,
                },
                None => None,
            };
            let Some(parent_key) = pending else { continue };
            let Some(parent) = self.handle_of(&parent_key) else {
                continue;
            };
            if parent == h {
                continue;
            }
            if let Some(node) = self.objects.resolve_mut(h) {
                node.parent = ParentRef::Resolved(parent);
            }
            self.attach_child(parent, h);
        }
    }
}
