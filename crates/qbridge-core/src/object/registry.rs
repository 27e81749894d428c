//! Object registry with reference accounting.
//!
//! An object stays registered while the client references it explicitly,
//! while another object's marshaled properties point at it, or while its
//! grace period after the last reference is running.

use super::AnyNode;
use crate::config::ProtocolConfig;
use crate::introspect::builder::TypeCache;
use crate::introspect::{MarshalContext, TypeInfo};
use crate::{BridgeError, Result};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

struct Entry {
    node: Arc<dyn AnyNode>,
    type_info: Arc<TypeInfo>,
    referenced: bool,
    pinned: bool,
    /// Number of distinct objects whose properties point here.
    ref_count: usize,
    /// Objects reached through this object's properties, with multiplicity.
    children: HashMap<String, usize>,
    grace_until: Instant,
}

impl Entry {
    fn is_unreferenced(&self) -> bool {
        !self.referenced && self.ref_count == 0
    }

    fn refs_changed(&mut self, now: Instant, grace_period: Duration) {
        if self.is_unreferenced() {
            self.grace_until = now + grace_period;
        }
    }
}

pub(crate) struct Registry {
    entries: HashMap<String, Entry>,
    types: TypeCache,
    /// Type names the client has seen on a referenced object.
    acknowledged: HashSet<String>,
    grace_period: Duration,
}

impl Registry {
    pub(crate) fn new(grace_period: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            types: TypeCache::default(),
            acknowledged: HashSet::new(),
            grace_period,
        }
    }

    pub(crate) fn set_grace_period(&mut self, grace_period: Duration) {
        self.grace_period = grace_period;
    }

    pub(crate) fn types(&mut self) -> &mut TypeCache {
        &mut self.types
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub(crate) fn node(&self, id: &str) -> Option<Arc<dyn AnyNode>> {
        self.entries.get(id).map(|e| e.node.clone())
    }

    pub(crate) fn type_info(&self, id: &str) -> Option<Arc<TypeInfo>> {
        self.entries.get(id).map(|e| e.type_info.clone())
    }

    pub(crate) fn is_referenced(&self, id: &str) -> Option<bool> {
        self.entries.get(id).map(|e| e.referenced)
    }

    #[cfg(test)]
    pub(crate) fn ref_count(&self, id: &str) -> Option<usize> {
        self.entries.get(id).map(|e| e.ref_count)
    }

    /// Register a node, returning its identifier.
    ///
    /// A node that is already registered is left alone. A node that has an
    /// identity but no entry was evicted earlier and is reactivated under
    /// the same identifier without running its init hook again.
    pub(crate) fn register(
        &mut self,
        node: Arc<dyn AnyNode>,
        explicit_id: Option<&str>,
    ) -> Result<String> {
        if let Some(id) = node.id() {
            let id = id.to_string();
            if let Some(wanted) = explicit_id {
                if wanted != id {
                    return Err(BridgeError::Other(format!(
                        "object {} cannot be registered again as {}",
                        id, wanted
                    )));
                }
            }
            if let Some(entry) = self.entries.get(&id) {
                if std::ptr::addr_eq(Arc::as_ptr(&entry.node), Arc::as_ptr(&node)) {
                    return Ok(id);
                }
                return Err(BridgeError::DuplicateIdentifier { identifier: id });
            }

            let type_info = node.prepare(&mut self.types)?;
            self.insert(id.clone(), node, type_info);
            debug!(identifier = %id, "Reactivated object");
            return Ok(id);
        }

        let type_info = node.prepare(&mut self.types)?;
        let id = match explicit_id {
            Some(id) => id.to_string(),
            None => Uuid::new_v4().to_string(),
        };
        if self.entries.contains_key(&id) {
            return Err(BridgeError::DuplicateIdentifier { identifier: id });
        }

        node.assign_id(&id);
        debug!(identifier = %id, type_name = %type_info.name, "Registered object");
        self.insert(id.clone(), node.clone(), type_info);
        node.attached(self)?;
        Ok(id)
    }

    fn insert(&mut self, id: String, node: Arc<dyn AnyNode>, type_info: Arc<TypeInfo>) {
        self.entries.insert(
            id,
            Entry {
                node,
                type_info,
                referenced: false,
                pinned: false,
                ref_count: 0,
                children: HashMap::new(),
                grace_until: Instant::now() + self.grace_period,
            },
        );
    }

    /// Set the explicit client reference flag. Returns false for unknown ids.
    pub(crate) fn set_referenced(&mut self, id: &str, referenced: bool) -> bool {
        let grace_period = self.grace_period;
        let Some(entry) = self.entries.get_mut(id) else {
            return false;
        };
        entry.referenced = referenced;
        if referenced {
            self.acknowledged.insert(entry.type_info.name.clone());
        } else {
            entry.refs_changed(Instant::now(), grace_period);
        }
        true
    }

    /// Exempt an object from collection.
    pub(crate) fn pin(&mut self, id: &str) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.pinned = true;
        }
    }

    /// Restart the grace period of an unreferenced object.
    pub(crate) fn touch(&mut self, id: &str) {
        let grace_period = self.grace_period;
        if let Some(entry) = self.entries.get_mut(id) {
            entry.refs_changed(Instant::now(), grace_period);
        }
    }

    /// Tagged reference map for an object.
    ///
    /// The full descriptor is included until the client has acknowledged
    /// the type by referencing an object of it.
    pub(crate) fn reference_value(&self, id: &str) -> Result<Value> {
        let entry = self.entries.get(id).ok_or_else(|| BridgeError::UnknownObject {
            action: "reference".to_string(),
            identifier: id.to_string(),
        })?;

        let type_value = if self.acknowledged.contains(&entry.type_info.name) {
            json!({ "name": entry.type_info.name, "omitted": true })
        } else {
            serde_json::to_value(&*entry.type_info)?
        };

        let mut map = Map::with_capacity(3);
        map.insert(
            ProtocolConfig::OBJECT_TAG_KEY.to_string(),
            Value::from(ProtocolConfig::OBJECT_TAG_VALUE),
        );
        map.insert("identifier".to_string(), Value::from(id));
        map.insert("type".to_string(), type_value);
        Ok(Value::Object(map))
    }

    /// Marshal all properties of an object and update reference counts
    /// from the children found.
    pub(crate) fn snapshot(&mut self, id: &str) -> Result<Map<String, Value>> {
        let node = self.node(id).ok_or_else(|| BridgeError::UnknownObject {
            action: "marshal".to_string(),
            identifier: id.to_string(),
        })?;

        let mut cx = MarshalContext::new(self);
        let data = node
            .marshal_properties(&mut cx)
            .map_err(|e| BridgeError::Marshal {
                identifier: id.to_string(),
                message: e.to_string(),
            })?;
        let found = cx.into_children();
        self.replace_children(id, found);
        Ok(data)
    }

    fn replace_children(&mut self, id: &str, found: Vec<String>) {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for child in found {
            *counts.entry(child).or_insert(0) += 1;
        }

        let Some(entry) = self.entries.get_mut(id) else {
            return;
        };
        let previous = std::mem::take(&mut entry.children);
        let added: Vec<String> = counts
            .keys()
            .filter(|child| !previous.contains_key(*child))
            .cloned()
            .collect();
        let removed: Vec<String> = previous
            .into_keys()
            .filter(|child| !counts.contains_key(child))
            .collect();
        entry.children = counts;

        for child in &added {
            if let Some(child) = self.entries.get_mut(child) {
                child.ref_count += 1;
            }
        }
        let now = Instant::now();
        for child in &removed {
            self.release(child, now);
        }
    }

    fn release(&mut self, id: &str, now: Instant) {
        let grace_period = self.grace_period;
        if let Some(entry) = self.entries.get_mut(id) {
            entry.ref_count = entry.ref_count.saturating_sub(1);
            entry.refs_changed(now, grace_period);
        }
    }

    /// Evict every unpinned object with no references whose grace period
    /// has elapsed. Evicted objects release the references they held.
    pub(crate) fn collect(&mut self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.pinned && e.is_unreferenced() && now >= e.grace_until)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(entry) = self.entries.remove(id) {
                debug!(identifier = %id, type_name = %entry.type_info.name, "Evicted object");
                for child in entry.children.keys() {
                    self.release(child, now);
                }
            }
        }
        expired
    }
}
