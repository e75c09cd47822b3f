//! Namespaced property storage for messages and projects.
//!
//! Properties are flat `dot.separated` keys mapped to JSON values. Known
//! properties get typed accessors; anything else stays reachable through
//! [`PropertyMap::get`] / [`PropertyMap::set`] for extension metadata.

use crate::events::{Event, EventBus, PropertyTarget};
use crate::models::{Address, MessageKey};
use crate::storage::{Store, StoreError};
use serde::de::Deserializer;
use serde::ser::{Error as _, SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Well-known property names.
pub mod names {
    pub const OBSOLETED_BY: &str = "obsoleted-by";
    pub const REVIEWED: &str = "reviewed";
    pub const REVIEWERS: &str = "reviewers";
    pub const GIT_HEAD: &str = "git.head";
    pub const GIT_REPO: &str = "git.repo";
    pub const GIT_TAG: &str = "git.tag";
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyMap(BTreeMap<String, Value>);

impl PropertyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Store `value` under `name`, returning the previous value.
    pub fn set(&mut self, name: &str, value: Value) -> Option<Value> {
        self.0.insert(name.to_string(), value)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.0.remove(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    pub fn get_bool(&self, name: &str) -> bool {
        self.0.get(name).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Iterate over every property inside the `namespace.` prefix.
    pub fn namespace<'a>(&'a self, namespace: &'a str) -> impl Iterator<Item = (&'a str, &'a Value)> + 'a {
        self.0.iter().filter_map(move |(key, value)| {
            key.strip_prefix(namespace)
                .and_then(|rest| rest.strip_prefix('.'))
                .map(|_| (key.as_str(), value))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(key, value)| (key.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn obsoleted_by(&self) -> Option<&str> {
        self.get_str(names::OBSOLETED_BY)
    }

    pub fn reviewed(&self) -> bool {
        self.get_bool(names::REVIEWED)
    }

    pub fn reviewers(&self) -> Vec<Address> {
        self.0
            .get(names::REVIEWERS)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or_default()
    }

    pub fn git_head(&self) -> Option<&str> {
        self.get_str(names::GIT_HEAD)
    }
}

// Values are written as JSON text so that non self-describing formats
// (bincode snapshots) can carry arbitrary JSON.
impl Serialize for PropertyMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in &self.0 {
            let text = serde_json::to_string(value).map_err(S::Error::custom)?;
            map.serialize_entry(key, &text)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for PropertyMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, String>::deserialize(deserializer)?;
        let mut map = BTreeMap::new();
        for (key, text) in raw {
            let value = serde_json::from_str(&text).map_err(serde::de::Error::custom)?;
            map.insert(key, value);
        }
        Ok(PropertyMap(map))
    }
}

/// Serde adapter storing a single JSON value as text.
pub(crate) mod json_text {
    use serde::de::Deserializer;
    use serde::ser::{Error as _, Serializer};
    use serde::Deserialize;
    use serde_json::Value;

    pub fn serialize<S: Serializer>(value: &Value, serializer: S) -> Result<S::Ok, S::Error> {
        let text = serde_json::to_string(value).map_err(S::Error::custom)?;
        serializer.serialize_str(&text)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Value, D::Error> {
        let text = String::deserialize(deserializer)?;
        serde_json::from_str(&text).map_err(serde::de::Error::custom)
    }
}

/// Set (or with `None`, delete) a message property and emit `SetProperty`
/// when the stored value actually changed.
///
/// Returns `true` if the property changed.
pub(crate) fn write_message_property(
    store: &dyn Store,
    bus: &EventBus,
    key: &MessageKey,
    name: &str,
    value: Option<Value>,
) -> Result<bool, StoreError> {
    let mut old_value = None;
    let mut changed = false;
    store.update(key, &mut |message| {
        let current = message.properties.get(name).cloned();
        if current == value {
            return;
        }
        changed = true;
        old_value = match &value {
            Some(new) => message.properties.set(name, new.clone()),
            None => message.properties.remove(name),
        };
    })?;

    if changed {
        log::debug!("property {} on {} set to {:?}", name, key, value);
        bus.emit(Event::SetProperty {
            target: PropertyTarget::Message(key.clone()),
            name: name.to_string(),
            value,
            old_value,
        });
    }
    Ok(changed)
}
