//! Per-device state store.

use std::collections::HashMap;

use espbridge_common::StateValue;
use parking_lot::Mutex;

/// Address of a stored value: the per-epoch numeric key, or the stable object id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StateKey {
    Key(u32),
    Id(String),
}

impl From<u32> for StateKey {
    fn from(key: u32) -> Self {
        StateKey::Key(key)
    }
}

impl From<&str> for StateKey {
    fn from(id: &str) -> Self {
        StateKey::Id(id.to_string())
    }
}

impl From<String> for StateKey {
    fn from(id: String) -> Self {
        StateKey::Id(id)
    }
}

/// Last-known value of every entity of one device.
///
/// Values are keyed both by numeric key and, when known, by object id.
/// NaN numbers are never stored.
#[derive(Debug, Default)]
pub struct StateStore {
    values: Mutex<HashMap<StateKey, StateValue>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value. Returns `false` if the value was discarded.
    pub fn set(&self, key: impl Into<StateKey>, value: StateValue) -> bool {
        if value.is_nan() {
            return false;
        }
        self.values.lock().insert(key.into(), value);
        true
    }

    /// Store a value under its numeric key and mirror it under its object id.
    ///
    /// Both writes happen under one lock so readers never see them diverge.
    pub fn set_mirrored(&self, key: u32, object_id: Option<&str>, value: StateValue) -> bool {
        if value.is_nan() {
            return false;
        }
        let mut values = self.values.lock();
        if let Some(id) = object_id {
            values.insert(StateKey::Id(id.to_string()), value.clone());
        }
        values.insert(StateKey::Key(key), value);
        true
    }

    /// Current value, or `None` when nothing has been reported.
    pub fn get(&self, key: impl Into<StateKey>) -> Option<StateValue> {
        self.values.lock().get(&key.into()).cloned()
    }

    /// Point-in-time copy of every value.
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            values: self.values.lock().clone(),
        }
    }

    /// Drop values addressed by numeric key.
    ///
    /// Called when a new epoch renumbers entities; object-id mirrors survive.
    pub fn clear_numeric_keys(&self) {
        self.values
            .lock()
            .retain(|key, _| matches!(key, StateKey::Id(_)));
    }

    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.lock().is_empty()
    }
}

/// Consistent copy of a [`StateStore`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateSnapshot {
    values: HashMap<StateKey, StateValue>,
}

impl StateSnapshot {
    pub fn get(&self, key: &StateKey) -> Option<&StateValue> {
        self.values.get(key)
    }

    /// Value mirrored under an object id.
    pub fn by_id(&self, object_id: &str) -> Option<&StateValue> {
        self.values.get(&StateKey::Id(object_id.to_string()))
    }

    pub fn by_key(&self, key: u32) -> Option<&StateValue> {
        self.values.get(&StateKey::Key(key))
    }

    /// Numeric value mirrored under an object id.
    pub fn number(&self, object_id: &str) -> Option<f64> {
        self.by_id(object_id).and_then(StateValue::as_f64)
    }

    /// Loose truthiness of the value mirrored under an object id.
    pub fn truthy(&self, object_id: &str) -> bool {
        self.by_id(object_id).is_some_and(StateValue::is_truthy)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&StateKey, &StateValue)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
