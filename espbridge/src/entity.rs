//! Entity catalog built from discovery.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::Serialize;

use crate::client::EntityDescriptor;

/// Command-relevant entity category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Button,
    Switch,
    Number,
    /// Plain, binary and text sensors.
    Sensor,
    Cover,
    Other,
}

impl EntityKind {
    /// Classify a normalized platform name.
    pub fn from_platform(platform: &str) -> Self {
        match platform {
            "button" => EntityKind::Button,
            "switch" => EntityKind::Switch,
            "number" => EntityKind::Number,
            "cover" => EntityKind::Cover,
            p if p == "sensor" || p.ends_with("_sensor") => EntityKind::Sensor,
            _ => EntityKind::Other,
        }
    }
}

/// Derive a platform name from a protocol message kind.
///
/// `ListEntitiesBinarySensorResponse` becomes `binary_sensor`,
/// `ListEntitiesSensorResponse` becomes `_sensor`, `SwitchInfo` becomes `switch`.
pub fn platform_from_message_kind(message_kind: &str) -> String {
    let mut name = message_kind
        .replace("ListEntities", "")
        .replace("Response", "")
        .to_lowercase();
    if let Some(stripped) = name.strip_suffix("info") {
        name.truncate(stripped.len());
    }
    if !name.ends_with("_sensor") {
        if let Some(prefix) = name.strip_suffix("sensor") {
            name = format!("{prefix}_sensor");
        }
    }
    name
}

/// One discovered entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityRecord {
    pub key: u32,
    pub object_id: Option<String>,
    pub name: String,
    pub unit: Option<String>,
    pub device_class: Option<String>,
    /// Normalized platform name, e.g. `binary_sensor`.
    #[serde(rename = "type")]
    pub platform: String,
    #[serde(skip)]
    pub kind: EntityKind,
}

impl From<EntityDescriptor> for EntityRecord {
    fn from(desc: EntityDescriptor) -> Self {
        let platform = platform_from_message_kind(&desc.message_kind);
        let kind = EntityKind::from_platform(&platform);
        Self {
            key: desc.key,
            object_id: desc.object_id.filter(|id| !id.is_empty()),
            name: desc.name,
            unit: desc.unit,
            device_class: desc.device_class,
            platform,
            kind,
        }
    }
}

/// Entities discovered on one connection epoch.
///
/// Numeric keys are only meaningful within the epoch that produced them.
#[derive(Debug, Clone, Default)]
pub struct EntityCatalog {
    epoch: u64,
    entities: BTreeMap<u32, EntityRecord>,
    by_object_id: HashMap<String, u32>,
}

impl EntityCatalog {
    pub fn from_descriptors(epoch: u64, descriptors: impl IntoIterator<Item = EntityDescriptor>) -> Self {
        let mut entities = BTreeMap::new();
        let mut by_object_id = HashMap::new();

        for desc in descriptors {
            let record = EntityRecord::from(desc);
            if let Some(id) = &record.object_id {
                by_object_id.insert(id.clone(), record.key);
            }
            entities.insert(record.key, record);
        }

        Self {
            epoch,
            entities,
            by_object_id,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn get(&self, key: u32) -> Option<&EntityRecord> {
        self.entities.get(&key)
    }

    /// Look up an entity by its stable object id.
    pub fn lookup(&self, object_id: &str) -> Option<&EntityRecord> {
        self.by_object_id
            .get(object_id)
            .and_then(|key| self.entities.get(key))
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityRecord> {
        self.entities.values()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityKind::Button => "button",
            EntityKind::Switch => "switch",
            EntityKind::Number => "number",
            EntityKind::Sensor => "sensor",
            EntityKind::Cover => "cover",
            EntityKind::Other => "other",
        };
        f.write_str(s)
    }
}
