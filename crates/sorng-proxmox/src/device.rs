//! Structured device descriptors and the tables that hold them.

use crate::value::DeviceValue;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Index → descriptor for every disk, or every NIC, of one VM.
///
/// Index `n` maps to the remote names `virtio{n}` / `net{n}`.
pub type DeviceTable = BTreeMap<u32, QemuDevice>;

/// Attributes of a single disk or network interface.
///
/// Keys such as `type`, `storage`, `size`, `cache`, `bridge` and `macaddr`
/// are interpreted by the codec; anything else is passed through as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QemuDevice(BTreeMap<String, DeviceValue>);

impl QemuDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&DeviceValue> {
        self.0.get(key)
    }

    /// String view of an attribute. Integers and booleans are rendered,
    /// so `size: 20` and `size: "20G"` can both be read here.
    pub fn get_string(&self, key: &str) -> Option<String> {
        self.0.get(key).map(|v| v.to_string())
    }

    /// Like [`get_string`](Self::get_string) but treats an empty string as absent.
    pub fn get_non_empty(&self, key: &str) -> Option<String> {
        self.get_string(key).filter(|s| !s.is_empty())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<DeviceValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<DeviceValue> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Attributes in ascending key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &DeviceValue)> {
        self.0.iter()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<DeviceValue>) -> Self {
        self.insert(key, value);
        self
    }
}

impl<K: Into<String>, V: Into<DeviceValue>> FromIterator<(K, V)> for QemuDevice {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

// ── Codec parameters ────────────────────────────────────────────────

/// Which table a descriptor belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Disk,
    Network,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disk => f.write_str("disk"),
            Self::Network => f.write_str("network"),
        }
    }
}

/// Create calls let the API allocate disks; update calls must name the
/// backing file explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionMode {
    Create,
    Update,
}

impl fmt::Display for ActionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => f.write_str("create"),
            Self::Update => f.write_str("update"),
        }
    }
}

/// How to treat a non-positional segment that is not `key=value`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodeMode {
    /// Skip it.
    #[default]
    Lenient,
    /// Fail the decode with a malformed-data error.
    Strict,
}
