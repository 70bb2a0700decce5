//! Scalar values carried by device attributes and the rules for moving
//! them between typed and flat form.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One device attribute value.
///
/// Untagged so that structured literals can write `"size": "20G"`,
/// `"tag": 30` or `"firewall": true` directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeviceValue {
    Int(i64),
    Bool(bool),
    Str(String),
}

impl DeviceValue {
    /// Infer the type of a flat scalar.
    ///
    /// Integer wins over boolean, so `"1"` stays `Int(1)`; only the
    /// literals `true` / `false` become booleans. Never fails.
    pub fn coerce(raw: &str) -> Self {
        if let Ok(i) = raw.parse::<i64>() {
            return Self::Int(i);
        }
        match raw {
            "true" => Self::Bool(true),
            "false" => Self::Bool(false),
            _ => Self::Str(raw.to_string()),
        }
    }

    /// Form used inside a `key=value` segment, or `None` when the value
    /// should be left out entirely (false, empty, zero or negative).
    pub fn to_param(&self) -> Option<String> {
        match self {
            Self::Bool(true) => Some("1".to_string()),
            Self::Bool(false) => None,
            Self::Str(s) if s.is_empty() => None,
            Self::Str(s) => Some(s.clone()),
            Self::Int(i) if *i <= 0 => None,
            Self::Int(i) => Some(i.to_string()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Bool(b) => write!(f, "{}", if *b { 1 } else { 0 }),
            Self::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for DeviceValue {
    fn from(v: i64) -> Self { Self::Int(v) }
}

impl From<i32> for DeviceValue {
    fn from(v: i32) -> Self { Self::Int(v.into()) }
}

impl From<u32> for DeviceValue {
    fn from(v: u32) -> Self { Self::Int(v.into()) }
}

impl From<bool> for DeviceValue {
    fn from(v: bool) -> Self { Self::Bool(v) }
}

impl From<&str> for DeviceValue {
    fn from(v: &str) -> Self { Self::Str(v.to_string()) }
}

impl From<String> for DeviceValue {
    fn from(v: String) -> Self { Self::Str(v) }
}
