//! Shared types for Proxmox VE provisioning.

use crate::retry::RetryPolicy;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Connection / Config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Top-level configuration for talking to a Proxmox VE API endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxmoxConfig {
    /// Node or cluster hostname / IP (e.g. "pve1.lab.local")
    pub host: String,
    /// Port (default 8006)
    #[serde(default = "default_port")]
    pub port: u16,
    /// API token id, `user@realm!tokenname`
    pub token_id: String,
    /// API token secret (UUID)
    pub token_secret: String,
    /// Skip TLS certificate verification (self-signed clusters)
    #[serde(default)]
    pub insecure: bool,
    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// How long to wait for a locked VM config to settle
    #[serde(default)]
    pub lock_retry: RetryPolicy,
}

fn default_port() -> u16 { 8006 }
fn default_timeout() -> u64 { 30 }

impl Default for ProxmoxConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 8006,
            token_id: String::new(),
            token_secret: String::new(),
            insecure: false,
            timeout_secs: 30,
            lock_retry: RetryPolicy::default(),
        }
    }
}

/// Config view without the token secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxmoxConfigSafe {
    pub host: String,
    pub port: u16,
    pub token_id: String,
    pub insecure: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  VM identity
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Addresses one QEMU guest on the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VmRef {
    pub vmid: u32,
    pub node: String,
}

impl VmRef {
    pub fn new(vmid: u32, node: impl Into<String>) -> Self {
        Self { vmid, node: node.into() }
    }
}

impl fmt::Display for VmRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/qemu/{}", self.node, self.vmid)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Wire maps
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Flat VM configuration as returned by `GET …/qemu/{vmid}/config`.
pub type FlatConfig = BTreeMap<String, Value>;

/// Parameters sent to create / clone / config endpoints.
pub type ParamMap = BTreeMap<String, Value>;

/// Render one parameter the way the API expects it in a form body.
pub fn param_to_form_value(value: &Value) -> String {
    match value {
        Value::Bool(true) => "1".to_string(),
        Value::Bool(false) => "0".to_string(),
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  VM status / listing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Running,
    Stopped,
    Paused,
    #[serde(other)]
    Unknown,
}

impl Default for VmStatus {
    fn default() -> Self { Self::Unknown }
}

impl VmStatus {
    pub fn from_api(status: &str) -> Self {
        match status {
            "running" => Self::Running,
            "stopped" => Self::Stopped,
            "paused" => Self::Paused,
            _ => Self::Unknown,
        }
    }
}

/// One row of `GET /cluster/resources?type=vm`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmListEntry {
    pub vmid: u32,
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, rename = "type")]
    pub vm_type: Option<String>,
}
