//! QEMU VM specification and its translation to and from the flat
//! configuration map.

use crate::codec::{decode_disk, decode_network, DeviceCodec};
use crate::device::{ActionMode, DecodeMode, DeviceKind, DeviceTable};
use crate::error::{ProxmoxError, ProxmoxResult};
use crate::legacy::{effective_disks, effective_networks};
use crate::types::{FlatConfig, ParamMap, VmRef};

use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::io::Read;

lazy_static! {
    static ref DISK_KEY: Regex = Regex::new(r"^(virtio)(\d+)$").unwrap();
    static ref NIC_KEY: Regex = Regex::new(r"^net(\d+)$").unwrap();
}

/// Full-clone flag used when neither the spec nor the remote config sets one.
pub const DEFAULT_FULL_CLONE: i32 = 1;

/// Desired (or observed) shape of one QEMU VM.
///
/// JSON field names follow the structured literal format, e.g.
///
/// ```json
/// {"name": "vm1", "cores": 2, "sockets": 1, "memory": 2048,
///  "disk": {"0": {"type": "virtio", "storage": "local", "size": "20G"}},
///  "network": {"0": {"model": "virtio", "bridge": "vmbr0"}}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QemuConfig {
    pub name: String,
    #[serde(rename = "desc")]
    pub description: String,
    pub onboot: bool,
    /// MiB
    pub memory: u32,
    /// Default storage target (clone target, legacy disk storage).
    pub storage: String,
    /// Storage class of `storage` (`dir`, `lvmthin`, `zfspool`, ...). Only
    /// read for the legacy disk, where update mode needs it to name the file.
    pub storage_type: String,
    #[serde(rename = "os")]
    pub os_type: String,
    pub cores: u32,
    pub sockets: u32,
    /// ISO volume for `ide2`, e.g. `local:iso/debian-12.iso`.
    pub iso: String,
    #[serde(rename = "disk")]
    pub disks: DeviceTable,
    #[serde(rename = "network")]
    pub networks: DeviceTable,
    #[serde(rename = "fullclone")]
    pub full_clone: Option<i32>,

    // Deprecated single-device fields, see `legacy`.
    #[serde(rename = "nic")]
    pub nic_model: String,
    pub bridge: String,
    #[serde(rename = "vlan")]
    pub vlan_tag: i32,
    #[serde(rename = "diskGB")]
    pub disk_size: f64,
}

impl Default for QemuConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            onboot: false,
            memory: 0,
            storage: String::new(),
            storage_type: String::new(),
            os_type: String::new(),
            cores: 0,
            sockets: 0,
            iso: String::new(),
            disks: DeviceTable::new(),
            networks: DeviceTable::new(),
            full_clone: None,
            nic_model: String::new(),
            bridge: String::new(),
            vlan_tag: -1,
            disk_size: 0.0,
        }
    }
}

/// Parameters for one API call plus the MACs generated while encoding them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncodedParams {
    pub params: ParamMap,
    /// NIC index → generated MAC
    pub generated_macs: BTreeMap<u32, String>,
}

impl QemuConfig {
    // ── Construction ────────────────────────────────────────────────

    /// Parse a structured JSON literal.
    pub fn from_json<R: Read>(reader: R) -> ProxmoxResult<Self> {
        let config: Self = serde_json::from_reader(reader)?;
        debug!("Loaded QEMU spec '{}' ({} disks, {} NICs)", config.name, config.disks.len(), config.networks.len());
        Ok(config)
    }

    /// Rebuild a spec from a remote config map (which must already be unlocked).
    pub fn from_flat_config(remote: &FlatConfig, mode: DecodeMode) -> ProxmoxResult<Self> {
        let mut config = Self {
            name: required_str(remote, "name")?,
            description: optional_str(remote, "description")
                .map(|d| d.trim().to_string())
                .unwrap_or_default(),
            onboot: optional_int(remote, "onboot")?.map(|v| v != 0).unwrap_or(false),
            os_type: required_str(remote, "ostype")?,
            memory: required_u32(remote, "memory")?,
            cores: required_u32(remote, "cores")?,
            sockets: required_u32(remote, "sockets")?,
            full_clone: Some(match optional_int(remote, "fullclone")? {
                Some(v) => i32::try_from(v).map_err(|_| {
                    ProxmoxError::malformed(format!("config field 'fullclone' out of range: {v}"))
                })?,
                None => DEFAULT_FULL_CLONE,
            }),
            ..Self::default()
        };

        if let Some(ide2) = optional_str(remote, "ide2") {
            config.iso = match ide2.find(",media") {
                Some(pos) => ide2[..pos].to_string(),
                None => ide2,
            };
        }

        for (key, value) in remote {
            if let Some(caps) = DISK_KEY.captures(key) {
                let index = parse_index(key, &caps[2])?;
                let raw = device_string(key, value)?;
                let dev = decode_disk(&caps[1], raw, mode)?;
                if !dev.is_empty() {
                    config.disks.insert(index, dev);
                }
            } else if let Some(caps) = NIC_KEY.captures(key) {
                let index = parse_index(key, &caps[1])?;
                let raw = device_string(key, value)?;
                let dev = decode_network(raw, mode)?;
                if !dev.is_empty() {
                    config.networks.insert(index, dev);
                }
            }
        }

        Ok(config)
    }

    // ── Parameter building ──────────────────────────────────────────

    /// Parameters for `POST /nodes/{node}/qemu`.
    pub fn create_params(&self, vmid: u32) -> ProxmoxResult<EncodedParams> {
        let mut params = ParamMap::new();
        params.insert("vmid".into(), json!(vmid));
        params.insert("name".into(), json!(self.name));
        params.insert("onboot".into(), json!(self.onboot));
        params.insert("ostype".into(), json!(self.os_type));
        params.insert("sockets".into(), json!(self.sockets));
        params.insert("cores".into(), json!(self.cores));
        params.insert("cpu".into(), json!("host"));
        params.insert("memory".into(), json!(self.memory));
        params.insert("description".into(), json!(self.description));
        if !self.iso.is_empty() {
            params.insert("ide2".into(), json!(format!("{},media=cdrom", self.iso)));
        }

        self.encode_devices(ActionMode::Create, vmid, params)
    }

    /// Parameters for `POST /nodes/{node}/qemu/{vmid}/config`.
    pub fn update_params(&self, vmid: u32) -> ProxmoxResult<EncodedParams> {
        let mut params = ParamMap::new();
        params.insert("description".into(), json!(self.description));
        params.insert("onboot".into(), json!(self.onboot));
        params.insert("sockets".into(), json!(self.sockets));
        params.insert("cores".into(), json!(self.cores));
        params.insert("memory".into(), json!(self.memory));

        self.encode_devices(ActionMode::Update, vmid, params)
    }

    /// Parameters for `POST /nodes/{node}/qemu/{source}/clone`.
    pub fn clone_params(&self, target: &VmRef) -> ParamMap {
        let mut params = ParamMap::new();
        params.insert("newid".into(), json!(target.vmid));
        params.insert("target".into(), json!(target.node));
        params.insert("name".into(), json!(self.name));
        params.insert(
            "full".into(),
            json!(self.full_clone.unwrap_or(DEFAULT_FULL_CLONE)),
        );
        // storage is only accepted for full clones
        if !self.storage.is_empty() {
            params.insert("storage".into(), json!(self.storage));
        }
        params
    }

    fn encode_devices(
        &self,
        mode: ActionMode,
        vmid: u32,
        mut params: ParamMap,
    ) -> ProxmoxResult<EncodedParams> {
        let codec = DeviceCodec::new(mode);

        for enc in codec.encode_table(DeviceKind::Disk, vmid, &effective_disks(self))? {
            params.insert(enc.key, Value::String(enc.value));
        }

        let mut generated_macs = BTreeMap::new();
        for enc in codec.encode_table(DeviceKind::Network, vmid, &effective_networks(self))? {
            if let Some(mac) = enc.generated_mac {
                generated_macs.insert(enc.index, mac);
            }
            params.insert(enc.key, Value::String(enc.value));
        }

        Ok(EncodedParams { params, generated_macs })
    }

    /// Record generated MACs on the matching NIC entries so callers see
    /// them. NICs synthesized from the flat fields have no entry to update.
    pub fn apply_generated_macs(&mut self, macs: &BTreeMap<u32, String>) {
        for (index, mac) in macs {
            if let Some(dev) = self.networks.get_mut(index) {
                dev.insert("macaddr", mac.as_str());
            }
        }
    }
}

// ── Flat map field access ───────────────────────────────────────────

fn optional_str(remote: &FlatConfig, key: &str) -> Option<String> {
    match remote.get(key) {
        Some(Value::String(s)) => Some(s.clone()),
        _ => None,
    }
}

fn required_str(remote: &FlatConfig, key: &str) -> ProxmoxResult<String> {
    match remote.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(ProxmoxError::malformed(format!(
            "config field '{key}' should be a string, got {other}"
        ))),
        None => Err(ProxmoxError::malformed(format!("config field '{key}' is missing"))),
    }
}

/// Numbers may arrive as JSON numbers or numeric strings.
fn optional_int(remote: &FlatConfig, key: &str) -> ProxmoxResult<Option<i64>> {
    match remote.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .map(Some)
            .ok_or_else(|| ProxmoxError::malformed(format!("config field '{key}' is not an integer"))),
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| ProxmoxError::malformed(format!("config field '{key}' is not an integer: '{s}'"))),
        Some(Value::Bool(b)) => Ok(Some(i64::from(*b))),
        Some(other) => Err(ProxmoxError::malformed(format!(
            "config field '{key}' has unexpected shape: {other}"
        ))),
    }
}

fn required_u32(remote: &FlatConfig, key: &str) -> ProxmoxResult<u32> {
    let value = optional_int(remote, key)?
        .ok_or_else(|| ProxmoxError::malformed(format!("config field '{key}' is missing")))?;
    u32::try_from(value)
        .map_err(|_| ProxmoxError::malformed(format!("config field '{key}' out of range: {value}")))
}

fn parse_index(key: &str, digits: &str) -> ProxmoxResult<u32> {
    digits
        .parse()
        .map_err(|_| ProxmoxError::malformed(format!("device key '{key}' has an invalid index")))
}

fn device_string<'a>(key: &str, value: &'a Value) -> ProxmoxResult<&'a str> {
    value.as_str().ok_or_else(|| {
        ProxmoxError::malformed(format!("device '{key}' should be a string, got {value}"))
    })
}
