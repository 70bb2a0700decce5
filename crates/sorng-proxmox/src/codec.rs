//! Flat `key=value` device strings ⇄ [`QemuDevice`].
//!
//! The API stores every disk and NIC as one comma-joined string, e.g.
//!
//! ```text
//! virtio0: local-lvm:vm-101-disk-1,size=20G,cache=writeback
//! net0:    virtio=62:DF:AA:BB:CC:DD,bridge=vmbr0,tag=30
//! ```
//!
//! The first segment is positional (`storage:file` for disks,
//! `model=mac` for NICs); every later segment is `key=value`.

use crate::device::{ActionMode, DecodeMode, DeviceKind, DeviceTable, QemuDevice};
use crate::error::{ProxmoxError, ProxmoxResult};
use crate::mac::generate_mac;
use crate::value::DeviceValue;

use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use std::collections::BTreeSet;

lazy_static! {
    /// Storage classes whose volumes are addressed without a directory / extension.
    static ref BLOCK_STORAGE: Regex = Regex::new(r"(zfspool|lvm)").unwrap();
}

/// Keys consumed explicitly by the disk encoder.
pub const DISK_STRUCTURAL_KEYS: &[&str] =
    &["id", "type", "storage", "storage_type", "size", "cache", "file"];

/// Keys consumed explicitly by the NIC encoder.
pub const NETWORK_STRUCTURAL_KEYS: &[&str] = &["id", "bridge", "macaddr"];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Decode
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Decode a disk string such as `local:iso/x.iso,media=cdrom`.
///
/// `bus` is the non-numeric part of the config key (`virtio`) and is stored
/// under `type`.
pub fn decode_disk(bus: &str, raw: &str, mode: DecodeMode) -> ProxmoxResult<QemuDevice> {
    let mut segments = raw.split(',');
    let positional = segments.next().unwrap_or_default();
    let (storage, file) = positional.split_once(':').ok_or_else(|| {
        ProxmoxError::malformed(format!(
            "{bus} disk '{raw}' has no storage:file token"
        ))
    })?;

    let mut dev = QemuDevice::new()
        .with("type", bus)
        .with("storage", storage)
        .with("file", file);
    read_device_config(&mut dev, segments, mode, raw)?;
    Ok(dev)
}

/// Decode a NIC string such as `virtio=AA:BB:CC:DD:EE:FF,bridge=vmbr0`.
///
/// A bare model (`e1000,bridge=vmbr1`) is accepted and leaves `macaddr` unset.
pub fn decode_network(raw: &str, mode: DecodeMode) -> ProxmoxResult<QemuDevice> {
    let mut segments = raw.split(',');
    let positional = segments.next().unwrap_or_default();
    if positional.is_empty() {
        return Err(ProxmoxError::malformed(format!(
            "network device '{raw}' has no model token"
        )));
    }

    let mut dev = QemuDevice::new();
    match positional.split_once('=') {
        Some((model, mac)) => {
            dev.insert("model", model);
            dev.insert("macaddr", mac);
        }
        None => dev.insert("model", positional),
    }
    read_device_config(&mut dev, segments, mode, raw)?;
    Ok(dev)
}

fn read_device_config<'a>(
    dev: &mut QemuDevice,
    segments: impl Iterator<Item = &'a str>,
    mode: DecodeMode,
    raw: &str,
) -> ProxmoxResult<()> {
    for segment in segments {
        match segment.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                dev.insert(key, DeviceValue::coerce(value));
            }
            _ => match mode {
                DecodeMode::Lenient => {
                    debug!("Skipping malformed device segment '{segment}' in '{raw}'");
                }
                DecodeMode::Strict => {
                    return Err(ProxmoxError::malformed(format!(
                        "segment '{segment}' in '{raw}' is not key=value"
                    )));
                }
            },
        }
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Encode
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One device rendered for the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedDevice {
    pub index: u32,
    /// Config key, e.g. `virtio0` or `net1`.
    pub key: String,
    pub value: String,
    /// MAC filled in because the descriptor had none.
    pub generated_mac: Option<String>,
}

/// Encoder for one action mode.
#[derive(Debug, Clone)]
pub struct DeviceCodec {
    mode: ActionMode,
    disk_ignored: BTreeSet<String>,
    network_ignored: BTreeSet<String>,
}

impl DeviceCodec {
    pub fn new(mode: ActionMode) -> Self {
        let mut disk_ignored: BTreeSet<String> =
            DISK_STRUCTURAL_KEYS.iter().map(|k| k.to_string()).collect();
        if mode == ActionMode::Update {
            // folded into the file= token
            disk_ignored.insert("format".to_string());
        }
        Self {
            mode,
            disk_ignored,
            network_ignored: NETWORK_STRUCTURAL_KEYS.iter().map(|k| k.to_string()).collect(),
        }
    }

    pub fn mode(&self) -> ActionMode {
        self.mode
    }

    /// Exclude an extra attribute from the pass-through segments of `kind`.
    pub fn ignore_key(mut self, kind: DeviceKind, key: impl Into<String>) -> Self {
        match kind {
            DeviceKind::Disk => self.disk_ignored.insert(key.into()),
            DeviceKind::Network => self.network_ignored.insert(key.into()),
        };
        self
    }

    pub fn is_ignored(&self, kind: DeviceKind, key: &str) -> bool {
        match kind {
            DeviceKind::Disk => self.disk_ignored.contains(key),
            DeviceKind::Network => self.network_ignored.contains(key),
        }
    }

    /// Encode a whole table. Fails before producing anything if one device
    /// is invalid.
    pub fn encode_table(
        &self,
        kind: DeviceKind,
        vmid: u32,
        table: &DeviceTable,
    ) -> ProxmoxResult<Vec<EncodedDevice>> {
        if kind == DeviceKind::Disk && self.mode == ActionMode::Update {
            check_contiguous(table)?;
        }

        let mut out = Vec::with_capacity(table.len());
        for (&index, dev) in table {
            if dev.is_empty() {
                debug!("Skipping empty {kind} descriptor at index {index}");
                continue;
            }
            out.push(self.encode(kind, vmid, index, dev)?);
        }
        Ok(out)
    }

    pub fn encode(
        &self,
        kind: DeviceKind,
        vmid: u32,
        index: u32,
        dev: &QemuDevice,
    ) -> ProxmoxResult<EncodedDevice> {
        match kind {
            DeviceKind::Disk => self.encode_disk(vmid, index, dev),
            DeviceKind::Network => self.encode_network(vmid, index, dev),
        }
    }

    pub fn encode_disk(&self, vmid: u32, index: u32, dev: &QemuDevice) -> ProxmoxResult<EncodedDevice> {
        let bus = self.require(DeviceKind::Disk, index, dev, "type")?;
        let storage = self.require(DeviceKind::Disk, index, dev, "storage")?;
        let size = self.require(DeviceKind::Disk, index, dev, "size")?;

        let mut parts = Vec::new();
        match self.mode {
            ActionMode::Create => {
                parts.push(format!("{storage}:{}", size.trim_end_matches('G')));
            }
            ActionMode::Update => {
                let storage_type = self.require(DeviceKind::Disk, index, dev, "storage_type")?;
                parts.push(format!("size={size}"));
                let disk_no = index + 1;
                if BLOCK_STORAGE.is_match(&storage_type) {
                    parts.push(format!("file={storage}:vm-{vmid}-disk-{disk_no}"));
                } else {
                    let format = self.require(DeviceKind::Disk, index, dev, "format")?;
                    parts.push(format!(
                        "file={storage}:{vmid}/vm-{vmid}-disk-{disk_no}.{format}"
                    ));
                }
            }
        }

        if let Some(cache) = dev.get_non_empty("cache") {
            if cache != "none" {
                parts.push(format!("cache={cache}"));
            }
        }

        self.append_attributes(DeviceKind::Disk, dev, &mut parts);

        Ok(EncodedDevice {
            index,
            key: format!("{bus}{index}"),
            value: parts.join(","),
            generated_mac: None,
        })
    }

    pub fn encode_network(&self, vmid: u32, index: u32, dev: &QemuDevice) -> ProxmoxResult<EncodedDevice> {
        self.require(DeviceKind::Network, index, dev, "model")?;

        let mut parts = Vec::new();
        let mut generated_mac = None;
        let mac = match dev.get_non_empty("macaddr") {
            Some(mac) => mac,
            None => {
                let mac = generate_mac(vmid, index);
                debug!("Generated MAC {mac} for net{index} of VM {vmid}");
                generated_mac = Some(mac.clone());
                mac
            }
        };
        parts.push(format!("macaddr={mac}"));

        if let Some(bridge) = dev.get_non_empty("bridge") {
            if bridge != "nat" {
                parts.push(format!("bridge={bridge}"));
            }
        }

        self.append_attributes(DeviceKind::Network, dev, &mut parts);

        Ok(EncodedDevice {
            index,
            key: format!("net{index}"),
            value: parts.join(","),
            generated_mac,
        })
    }

    fn append_attributes(&self, kind: DeviceKind, dev: &QemuDevice, parts: &mut Vec<String>) {
        for (key, value) in dev.iter() {
            if self.is_ignored(kind, key) {
                continue;
            }
            if let Some(v) = value.to_param() {
                parts.push(format!("{key}={v}"));
            }
        }
    }

    fn require(
        &self,
        kind: DeviceKind,
        index: u32,
        dev: &QemuDevice,
        key: &str,
    ) -> ProxmoxResult<String> {
        dev.get_non_empty(key).ok_or_else(|| {
            ProxmoxError::validation(format!(
                "{kind} {index}: attribute '{key}' is required for {}",
                self.mode
            ))
        })
    }
}

/// Update mode names disk files `disk-{index+1}`, which is only right when
/// indices run 0, 1, 2, … without gaps.
fn check_contiguous(table: &DeviceTable) -> ProxmoxResult<()> {
    for (expected, &index) in table.keys().enumerate() {
        if index as usize != expected {
            return Err(ProxmoxError::validation(format!(
                "disk indices must be contiguous from 0 for update, found {:?}",
                table.keys().collect::<Vec<_>>()
            )));
        }
    }
    Ok(())
}
