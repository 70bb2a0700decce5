//! Single-disk / single-NIC fields from the older flat schema.
//!
//! Older specs describe one disk with `storage` + `diskGB` and one NIC with
//! `nic` + `bridge` + `vlan`, instead of the indexed `disk` / `network`
//! tables. When a table is empty, the flat fields stand in for its entry 0.
//! A non-empty table always wins; the flat fields are then ignored.

use crate::device::{DeviceTable, QemuDevice};
use crate::qemu::QemuConfig;

use std::borrow::Cow;

/// Disk table to encode: the modern table, or one synthesized from the
/// flat disk fields.
///
/// Update mode names the disk file from `storage_type`, so a legacy spec
/// without it can create a VM but fails validation on update or clone.
pub fn effective_disks(config: &QemuConfig) -> Cow<'_, DeviceTable> {
    if !config.disks.is_empty() || config.storage.is_empty() || config.disk_size <= 0.0 {
        return Cow::Borrowed(&config.disks);
    }
    let mut dev = QemuDevice::new()
        .with("type", "virtio")
        .with("storage", config.storage.as_str())
        .with("size", format!("{}G", config.disk_size));
    if !config.storage_type.is_empty() {
        dev.insert("storage_type", config.storage_type.as_str());
    }
    Cow::Owned(DeviceTable::from([(0, dev)]))
}

/// NIC table to encode: the modern table, or one synthesized from the
/// flat NIC fields.
pub fn effective_networks(config: &QemuConfig) -> Cow<'_, DeviceTable> {
    if !config.networks.is_empty() || config.nic_model.is_empty() {
        return Cow::Borrowed(&config.networks);
    }
    let mut dev = QemuDevice::new()
        .with("model", config.nic_model.as_str())
        .with("bridge", config.bridge.as_str());
    if config.vlan_tag > 0 {
        dev.insert("tag", config.vlan_tag);
    }
    Cow::Owned(DeviceTable::from([(0, dev)]))
}
