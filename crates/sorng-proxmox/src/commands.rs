//! Command handlers over the shared service state.
//!
//! Every command is `async`, takes `&ProxmoxServiceState` and returns
//! `Result<T, String>` so it can sit behind any string-error IPC layer.
//! Specs are taken by value and handed back with generated MACs recorded.

use crate::qemu::QemuConfig;
use crate::service::{CancelHandle, ProxmoxServiceState};
use crate::types::{ProxmoxConfig, ProxmoxConfigSafe, VmRef, VmStatus};

// ── Connection ──────────────────────────────────────────────────────

pub async fn proxmox_connect(
    state: &ProxmoxServiceState,
    config: ProxmoxConfig,
) -> Result<String, String> {
    let mut svc = state.lock().await;
    svc.connect(config).await.map_err(|e| e.to_string())
}

pub async fn proxmox_disconnect(state: &ProxmoxServiceState) -> Result<(), String> {
    let mut svc = state.lock().await;
    svc.disconnect();
    Ok(())
}

pub async fn proxmox_is_connected(state: &ProxmoxServiceState) -> Result<bool, String> {
    let svc = state.lock().await;
    Ok(svc.is_connected())
}

pub async fn proxmox_get_config(
    state: &ProxmoxServiceState,
) -> Result<Option<ProxmoxConfigSafe>, String> {
    let svc = state.lock().await;
    Ok(svc.get_config())
}

/// Does not touch `state`: the lock may be held by the operation being
/// cancelled.
pub fn proxmox_cancel_pending(cancel: &CancelHandle) -> Result<(), String> {
    cancel.cancel();
    Ok(())
}

// ── VM provisioning ─────────────────────────────────────────────────

pub async fn proxmox_create_vm(
    state: &ProxmoxServiceState,
    node: String,
    vmid: u32,
    mut spec: QemuConfig,
) -> Result<QemuConfig, String> {
    let svc = state.lock().await;
    svc.create_vm(&mut spec, &VmRef::new(vmid, node))
        .await
        .map_err(|e| e.to_string())?;
    Ok(spec)
}

pub async fn proxmox_clone_vm(
    state: &ProxmoxServiceState,
    source_node: String,
    source_vmid: u32,
    node: String,
    vmid: u32,
    mut spec: QemuConfig,
) -> Result<QemuConfig, String> {
    let source = VmRef::new(source_vmid, source_node);
    let target = VmRef::new(vmid, node);
    let svc = state.lock().await;
    svc.clone_vm(&mut spec, &source, &target)
        .await
        .map_err(|e| e.to_string())?;
    Ok(spec)
}

pub async fn proxmox_update_vm(
    state: &ProxmoxServiceState,
    node: String,
    vmid: u32,
    mut spec: QemuConfig,
) -> Result<QemuConfig, String> {
    let svc = state.lock().await;
    svc.update_vm(&mut spec, &VmRef::new(vmid, node))
        .await
        .map_err(|e| e.to_string())?;
    Ok(spec)
}

pub async fn proxmox_get_vm_config(
    state: &ProxmoxServiceState,
    node: String,
    vmid: u32,
) -> Result<QemuConfig, String> {
    let svc = state.lock().await;
    svc.get_vm_config(&VmRef::new(vmid, node))
        .await
        .map_err(|e| e.to_string())
}

pub async fn proxmox_vm_status(
    state: &ProxmoxServiceState,
    node: String,
    vmid: u32,
) -> Result<VmStatus, String> {
    let svc = state.lock().await;
    svc.vm_status(&VmRef::new(vmid, node))
        .await
        .map_err(|e| e.to_string())
}

pub async fn proxmox_next_vm_id(state: &ProxmoxServiceState) -> Result<u32, String> {
    let svc = state.lock().await;
    svc.next_vm_id().await.map_err(|e| e.to_string())
}
