//! The calls the provisioning flows need from the Proxmox API.
//!
//! [`PveClient`](crate::client::PveClient) is the HTTP implementation;
//! tests substitute an in-memory one.

use crate::error::ProxmoxResult;
use crate::types::{FlatConfig, ParamMap, VmListEntry, VmRef};

use async_trait::async_trait;

/// Remote API seam. Every call is one request; implementations add no
/// retries of their own beyond what their transport does.
#[async_trait]
pub trait ProxmoxApi: Send + Sync {
    /// `GET /nodes/{node}/qemu/{vmid}/config`
    async fn fetch_config(&self, vmr: &VmRef) -> ProxmoxResult<FlatConfig>;

    /// `GET /nodes/{node}/qemu/{vmid}/status/current`
    async fn fetch_state(&self, vmr: &VmRef) -> ProxmoxResult<FlatConfig>;

    /// `POST /nodes/{node}/qemu`. Returns the task UPID, if any.
    async fn create_vm(&self, node: &str, params: &ParamMap) -> ProxmoxResult<Option<String>>;

    /// `POST /nodes/{node}/qemu/{vmid}/clone` on the source VM.
    async fn clone_vm(&self, source: &VmRef, params: &ParamMap) -> ProxmoxResult<Option<String>>;

    /// `POST /nodes/{node}/qemu/{vmid}/config`
    async fn set_config(&self, vmr: &VmRef, params: &ParamMap) -> ProxmoxResult<Option<String>>;

    /// `GET /cluster/resources?type=vm`
    async fn list_vms(&self) -> ProxmoxResult<Vec<VmListEntry>>;
}
