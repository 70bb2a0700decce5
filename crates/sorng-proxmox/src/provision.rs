//! Create / clone / update flows and config read-back.
//!
//! ```text
//! create:  Absent ─create_vm─▶ Created (configured in one call)
//! clone:   Absent ─clone_vm─▶ Cloning ─(lock wait)*─▶ set_config ─▶ Configured
//! update:  Configured ─set_config─▶ Configured
//! ```
//!
//! Every flow encodes its parameters before the first remote call, so an
//! invalid spec never leaves a half-provisioned VM behind.

use crate::api::ProxmoxApi;
use crate::device::DecodeMode;
use crate::error::ProxmoxResult;
use crate::qemu::QemuConfig;
use crate::retry::{wait_until_unlocked, RetryPolicy};
use crate::types::{FlatConfig, VmRef, VmStatus};

use log::{debug, info};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Drives provisioning calls against a [`ProxmoxApi`].
pub struct Provisioner<'a, A: ProxmoxApi + ?Sized> {
    api: &'a A,
    policy: RetryPolicy,
    cancel: CancellationToken,
    decode_mode: DecodeMode,
}

impl<'a, A: ProxmoxApi + ?Sized> Provisioner<'a, A> {
    pub fn new(api: &'a A) -> Self {
        Self {
            api,
            policy: RetryPolicy::default(),
            cancel: CancellationToken::new(),
            decode_mode: DecodeMode::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Token checked during lock waits; cancelling it aborts the wait.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_decode_mode(mut self, mode: DecodeMode) -> Self {
        self.decode_mode = mode;
        self
    }

    // ── Flows ───────────────────────────────────────────────────────

    /// Create `vmr` from `config` in a single call. Generated MACs are
    /// written back into `config.networks` on success.
    pub async fn create(&self, config: &mut QemuConfig, vmr: &VmRef) -> ProxmoxResult<Option<String>> {
        let encoded = config.create_params(vmr.vmid)?;
        info!("Creating VM {vmr} ('{}')", config.name);
        let upid = self.api.create_vm(&vmr.node, &encoded.params).await?;
        config.apply_generated_macs(&encoded.generated_macs);
        Ok(upid)
    }

    /// Clone `source` into `target`, then apply the rest of `config`
    /// (CPU, memory, description, devices) as an update.
    pub async fn clone_vm(&self, config: &mut QemuConfig, source: &VmRef, target: &VmRef) -> ProxmoxResult<()> {
        let update = config.update_params(target.vmid)?;
        let clone_params = config.clone_params(target);

        info!("Cloning VM {source} to {target} ('{}')", config.name);
        self.api.clone_vm(source, &clone_params).await?;

        self.wait_unlocked(target).await?;

        debug!("Applying post-clone config to {target}");
        self.api.set_config(target, &update.params).await?;
        config.apply_generated_macs(&update.generated_macs);
        Ok(())
    }

    /// Re-apply `config` to an existing VM.
    pub async fn update(&self, config: &mut QemuConfig, vmr: &VmRef) -> ProxmoxResult<Option<String>> {
        let encoded = config.update_params(vmr.vmid)?;
        info!("Updating config of VM {vmr}");
        let upid = self.api.set_config(vmr, &encoded.params).await?;
        config.apply_generated_macs(&encoded.generated_macs);
        Ok(upid)
    }

    /// Fetch and decode the current config of `vmr`, waiting out a lock.
    pub async fn read_back(&self, vmr: &VmRef) -> ProxmoxResult<QemuConfig> {
        let remote = self.wait_unlocked(vmr).await?;
        QemuConfig::from_flat_config(&remote, self.decode_mode)
    }

    /// Poll the config of `vmr` until it carries no `lock`.
    pub async fn wait_unlocked(&self, vmr: &VmRef) -> ProxmoxResult<FlatConfig> {
        let what = format!("VM {vmr}");
        wait_until_unlocked(&self.policy, &self.cancel, &what, || self.api.fetch_config(vmr)).await
    }

    // ── Helpers ─────────────────────────────────────────────────────

    /// Highest VM id in the cluster, 0 when there are none.
    pub async fn max_vm_id(&self) -> ProxmoxResult<u32> {
        let vms = self.api.list_vms().await?;
        Ok(vms.iter().map(|v| v.vmid).max().unwrap_or(0))
    }

    /// `max_vm_id() + 1`. Not reserved: a concurrent create can take it.
    pub async fn next_vm_id(&self) -> ProxmoxResult<u32> {
        Ok(self.max_vm_id().await? + 1)
    }

    /// Run state (`running` / `stopped` / …) of `vmr`.
    pub async fn vm_status(&self, vmr: &VmRef) -> ProxmoxResult<VmStatus> {
        let state = self.api.fetch_state(vmr).await?;
        Ok(match state.get("status") {
            Some(Value::String(s)) => VmStatus::from_api(s),
            _ => VmStatus::Unknown,
        })
    }
}

/// Shorthands running each flow with the default policy and decode mode.
impl QemuConfig {
    pub async fn create_vm<A: ProxmoxApi + ?Sized>(&mut self, vmr: &VmRef, api: &A) -> ProxmoxResult<Option<String>> {
        Provisioner::new(api).create(self, vmr).await
    }

    pub async fn clone_vm<A: ProxmoxApi + ?Sized>(
        &mut self,
        source: &VmRef,
        target: &VmRef,
        api: &A,
    ) -> ProxmoxResult<()> {
        Provisioner::new(api).clone_vm(self, source, target).await
    }

    pub async fn update_config<A: ProxmoxApi + ?Sized>(&mut self, vmr: &VmRef, api: &A) -> ProxmoxResult<Option<String>> {
        Provisioner::new(api).update(self, vmr).await
    }

    pub async fn from_api<A: ProxmoxApi + ?Sized>(vmr: &VmRef, api: &A) -> ProxmoxResult<Self> {
        Provisioner::new(api).read_back(vmr).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::QemuDevice;
    use crate::error::{ProxmoxError, ProxmoxErrorKind};
    use crate::mac::generate_mac;
    use crate::types::{ParamMap, VmListEntry};

    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::Instant;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        FetchConfig(u32),
        FetchState(u32),
        Create(String, ParamMap),
        Clone(u32, ParamMap),
        SetConfig(u32, ParamMap),
        List,
    }

    /// In-memory API: reports `lock` for the first `locked_reads` config
    /// reads and records every call.
    #[derive(Default)]
    struct FakeApi {
        calls: Mutex<Vec<Call>>,
        locked_reads: AtomicU32,
        config: FlatConfig,
        fail_set_config: bool,
    }

    impl FakeApi {
        fn with_config(config: FlatConfig) -> Self {
            Self { config, ..Self::default() }
        }

        fn locked_for(self, reads: u32) -> Self {
            self.locked_reads.store(reads, Ordering::SeqCst);
            self
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl ProxmoxApi for FakeApi {
        async fn fetch_config(&self, vmr: &VmRef) -> ProxmoxResult<FlatConfig> {
            self.record(Call::FetchConfig(vmr.vmid));
            let remaining = self.locked_reads.load(Ordering::SeqCst);
            if remaining > 0 {
                self.locked_reads.store(remaining - 1, Ordering::SeqCst);
                return Ok(FlatConfig::from([
                    ("lock".to_string(), json!("clone")),
                    ("description".to_string(), json!("qmclone temporary file\n")),
                ]));
            }
            Ok(self.config.clone())
        }

        async fn fetch_state(&self, vmr: &VmRef) -> ProxmoxResult<FlatConfig> {
            self.record(Call::FetchState(vmr.vmid));
            Ok(FlatConfig::from([("status".to_string(), json!("running"))]))
        }

        async fn create_vm(&self, node: &str, params: &ParamMap) -> ProxmoxResult<Option<String>> {
            self.record(Call::Create(node.to_string(), params.clone()));
            Ok(Some("UPID:pve1:create".to_string()))
        }

        async fn clone_vm(&self, source: &VmRef, params: &ParamMap) -> ProxmoxResult<Option<String>> {
            self.record(Call::Clone(source.vmid, params.clone()));
            Ok(Some("UPID:pve1:qmclone".to_string()))
        }

        async fn set_config(&self, vmr: &VmRef, params: &ParamMap) -> ProxmoxResult<Option<String>> {
            self.record(Call::SetConfig(vmr.vmid, params.clone()));
            if self.fail_set_config {
                return Err(ProxmoxError::api(500, "VM is locked (clone)"));
            }
            Ok(None)
        }

        async fn list_vms(&self) -> ProxmoxResult<Vec<VmListEntry>> {
            self.record(Call::List);
            Ok(vec![
                VmListEntry { vmid: 100, node: "pve1".into(), name: None, status: None, vm_type: None },
                VmListEntry { vmid: 312, node: "pve2".into(), name: None, status: None, vm_type: None },
                VmListEntry { vmid: 205, node: "pve1".into(), name: None, status: None, vm_type: None },
            ])
        }
    }

    fn spec() -> QemuConfig {
        let mut cfg = QemuConfig {
            name: "vm1".into(),
            description: "web".into(),
            cores: 2,
            sockets: 1,
            memory: 2048,
            os_type: "l26".into(),
            ..QemuConfig::default()
        };
        cfg.disks.insert(
            0,
            QemuDevice::new()
                .with("type", "virtio")
                .with("storage", "local")
                .with("storage_type", "dir")
                .with("format", "qcow2")
                .with("size", "20G"),
        );
        cfg.networks.insert(0, QemuDevice::new().with("model", "virtio").with("bridge", "vmbr0"));
        cfg
    }

    fn remote() -> FlatConfig {
        serde_json::from_value(json!({
            "name": "vm1",
            "ostype": "l26",
            "memory": 2048,
            "cores": 2,
            "sockets": 1,
            "virtio0": "local:101/vm-101-disk-1.qcow2,size=20G",
            "net0": "virtio=AA:BB:CC:DD:EE:FF,bridge=vmbr0"
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn create_issues_single_call() {
        let api = FakeApi::default();
        let mut cfg = spec();
        let upid = Provisioner::new(&api)
            .create(&mut cfg, &VmRef::new(101, "pve1"))
            .await
            .unwrap();
        assert_eq!(upid.as_deref(), Some("UPID:pve1:create"));

        let calls = api.calls();
        assert_eq!(calls.len(), 1);
        let Call::Create(node, params) = &calls[0] else { panic!("unexpected {calls:?}") };
        assert_eq!(node, "pve1");
        assert_eq!(params["virtio0"], json!("local:20,format=qcow2"));
        assert_eq!(params["name"], json!("vm1"));

        // generated MAC is visible to the caller
        assert_eq!(cfg.networks[&0].get_string("macaddr"), Some(generate_mac(101, 0)));
    }

    #[tokio::test]
    async fn invalid_create_makes_no_remote_call() {
        let api = FakeApi::default();
        let mut cfg = spec();
        cfg.disks.get_mut(&0).unwrap().remove("storage");
        let err = Provisioner::new(&api)
            .create(&mut cfg, &VmRef::new(101, "pve1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ProxmoxErrorKind::Validation);
        assert!(api.calls().is_empty());
        assert!(!cfg.networks[&0].contains_key("macaddr"));
    }

    #[tokio::test(start_paused = true)]
    async fn clone_waits_for_lock_then_updates() {
        let api = FakeApi::with_config(remote()).locked_for(1);
        let mut cfg = spec();
        Provisioner::new(&api)
            .clone_vm(&mut cfg, &VmRef::new(9000, "pve1"), &VmRef::new(145, "pve2"))
            .await
            .unwrap();

        let calls = api.calls();
        assert_eq!(calls.len(), 4);
        let Call::Clone(source, params) = &calls[0] else { panic!("unexpected {calls:?}") };
        assert_eq!(*source, 9000);
        assert_eq!(params["newid"], json!(145));
        assert_eq!(params["target"], json!("pve2"));
        assert_eq!(params["full"], json!(1));
        assert_eq!(calls[1], Call::FetchConfig(145));
        assert_eq!(calls[2], Call::FetchConfig(145));
        let Call::SetConfig(vmid, params) = &calls[3] else { panic!("unexpected {calls:?}") };
        assert_eq!(*vmid, 145);
        assert_eq!(params["virtio0"], json!("size=20G,file=local:145/vm-145-disk-1.qcow2"));
        assert_eq!(params["cores"], json!(2));
        assert!(params.contains_key("net0"));
        assert_eq!(cfg.networks[&0].get_string("macaddr"), Some(generate_mac(145, 0)));
    }

    #[tokio::test]
    async fn clone_validates_before_cloning() {
        let api = FakeApi::default();
        let mut cfg = spec();
        cfg.disks.get_mut(&0).unwrap().remove("storage_type");
        let err = Provisioner::new(&api)
            .clone_vm(&mut cfg, &VmRef::new(9000, "pve1"), &VmRef::new(145, "pve1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ProxmoxErrorKind::Validation);
        assert!(api.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn clone_fails_when_lock_never_clears() {
        let api = FakeApi::with_config(remote()).locked_for(u32::MAX);
        let mut cfg = spec();
        let err = Provisioner::new(&api)
            .clone_vm(&mut cfg, &VmRef::new(9000, "pve1"), &VmRef::new(145, "pve1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ProxmoxErrorKind::Locked);
        assert!(!api.calls().iter().any(|c| matches!(c, Call::SetConfig(..))));
    }

    #[tokio::test]
    async fn transport_errors_pass_through() {
        let api = FakeApi { fail_set_config: true, ..FakeApi::default() };
        let mut cfg = spec();
        let err = Provisioner::new(&api)
            .update(&mut cfg, &VmRef::new(101, "pve1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ProxmoxErrorKind::ApiError(500));
        assert_eq!(api.calls().len(), 1);
    }

    #[tokio::test]
    async fn update_sends_partial_params() {
        let api = FakeApi::default();
        let mut cfg = spec();
        Provisioner::new(&api)
            .update(&mut cfg, &VmRef::new(101, "pve1"))
            .await
            .unwrap();
        let calls = api.calls();
        let Call::SetConfig(_, params) = &calls[0] else { panic!("unexpected {calls:?}") };
        let keys: Vec<&str> = params.keys().map(|k| k.as_str()).collect();
        assert_eq!(
            keys,
            vec!["cores", "description", "memory", "net0", "onboot", "sockets", "virtio0"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn read_back_gives_up_after_three_locked_reads() {
        let api = FakeApi::with_config(remote()).locked_for(u32::MAX);
        let start = Instant::now();
        let err = Provisioner::new(&api)
            .read_back(&VmRef::new(145, "pve1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ProxmoxErrorKind::Locked);
        assert_eq!(api.calls().len(), 3);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(16) && elapsed < Duration::from_secs(17));
    }

    #[tokio::test(start_paused = true)]
    async fn read_back_decodes_after_lock_clears() {
        let api = FakeApi::with_config(remote()).locked_for(2);
        let cfg = Provisioner::new(&api)
            .read_back(&VmRef::new(101, "pve1"))
            .await
            .unwrap();
        assert_eq!(cfg.name, "vm1");
        assert_eq!(cfg.networks[&0].get_string("macaddr").as_deref(), Some("AA:BB:CC:DD:EE:FF"));
        assert_eq!(cfg.disks[&0].get_string("size").as_deref(), Some("20G"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_read_back() {
        let api = FakeApi::with_config(remote()).locked_for(u32::MAX);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = Provisioner::new(&api)
            .with_cancellation(cancel)
            .read_back(&VmRef::new(101, "pve1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ProxmoxErrorKind::Cancelled);
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn strict_read_back_rejects_bad_segments() {
        let mut remote = remote();
        remote.insert("net1".into(), json!("virtio=AA:BB:CC:DD:EE:01,junk"));
        let api = FakeApi::with_config(remote);
        let err = Provisioner::new(&api)
            .with_decode_mode(DecodeMode::Strict)
            .read_back(&VmRef::new(101, "pve1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ProxmoxErrorKind::MalformedData);
    }

    #[tokio::test]
    async fn shorthands_on_qemu_config() {
        let api = FakeApi::with_config(remote());
        let vmr = VmRef::new(101, "pve1");
        let mut cfg = spec();
        cfg.create_vm(&vmr, &api).await.unwrap();
        cfg.update_config(&vmr, &api).await.unwrap();
        let read = QemuConfig::from_api(&vmr, &api).await.unwrap();
        assert_eq!(read.memory, 2048);

        let calls = api.calls();
        assert_eq!(calls.len(), 3);
        assert!(matches!(calls[0], Call::Create(..)));
        // MAC recorded by create is reused by the update
        let Call::SetConfig(_, params) = &calls[1] else { panic!("unexpected {calls:?}") };
        assert!(params["net0"].as_str().unwrap().contains(&generate_mac(101, 0)));
        assert_eq!(calls[2], Call::FetchConfig(101));
    }

    #[tokio::test]
    async fn max_vm_id_and_status() {
        let api = FakeApi::default();
        let p = Provisioner::new(&api);
        assert_eq!(p.max_vm_id().await.unwrap(), 312);
        assert_eq!(p.next_vm_id().await.unwrap(), 313);
        assert_eq!(p.vm_status(&VmRef::new(101, "pve1")).await.unwrap(), VmStatus::Running);
    }
}
