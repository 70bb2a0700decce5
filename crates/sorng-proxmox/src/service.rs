//! Aggregate service façade for the Proxmox crate.
//!
//! `ProxmoxService` owns the `PveClient` and runs every provisioning flow
//! through a [`Provisioner`] configured from the connection's
//! `lock_retry` policy. Shared as `ProxmoxServiceState = Arc<Mutex<ProxmoxService>>`.
//!
//! Callers hold the state mutex for the whole of an operation, so lock
//! waits are cancelled through a [`CancelHandle`] taken from the service
//! before it is shared.

use crate::client::PveClient;
use crate::error::{ProxmoxError, ProxmoxResult};
use crate::provision::Provisioner;
use crate::qemu::QemuConfig;
use crate::types::{ProxmoxConfig, ProxmoxConfigSafe, VmRef, VmStatus};

use log::info;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Thread-safe handle for callers sharing one connection.
pub type ProxmoxServiceState = Arc<Mutex<ProxmoxService>>;

/// Cancels lock waits without going through the state mutex.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<StdMutex<CancellationToken>>);

impl CancelHandle {
    /// Token observed by operations started from now on.
    pub fn token(&self) -> CancellationToken {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Abort every wait started so far. Later operations get a fresh token.
    pub fn cancel(&self) {
        let mut token = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        token.cancel();
        *token = CancellationToken::new();
    }
}

pub struct ProxmoxService {
    client: Option<PveClient>,
    config: Option<ProxmoxConfig>,
    cancel: CancelHandle,
}

impl Default for ProxmoxService {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxmoxService {
    /// Create a new (disconnected) service.
    pub fn new() -> Self {
        Self {
            client: None,
            config: None,
            cancel: CancelHandle::default(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    fn require_client(&self) -> ProxmoxResult<&PveClient> {
        self.client.as_ref().ok_or_else(|| {
            ProxmoxError::connection("Not connected to Proxmox VE. Call connect first.")
        })
    }

    fn provisioner(&self) -> ProxmoxResult<Provisioner<'_, PveClient>> {
        let client = self.require_client()?;
        Ok(Provisioner::new(client)
            .with_policy(client.config().lock_retry.clone())
            .with_cancellation(self.cancel.token()))
    }

    // ── Connection ──────────────────────────────────────────────────

    /// Build a client and probe `/version`. Returns the reported PVE version.
    pub async fn connect(&mut self, config: ProxmoxConfig) -> ProxmoxResult<String> {
        let client = PveClient::new(&config)?;
        let version = client.version().await?;
        let release = version
            .get("version")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        info!("Connected to Proxmox VE {release} at {}", client.base_url());
        self.config = Some(config);
        self.client = Some(client);
        Ok(release)
    }

    /// Drop the client and abort any lock wait still running.
    pub fn disconnect(&mut self) {
        self.cancel_pending();
        self.client = None;
        self.config = None;
    }

    /// Cancel lock waits in progress. Later calls get a fresh token.
    pub fn cancel_pending(&self) {
        self.cancel.cancel();
    }

    /// Handle to keep outside `ProxmoxServiceState` for cancelling while
    /// another task holds the lock.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Get current config (without the token secret).
    pub fn get_config(&self) -> Option<ProxmoxConfigSafe> {
        self.config.as_ref().map(|c| ProxmoxConfigSafe {
            host: c.host.clone(),
            port: c.port,
            token_id: c.token_id.clone(),
            insecure: c.insecure,
        })
    }

    // ── VM operations ───────────────────────────────────────────────

    pub async fn create_vm(&self, spec: &mut QemuConfig, vmr: &VmRef) -> ProxmoxResult<Option<String>> {
        self.provisioner()?.create(spec, vmr).await
    }

    pub async fn clone_vm(&self, spec: &mut QemuConfig, source: &VmRef, target: &VmRef) -> ProxmoxResult<()> {
        self.provisioner()?.clone_vm(spec, source, target).await
    }

    pub async fn update_vm(&self, spec: &mut QemuConfig, vmr: &VmRef) -> ProxmoxResult<Option<String>> {
        self.provisioner()?.update(spec, vmr).await
    }

    pub async fn get_vm_config(&self, vmr: &VmRef) -> ProxmoxResult<QemuConfig> {
        self.provisioner()?.read_back(vmr).await
    }

    pub async fn vm_status(&self, vmr: &VmRef) -> ProxmoxResult<VmStatus> {
        self.provisioner()?.vm_status(vmr).await
    }

    pub async fn next_vm_id(&self) -> ProxmoxResult<u32> {
        self.provisioner()?.next_vm_id().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProxmoxErrorKind;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn operations_require_connection() {
        let svc = ProxmoxService::new();
        assert!(!svc.is_connected());
        assert!(svc.get_config().is_none());

        let vmr = VmRef::new(101, "pve1");
        let err = svc.get_vm_config(&vmr).await.unwrap_err();
        assert_eq!(err.kind, ProxmoxErrorKind::ConnectionError);
        let err = svc.next_vm_id().await.unwrap_err();
        assert_eq!(err.kind, ProxmoxErrorKind::ConnectionError);

        let mut spec = QemuConfig::default();
        let err = svc.create_vm(&mut spec, &vmr).await.unwrap_err();
        assert_eq!(err.kind, ProxmoxErrorKind::ConnectionError);
    }

    #[tokio::test]
    async fn connect_rejects_incomplete_config() {
        let mut svc = ProxmoxService::default();
        let err = svc
            .connect(ProxmoxConfig { host: "pve1".into(), ..ProxmoxConfig::default() })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ProxmoxErrorKind::AuthenticationError);
        assert!(!svc.is_connected());
    }

    #[test]
    fn cancel_pending_replaces_token() {
        let svc = ProxmoxService::new();
        let old = svc.cancel.token();
        svc.cancel_pending();
        assert!(old.is_cancelled());
        assert!(!svc.cancel.token().is_cancelled());

        let handle = svc.cancel_handle();
        let current = svc.cancel.token();
        handle.cancel();
        assert!(current.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_reaches_a_running_read_back() {
        // accepts TCP but never completes the TLS handshake
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = ProxmoxConfig {
            host: "127.0.0.1".into(),
            port,
            token_id: "root@pam!ci".into(),
            token_secret: "0000-1111".into(),
            insecure: true,
            ..ProxmoxConfig::default()
        };

        let mut svc = ProxmoxService::new();
        svc.client = Some(PveClient::new(&config).unwrap());
        let cancel = svc.cancel_handle();
        let state: ProxmoxServiceState = Arc::new(Mutex::new(svc));

        let worker = state.clone();
        let task = tokio::spawn(async move {
            let svc = worker.lock().await;
            svc.get_vm_config(&VmRef::new(101, "pve1")).await
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(state.try_lock().is_err());
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap_err().kind, ProxmoxErrorKind::Cancelled);
        drop(listener);
    }

    #[test]
    fn shared_state_alias() {
        let state: ProxmoxServiceState = Arc::new(Mutex::new(ProxmoxService::new()));
        let guard = state.try_lock().unwrap();
        assert!(!guard.is_connected());
    }
}
