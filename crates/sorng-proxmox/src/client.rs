//! Proxmox VE REST API HTTP client.
//!
//! Talks to `https://{host}:{port}/api2/json/...` with a static API token
//! (`Authorization: PVEAPIToken=user@realm!name=secret`). Every response is
//! wrapped as `{"data": …}`; the helpers here unwrap it.

use crate::api::ProxmoxApi;
use crate::error::{ProxmoxError, ProxmoxErrorKind, ProxmoxResult};
use crate::types::{param_to_form_value, FlatConfig, ParamMap, ProxmoxConfig, VmListEntry, VmRef};

use async_trait::async_trait;
use log::debug;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

/// Proxmox VE API client.
pub struct PveClient {
    client: Client,
    base_url: String,
    config: ProxmoxConfig,
}

impl PveClient {
    /// Build a new client from config. No request is made.
    pub fn new(config: &ProxmoxConfig) -> ProxmoxResult<Self> {
        if config.host.is_empty() {
            return Err(ProxmoxError::validation("Proxmox host is empty"));
        }
        if config.token_id.is_empty() || config.token_secret.is_empty() {
            return Err(ProxmoxError::auth("API token id and secret are required"));
        }

        let base_url = format!("https://{}:{}/api2/json", config.host, config.port);
        url::Url::parse(&base_url)
            .map_err(|e| ProxmoxError::connection(format!("Invalid API URL {base_url}: {e}")))?;

        let client = Client::builder()
            .danger_accept_invalid_certs(config.insecure)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ProxmoxError::connection(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            config: config.clone(),
        })
    }

    /// Base URL for API calls.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Current config.
    pub fn config(&self) -> &ProxmoxConfig {
        &self.config
    }

    fn auth_header(&self) -> String {
        format!("PVEAPIToken={}={}", self.config.token_id, self.config.token_secret)
    }

    // ── HTTP helpers ────────────────────────────────────────────────

    /// GET `/version`; used to verify the token and reachability.
    pub async fn version(&self) -> ProxmoxResult<serde_json::Value> {
        self.get("/version").await
    }

    /// GET and unwrap `data`.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> ProxmoxResult<T> {
        self.get_with_params(path, &[]).await
    }

    /// GET with query params and unwrap `data`.
    pub async fn get_with_params<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> ProxmoxResult<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {url}");
        let resp = self
            .client
            .get(&url)
            .header("Authorization", self.auth_header())
            .query(params)
            .send()
            .await?;
        let resp = Self::check_status(resp).await?;
        Self::parse_response(resp).await
    }

    /// POST form-encoded params and unwrap `data`.
    pub async fn post_form<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &ParamMap,
    ) -> ProxmoxResult<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!("POST {url} ({} params)", params.len());
        let resp = self
            .client
            .post(&url)
            .header("Authorization", self.auth_header())
            .form(&form_pairs(params))
            .send()
            .await?;
        let resp = Self::check_status(resp).await?;
        Self::parse_response(resp).await
    }

    // ── Internal helpers ────────────────────────────────────────────

    async fn check_status(resp: Response) -> ProxmoxResult<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let code = status.as_u16();
        let reason = status.canonical_reason().unwrap_or_default().to_string();
        let body = resp.text().await.unwrap_or_default();

        match status {
            StatusCode::UNAUTHORIZED => Err(ProxmoxError::auth(format!("API token rejected: {body}"))),
            StatusCode::FORBIDDEN => Err(ProxmoxError::new(
                ProxmoxErrorKind::AccessDenied,
                format!("Access denied: {body}"),
            )),
            StatusCode::NOT_FOUND => Err(ProxmoxError::not_found(format!("Resource not found: {body}"))),
            _ => Err(ProxmoxError::api(code, format!("API error {code} {reason}: {body}"))),
        }
    }

    async fn parse_response<T: DeserializeOwned>(resp: Response) -> ProxmoxResult<T> {
        let text = resp.text().await.map_err(|e| {
            ProxmoxError::parse(format!("Failed to read response body: {e}"))
        })?;
        unwrap_envelope(&text)
    }
}

/// Pull `data` out of an API response body.
pub fn unwrap_envelope<T: DeserializeOwned>(text: &str) -> ProxmoxResult<T> {
    let envelope: Envelope<T> = serde_json::from_str(text).map_err(|e| {
        ProxmoxError::parse(format!(
            "JSON parse error: {e}; body: {}",
            text.chars().take(500).collect::<String>()
        ))
    })?;
    Ok(envelope.data)
}

/// Form fields in the representation the API accepts (booleans as 1/0).
pub fn form_pairs(params: &ParamMap) -> Vec<(String, String)> {
    params
        .iter()
        .map(|(k, v)| (k.clone(), param_to_form_value(v)))
        .collect()
}

fn qemu_path(vmr: &VmRef) -> String {
    format!("/nodes/{}/qemu/{}", vmr.node, vmr.vmid)
}

#[async_trait]
impl ProxmoxApi for PveClient {
    async fn fetch_config(&self, vmr: &VmRef) -> ProxmoxResult<FlatConfig> {
        self.get(&format!("{}/config", qemu_path(vmr))).await
    }

    async fn fetch_state(&self, vmr: &VmRef) -> ProxmoxResult<FlatConfig> {
        self.get(&format!("{}/status/current", qemu_path(vmr))).await
    }

    async fn create_vm(&self, node: &str, params: &ParamMap) -> ProxmoxResult<Option<String>> {
        self.post_form(&format!("/nodes/{node}/qemu"), params).await
    }

    async fn clone_vm(&self, source: &VmRef, params: &ParamMap) -> ProxmoxResult<Option<String>> {
        self.post_form(&format!("{}/clone", qemu_path(source)), params).await
    }

    async fn set_config(&self, vmr: &VmRef, params: &ParamMap) -> ProxmoxResult<Option<String>> {
        self.post_form(&format!("{}/config", qemu_path(vmr)), params).await
    }

    async fn list_vms(&self) -> ProxmoxResult<Vec<VmListEntry>> {
        self.get_with_params("/cluster/resources", &[("type", "vm")]).await
    }
}
