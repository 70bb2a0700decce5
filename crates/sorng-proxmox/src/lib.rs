//! # SortOfRemote NG – Proxmox VE QEMU Provisioning
//!
//! Declarative QEMU VM definitions for Proxmox VE: a codec between typed
//! device descriptors and the flat `key=value,...` strings the API speaks,
//! plus create / clone / update flows that wait out config locks.
//!
//! ## Modules
//!
//! - **types** — Connection config, VM references, flat config maps
//! - **error** — Crate-specific error types
//! - **value** — Scalar device attribute values and their coercion rules
//! - **device** — Device descriptors, device tables, codec modes
//! - **codec** — Disk / NIC string encoding and decoding
//! - **mac** — Deterministic MAC address generation
//! - **legacy** — Single-disk / single-NIC fallback fields
//! - **qemu** — The VM specification aggregate and its API parameters
//! - **retry** — Lock-wait retry policy
//! - **api** — Remote API trait used by the flows
//! - **client** — Proxmox VE REST client with API-token auth
//! - **provision** — Create / clone / update / read-back orchestration
//! - **service** — Aggregate facade + shared state alias
//! - **commands** — String-error command handlers over the shared state

pub mod types;
pub mod error;
pub mod value;
pub mod device;
pub mod codec;
pub mod mac;
pub mod legacy;
pub mod qemu;
pub mod retry;
pub mod api;
pub mod client;
pub mod provision;
pub mod service;
pub mod commands;
