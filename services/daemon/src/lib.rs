//! vmhost daemon library.
//!
//! The daemon manages local virtual machines on a single host. Clients talk
//! to it over a Unix socket; it keeps a persistent registry of named
//! instances, drives them through a hypervisor backend and serves their
//! boot images from a content-addressed cache.
//!
//! ## Modules
//!
//! - `daemon`: instance registry and lifecycle state machine
//! - `platform`: backend contract, Firecracker backend and in-memory mock
//! - `vault`: content-addressed image cache
//! - `state`: SQLite persistence for the registry
//! - `reconciler`: periodic probing of backend ground truth
//! - `rpc`: control socket protocol and server

pub mod config;
pub mod daemon;
pub mod error;
pub mod names;
pub mod platform;
pub mod reconciler;
pub mod rpc;
pub mod ssh;
pub mod state;
pub mod vault;

pub use daemon::{
    CreateRequest, Daemon, DaemonConfig, DaemonParts, InstanceInfo, InstanceState, ResizeRequest,
};
pub use error::DaemonError;
pub use platform::MockPlatform;
pub use vault::{ImageVault, VaultConfig};
