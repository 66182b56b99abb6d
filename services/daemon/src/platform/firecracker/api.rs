//! Client for Firecracker's HTTP API on its Unix socket.

use std::path::{Path, PathBuf};
use std::time::Duration;

use hyper::{body::Buf, Body, Client, Method, Request};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error};

use super::config::{
    BootSource, DriveConfig, GuestMetadata, MachineConfig, MmdsConfig, NetworkInterface,
    SnapshotCreate, SnapshotLoad,
};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("request error: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("{path} timed out after {timeout:?}")]
    Timeout { path: String, timeout: Duration },
}

#[derive(Serialize)]
struct Action {
    action_type: &'static str,
}

#[derive(Serialize)]
struct VmState {
    state: &'static str,
}

/// Firecracker API client bound to one VM's socket.
pub struct FirecrackerClient {
    socket_path: PathBuf,
    client: Client<UnixConnector>,
    timeout: Duration,
}

impl FirecrackerClient {
    pub fn new(socket_path: impl AsRef<Path>, timeout: Duration) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            client: Client::unix(),
            timeout,
        }
    }

    pub async fn put_machine_config(&self, config: &MachineConfig) -> Result<(), ApiError> {
        self.send(Method::PUT, "/machine-config", config).await
    }

    pub async fn put_boot_source(&self, config: &BootSource) -> Result<(), ApiError> {
        self.send(Method::PUT, "/boot-source", config).await
    }

    pub async fn put_drive(&self, config: &DriveConfig) -> Result<(), ApiError> {
        let path = format!("/drives/{}", config.drive_id);
        self.send(Method::PUT, &path, config).await
    }

    pub async fn put_network_interface(&self, config: &NetworkInterface) -> Result<(), ApiError> {
        let path = format!("/network-interfaces/{}", config.iface_id);
        self.send(Method::PUT, &path, config).await
    }

    pub async fn put_mmds_config(&self, config: &MmdsConfig) -> Result<(), ApiError> {
        self.send(Method::PUT, "/mmds/config", config).await
    }

    pub async fn put_mmds(&self, metadata: &GuestMetadata) -> Result<(), ApiError> {
        self.send(Method::PUT, "/mmds", metadata).await
    }

    pub async fn start_instance(&self) -> Result<(), ApiError> {
        let action = Action {
            action_type: "InstanceStart",
        };
        self.send(Method::PUT, "/actions", &action).await
    }

    /// Ask the guest to shut down.
    pub async fn send_ctrl_alt_del(&self) -> Result<(), ApiError> {
        let action = Action {
            action_type: "SendCtrlAltDel",
        };
        self.send(Method::PUT, "/actions", &action).await
    }

    pub async fn pause(&self) -> Result<(), ApiError> {
        self.send(Method::PATCH, "/vm", &VmState { state: "Paused" })
            .await
    }

    pub async fn resume(&self) -> Result<(), ApiError> {
        self.send(Method::PATCH, "/vm", &VmState { state: "Resumed" })
            .await
    }

    pub async fn create_snapshot(&self, snapshot: &SnapshotCreate) -> Result<(), ApiError> {
        self.send(Method::PUT, "/snapshot/create", snapshot).await
    }

    pub async fn load_snapshot(&self, snapshot: &SnapshotLoad) -> Result<(), ApiError> {
        self.send(Method::PUT, "/snapshot/load", snapshot).await
    }

    async fn send<T: Serialize>(&self, method: Method, path: &str, body: &T) -> Result<(), ApiError> {
        match tokio::time::timeout(self.timeout, self.request(method, path, body)).await {
            Ok(result) => result,
            Err(_) => Err(ApiError::Timeout {
                path: path.to_string(),
                timeout: self.timeout,
            }),
        }
    }

    async fn request<T: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: &T,
    ) -> Result<(), ApiError> {
        let body_bytes = serde_json::to_vec(body)?;
        let uri = Uri::new(&self.socket_path, path);

        debug!(method = %method, path = path, "Firecracker API request");

        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .body(Body::from(body_bytes))?;

        let response = self.client.request(request).await?;
        let status = response.status();

        if status.is_success() {
            Ok(())
        } else {
            let body = hyper::body::aggregate(response.into_body()).await?;
            let message = String::from_utf8_lossy(body.chunk()).to_string();
            error!(status = %status, path = path, message = %message, "Firecracker API error");
            Err(ApiError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_socket_is_an_http_error() {
        let dir = tempfile::tempdir().unwrap();
        let client = FirecrackerClient::new(dir.path().join("missing.sock"), Duration::from_secs(5));

        let err = client.start_instance().await.unwrap_err();
        assert!(matches!(err, ApiError::Http(_)));
    }
}
