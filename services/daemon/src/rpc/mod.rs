//! Control socket protocol.
//!
//! A client connects, writes one JSON [`Request`] terminated by a newline and
//! reads newline-delimited JSON [`Frame`]s until the connection closes.
//! `progress` frames may arrive while the request runs; exactly one `reply`
//! or `error` frame ends the exchange.

mod server;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use server::RpcServer;

use crate::daemon::{
    CreateRequest, Daemon, ExecInfo, InstanceInfo, ProgressSink, ResizeRequest, SshInfo,
};
use crate::error::DaemonError;
use crate::platform::ResourceSpec;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("request exceeds {0} bytes")]
    TooLarge(usize),
}

fn default_image() -> String {
    CreateRequest::default().image
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Request {
    Create {
        #[serde(default)]
        name: Option<String>,
        #[serde(default = "default_image")]
        image: String,
        #[serde(default)]
        resources: ResourceSpec,
    },
    Start {
        names: Vec<String>,
    },
    Stop {
        names: Vec<String>,
    },
    Suspend {
        names: Vec<String>,
    },
    Restart {
        names: Vec<String>,
    },
    /// Move to the trash, or destroy right away with `purge`.
    Trash {
        names: Vec<String>,
        #[serde(default)]
        purge: bool,
    },
    Recover {
        names: Vec<String>,
    },
    /// Empty the trash. No names means everything in it.
    Purge {
        #[serde(default)]
        names: Vec<String>,
    },
    List,
    Info {
        name: String,
    },
    Version,
    SshInfo {
        name: String,
    },
    /// `argv` is the command line to run inside the guest.
    Exec {
        name: String,
        argv: Vec<String>,
    },
    Resize {
        name: String,
        #[serde(default)]
        cpus: Option<u32>,
        #[serde(default)]
        memory_bytes: Option<u64>,
        #[serde(default)]
        disk_bytes: Option<u64>,
    },
}

impl Request {
    pub fn command(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Start { .. } => "start",
            Self::Stop { .. } => "stop",
            Self::Suspend { .. } => "suspend",
            Self::Restart { .. } => "restart",
            Self::Trash { .. } => "trash",
            Self::Recover { .. } => "recover",
            Self::Purge { .. } => "purge",
            Self::List => "list",
            Self::Info { .. } => "info",
            Self::Version => "version",
            Self::SshInfo { .. } => "ssh_info",
            Self::Exec { .. } => "exec",
            Self::Resize { .. } => "resize",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl From<&DaemonError> for ErrorBody {
    fn from(err: &DaemonError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Outcome of a command for one of several names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NameResult {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<InstanceInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reply {
    Instance { instance: InstanceInfo },
    Instances { instances: Vec<InstanceInfo> },
    Results { results: Vec<NameResult> },
    Version { version: String },
    SshInfo { ssh: SshInfo },
    Exec { exec: ExecInfo },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    Progress { message: String },
    Reply { reply: Reply },
    Error { error: ErrorBody },
}

/// Run `op` for every distinct name concurrently.
async fn for_each_name<'a, F, Fut>(names: &'a [String], op: F) -> Reply
where
    F: Fn(&'a str) -> Fut,
    Fut: std::future::Future<Output = Result<InstanceInfo, DaemonError>>,
{
    let mut unique: Vec<&'a String> = Vec::with_capacity(names.len());
    for name in names {
        if !unique.contains(&name) {
            unique.push(name);
        }
    }

    let results = join_all(unique.into_iter().map(|name| {
        let fut = op(name.as_str());
        async move {
            match fut.await {
                Ok(instance) => NameResult {
                    name: name.clone(),
                    instance: Some(instance),
                    error: None,
                },
                Err(e) => NameResult {
                    name: name.clone(),
                    instance: None,
                    error: Some(ErrorBody::from(&e)),
                },
            }
        }
    }))
    .await;

    Reply::Results { results }
}

/// Execute a request against the daemon.
pub async fn dispatch(
    daemon: &Daemon,
    request: Request,
    progress: Option<ProgressSink>,
) -> Result<Reply, DaemonError> {
    let reply = match request {
        Request::Create {
            name,
            image,
            resources,
        } => {
            let request = CreateRequest {
                name,
                image,
                resources,
            };
            let instance = daemon.create(request, progress).await?;
            Reply::Instance { instance }
        }
        Request::Start { names } => for_each_name(&names, |name| daemon.start(name)).await,
        Request::Stop { names } => for_each_name(&names, |name| daemon.stop(name)).await,
        Request::Suspend { names } => for_each_name(&names, |name| daemon.suspend(name)).await,
        Request::Restart { names } => for_each_name(&names, |name| daemon.restart(name)).await,
        Request::Trash { names, purge } => {
            for_each_name(&names, |name| daemon.trash(name, purge)).await
        }
        Request::Recover { names } => for_each_name(&names, |name| daemon.recover(name)).await,
        Request::Purge { names } => Reply::Instances {
            instances: daemon.purge(&names).await?,
        },
        Request::List => Reply::Instances {
            instances: daemon.list().await,
        },
        Request::Info { name } => Reply::Instance {
            instance: daemon.info(&name).await?,
        },
        Request::Version => Reply::Version {
            version: daemon.version().to_string(),
        },
        Request::SshInfo { name } => Reply::SshInfo {
            ssh: daemon.ssh_info(&name).await?,
        },
        Request::Exec { name, argv } => Reply::Exec {
            exec: daemon.exec(&name, argv).await?,
        },
        Request::Resize {
            name,
            cpus,
            memory_bytes,
            disk_bytes,
        } => {
            let request = ResizeRequest {
                cpus,
                memory_bytes,
                disk_bytes,
            };
            Reply::Instance {
                instance: daemon.resize(&name, request).await?,
            }
        }
    };
    Ok(reply)
}
