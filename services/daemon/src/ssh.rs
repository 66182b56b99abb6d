//! SSH key material handed to guests and clients.

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SshKeyError {
    #[error("SSH key not found at {0}")]
    Missing(PathBuf),

    #[error("failed to read SSH key {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshKeyPair {
    /// OpenSSH public key line.
    pub public_key: String,
    /// PEM-encoded private key.
    pub private_key: String,
}

pub trait SshKeyProvider: Send + Sync {
    fn key_pair(&self) -> Result<SshKeyPair, SshKeyError>;
}

/// Reads `id_ed25519` and `id_ed25519.pub` from a directory.
#[derive(Debug, Clone)]
pub struct FileSshKeyProvider {
    dir: PathBuf,
}

impl FileSshKeyProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn read(path: &Path) -> Result<String, SshKeyError> {
        std::fs::read_to_string(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                SshKeyError::Missing(path.to_path_buf())
            } else {
                SshKeyError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })
    }
}

impl SshKeyProvider for FileSshKeyProvider {
    fn key_pair(&self) -> Result<SshKeyPair, SshKeyError> {
        let private_key = Self::read(&self.dir.join("id_ed25519"))?;
        let public_key = Self::read(&self.dir.join("id_ed25519.pub"))?
            .trim()
            .to_string();
        Ok(SshKeyPair {
            public_key,
            private_key,
        })
    }
}

/// Serves a fixed key pair.
#[derive(Debug, Clone)]
pub struct StaticSshKeyProvider(pub SshKeyPair);

impl SshKeyProvider for StaticSshKeyProvider {
    fn key_pair(&self) -> Result<SshKeyPair, SshKeyError> {
        Ok(self.0.clone())
    }
}
