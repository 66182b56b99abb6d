//! Image sources.
//!
//! A source turns an alias into a byte stream plus whatever the publisher
//! claims about it (expected hash, size). The stream is lazy: nothing is
//! transferred until the vault polls it, so a resolve that lands on an
//! already-cached hash costs one manifest lookup.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, Stream, TryStreamExt};
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tracing::debug;

use super::VaultError;

const FILE_CHUNK_SIZE: usize = 1024 * 1024;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, VaultError>> + Send>>;

/// A resolved image, ready to be streamed.
pub struct ResolvedImage {
    pub url: String,
    /// Hex SHA-256 published for the image, if any.
    pub sha256: Option<String>,
    pub size: Option<u64>,
    pub stream: ByteStream,
}

impl std::fmt::Debug for ResolvedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedImage")
            .field("url", &self.url)
            .field("sha256", &self.sha256)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Resolves aliases to image bytes.
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn resolve(&self, alias: &str) -> Result<ResolvedImage, VaultError>;
}

/// Published image list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageManifest {
    pub images: Vec<ManifestImage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestImage {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Absolute, or relative to the manifest URL.
    pub url: String,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

impl ImageManifest {
    pub fn find(&self, alias: &str) -> Option<&ManifestImage> {
        self.images
            .iter()
            .find(|image| image.name == alias || image.aliases.iter().any(|a| a == alias))
    }
}

/// Fetches images over HTTP(S), or from local files.
///
/// Aliases that are themselves `http(s)://` or `file://` URLs bypass the
/// manifest.
pub struct HttpImageSource {
    client: Client,
    manifest_url: String,
}

impl HttpImageSource {
    pub fn new(manifest_url: impl Into<String>) -> Result<Self, VaultError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            manifest_url: manifest_url.into(),
        })
    }

    async fn fetch_manifest(&self) -> Result<(Url, ImageManifest), VaultError> {
        let base = Url::parse(&self.manifest_url)
            .map_err(|e| VaultError::Source(format!("bad manifest URL: {e}")))?;

        let manifest = if base.scheme() == "file" {
            let path = file_path(&base)?;
            let content = tokio::fs::read(&path).await?;
            serde_json::from_slice(&content)
                .map_err(|e| VaultError::Source(format!("bad manifest: {e}")))?
        } else {
            debug!(url = %base, "Fetching image manifest");
            self.client
                .get(base.clone())
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?
        };

        Ok((base, manifest))
    }

    async fn open(
        &self,
        url: Url,
        sha256: Option<String>,
        size: Option<u64>,
    ) -> Result<ResolvedImage, VaultError> {
        match url.scheme() {
            "file" => {
                let path = file_path(&url)?;
                let metadata = tokio::fs::metadata(&path)
                    .await
                    .map_err(|_| VaultError::ImageNotFound(path.display().to_string()))?;
                Ok(ResolvedImage {
                    url: url.to_string(),
                    sha256,
                    size: size.or(Some(metadata.len())),
                    stream: file_stream(path),
                })
            }
            "http" | "https" => Ok(ResolvedImage {
                url: url.to_string(),
                sha256,
                size,
                stream: http_stream(self.client.clone(), url),
            }),
            other => Err(VaultError::Source(format!("unsupported URL scheme {other}"))),
        }
    }
}

#[async_trait]
impl ImageSource for HttpImageSource {
    async fn resolve(&self, alias: &str) -> Result<ResolvedImage, VaultError> {
        if let Ok(url) = Url::parse(alias) {
            if matches!(url.scheme(), "http" | "https" | "file") {
                return self.open(url, None, None).await;
            }
        }

        let (base, manifest) = self.fetch_manifest().await?;
        let image = manifest
            .find(alias)
            .ok_or_else(|| VaultError::ImageNotFound(alias.to_string()))?;
        let url = base
            .join(&image.url)
            .map_err(|e| VaultError::Source(format!("bad image URL {}: {e}", image.url)))?;

        self.open(url, image.sha256.clone(), image.size).await
    }
}

fn file_path(url: &Url) -> Result<PathBuf, VaultError> {
    url.to_file_path()
        .map_err(|_| VaultError::Source(format!("bad file URL {url}")))
}

fn http_stream(client: Client, url: Url) -> ByteStream {
    let stream = stream::once(async move {
        let response = client.get(url.clone()).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(VaultError::ImageNotFound(url.to_string()));
        }
        let response = response.error_for_status()?;
        Ok(response.bytes_stream().map_err(VaultError::from))
    })
    .try_flatten();

    Box::pin(stream)
}

fn file_stream(path: PathBuf) -> ByteStream {
    let stream = stream::once(async move { tokio::fs::File::open(&path).await })
        .map_err(VaultError::from)
        .map_ok(|file| {
            stream::try_unfold(file, |mut file| async move {
                let mut buf = vec![0u8; FILE_CHUNK_SIZE];
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    return Ok(None);
                }
                buf.truncate(n);
                Ok::<_, VaultError>(Some((Bytes::from(buf), file)))
            })
        })
        .try_flatten();

    Box::pin(stream)
}

pub fn file_url(path: &Path) -> Option<String> {
    Url::from_file_path(path).ok().map(|url| url.to_string())
}
