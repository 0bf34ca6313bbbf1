use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::model::LocationDescriptor;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, Default)]
pub struct StorageCapacity {
    pub available_bytes: u64,
    pub total_bytes: u64,
}

/// Where archived bytes live. The orchestrator and executor only ever talk to
/// this interface; local-disk and remote-store runs share all task logic.
pub trait StorageBackend: Send + Sync {
    fn kind(&self) -> &'static str;

    fn location(&self) -> LocationDescriptor;

    /// Directory archives are produced into locally: the final destination for
    /// the local backend, a staging directory for the cloud backend.
    fn target_root_dir(&self) -> &Path;

    fn is_remote(&self) -> bool;

    fn accessible_capacity(&self) -> Result<StorageCapacity>;

    /// No-op success on the local backend.
    fn upload<'a>(
        &'a self,
        src: &'a Path,
        remote_dir: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    fn download<'a>(
        &'a self,
        remote_path: &'a str,
        dst_dir: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

fn statvfs_capacity(path: &Path) -> Result<StorageCapacity> {
    let stat = nix::sys::statvfs::statvfs(path)
        .map_err(|e| Error::Io(std::io::Error::from_raw_os_error(e as i32)))?;
    let frag = stat.fragment_size() as u64;
    Ok(StorageCapacity {
        available_bytes: stat.blocks_available() as u64 * frag,
        total_bytes: stat.blocks() as u64 * frag,
    })
}

/// Archives live directly under a local root directory.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl StorageBackend for LocalBackend {
    fn kind(&self) -> &'static str {
        "local"
    }

    fn location(&self) -> LocationDescriptor {
        LocationDescriptor::Local {
            root: self.root.clone(),
        }
    }

    fn target_root_dir(&self) -> &Path {
        &self.root
    }

    fn is_remote(&self) -> bool {
        false
    }

    fn accessible_capacity(&self) -> Result<StorageCapacity> {
        std::fs::create_dir_all(&self.root)?;
        statvfs_capacity(&self.root)
    }

    fn upload<'a>(
        &'a self,
        _src: &'a Path,
        _remote_dir: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async { Ok(()) })
    }

    fn download<'a>(
        &'a self,
        _remote_path: &'a str,
        _dst_dir: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async { Ok(()) })
    }
}

/// Opaque remote-store capability: upload/download whole files by remote path.
pub trait RemoteClient: Send + Sync {
    fn endpoint(&self) -> &str;

    fn upload<'a>(
        &'a self,
        src: &'a Path,
        remote_path: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    fn download<'a>(
        &'a self,
        remote_path: &'a str,
        dst: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// Archives are staged locally, then shipped to a remote store.
pub struct CloudBackend {
    client: Arc<dyn RemoteClient>,
    remote_dir: String,
    staging: PathBuf,
}

impl CloudBackend {
    pub fn new(
        client: Arc<dyn RemoteClient>,
        remote_dir: impl Into<String>,
        staging: impl Into<PathBuf>,
    ) -> Self {
        Self {
            client,
            remote_dir: remote_dir.into(),
            staging: staging.into(),
        }
    }

    fn remote_path(&self, rel: &str) -> String {
        if self.remote_dir.is_empty() {
            rel.to_string()
        } else {
            format!("{}/{rel}", self.remote_dir.trim_end_matches('/'))
        }
    }
}

impl StorageBackend for CloudBackend {
    fn kind(&self) -> &'static str {
        "cloud"
    }

    fn location(&self) -> LocationDescriptor {
        LocationDescriptor::Cloud {
            endpoint: self.client.endpoint().to_string(),
            remote_dir: self.remote_dir.clone(),
        }
    }

    fn target_root_dir(&self) -> &Path {
        &self.staging
    }

    fn is_remote(&self) -> bool {
        true
    }

    /// Capacity of the staging volume; every archive passes through it.
    fn accessible_capacity(&self) -> Result<StorageCapacity> {
        std::fs::create_dir_all(&self.staging)?;
        statvfs_capacity(&self.staging)
    }

    fn upload<'a>(
        &'a self,
        src: &'a Path,
        remote_dir: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let file_name = src
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| Error::InvalidConfig {
                    message: format!("upload source has no file name: {}", src.display()),
                })?;
            let remote_path = self.remote_path(&format!("{remote_dir}/{file_name}"));
            debug!(
                event = "io.remote.upload",
                src = %src.display(),
                remote_path,
                "io.remote.upload"
            );
            self.client.upload(src, &remote_path).await.map_err(|e| {
                error!(
                    event = "io.remote.upload_failed",
                    src = %src.display(),
                    remote_path,
                    error = %e,
                    "io.remote.upload_failed"
                );
                e
            })
        })
    }

    fn download<'a>(
        &'a self,
        remote_path: &'a str,
        dst_dir: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let file_name = remote_path.rsplit('/').next().unwrap_or(remote_path);
            let full_remote = self.remote_path(remote_path);
            let dst = dst_dir.join(file_name);
            std::fs::create_dir_all(dst_dir)?;
            debug!(
                event = "io.remote.download",
                remote_path = full_remote,
                dst = %dst.display(),
                "io.remote.download"
            );
            self.client.download(&full_remote, &dst).await.map_err(|e| {
                error!(
                    event = "io.remote.download_failed",
                    remote_path = full_remote,
                    error = %e,
                    "io.remote.download_failed"
                );
                e
            })
        })
    }
}

/// Plain HTTP object store: PUT/GET `<base_url>/<remote_path>`.
pub struct HttpRemoteClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRemoteClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, remote_path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            remote_path.trim_start_matches('/')
        )
    }
}

impl RemoteClient for HttpRemoteClient {
    fn endpoint(&self) -> &str {
        &self.base_url
    }

    fn upload<'a>(
        &'a self,
        src: &'a Path,
        remote_path: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let bytes = tokio::fs::read(src).await?;
            let res = self
                .client
                .put(self.url(remote_path))
                .body(bytes)
                .send()
                .await
                .map_err(|e| Error::Remote {
                    message: format!("upload request failed: {e}"),
                })?;

            let status = res.status();
            if !status.is_success() {
                let body = res.text().await.unwrap_or_default();
                return Err(Error::Remote {
                    message: format!("upload http {status}: {body}"),
                });
            }
            Ok(())
        })
    }

    fn download<'a>(
        &'a self,
        remote_path: &'a str,
        dst: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let res = self
                .client
                .get(self.url(remote_path))
                .send()
                .await
                .map_err(|e| Error::Remote {
                    message: format!("download request failed: {e}"),
                })?;

            let status = res.status();
            if !status.is_success() {
                return Err(Error::Remote {
                    message: format!("download http {status}: {remote_path}"),
                });
            }
            let bytes = res.bytes().await.map_err(|e| Error::Remote {
                message: format!("download read failed: {e}"),
            })?;
            tokio::fs::write(dst, &bytes).await?;
            Ok(())
        })
    }
}

/// In-memory remote store for tests.
#[derive(Debug, Default)]
pub struct InMemoryRemote {
    pub uploaded: AtomicUsize,
    inner: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, remote_path: &str) -> Option<Vec<u8>> {
        self.inner.lock().await.get(remote_path).cloned()
    }

    pub async fn insert(&self, remote_path: &str, bytes: Vec<u8>) {
        self.inner.lock().await.insert(remote_path.to_string(), bytes);
    }

    pub async fn object_count(&self) -> usize {
        self.inner.lock().await.len()
    }
}

impl RemoteClient for InMemoryRemote {
    fn endpoint(&self) -> &str {
        "test.mem"
    }

    fn upload<'a>(
        &'a self,
        src: &'a Path,
        remote_path: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let bytes = tokio::fs::read(src).await?;
            self.inner
                .lock()
                .await
                .insert(remote_path.to_string(), bytes);
            self.uploaded.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }

    fn download<'a>(
        &'a self,
        remote_path: &'a str,
        dst: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let bytes = self
                .inner
                .lock()
                .await
                .get(remote_path)
                .cloned()
                .ok_or_else(|| Error::Remote {
                    message: format!("object not found: {remote_path}"),
                })?;
            tokio::fs::write(dst, &bytes).await?;
            Ok(())
        })
    }
}
