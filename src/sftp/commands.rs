//! Request-level file operations for collaborators.
//!
//! Each request names a host by id plus login fields; the host is resolved
//! through the inventory seam and a connection is opened for that request only.

use super::{validate_remote_path, FileInfo, SftpClient, TransferProgress};
use crate::config::{HostResolver, SshSettings, TransferSettings};
use crate::error::{EngineError, EngineResult};
use crate::ssh::{ConnectParams, Credentials};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Host and login shared by every file request
#[derive(Debug, Clone, Deserialize)]
pub struct HostLogin {
    pub host_id: String,
    pub username: String,
    #[serde(flatten)]
    pub credentials: Credentials,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListFilesRequest {
    #[serde(flatten)]
    pub login: HostLogin,
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct ListFilesResponse {
    pub entries: Vec<FileInfo>,
    pub current_path: String,
}

/// Request naming one remote path
#[derive(Debug, Clone, Deserialize)]
pub struct PathRequest {
    #[serde(flatten)]
    pub login: HostLogin,
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RenameRequest {
    #[serde(flatten)]
    pub login: HostLogin,
    pub from_path: String,
    pub to_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadRequest {
    #[serde(flatten)]
    pub login: HostLogin,
    pub remote_path: String,
    pub contents: Vec<u8>,
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub path: String,
    pub bytes_written: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PermissionsRequest {
    #[serde(flatten)]
    pub login: HostLogin,
    pub path: String,
    pub mode: String,
}

/// Resolves hosts and runs one file operation per request
pub struct FileService {
    hosts: Arc<dyn HostResolver>,
    ssh: SshSettings,
    transfer: TransferSettings,
}

impl FileService {
    pub fn new(hosts: Arc<dyn HostResolver>, ssh: SshSettings, transfer: TransferSettings) -> Self {
        Self { hosts, ssh, transfer }
    }

    /// Connection parameters for a request, without connecting
    pub fn params_for(&self, login: &HostLogin) -> EngineResult<ConnectParams> {
        let host = self
            .hosts
            .resolve(&login.host_id)
            .ok_or_else(|| EngineError::HostNotFound(login.host_id.clone()))?;
        Ok(ConnectParams::for_host(
            &host,
            login.username.clone(),
            login.credentials.clone(),
            &self.ssh,
        ))
    }

    async fn open(&self, login: &HostLogin) -> EngineResult<SftpClient> {
        let params = self.params_for(login)?;
        SftpClient::connect(&params, self.transfer.chunk_size).await
    }

    pub async fn list_files(&self, request: ListFilesRequest) -> EngineResult<ListFilesResponse> {
        tracing::info!("SFTP list: host={}, path={}", request.login.host_id, request.path);
        let requested = if request.path.trim().is_empty() {
            None
        } else {
            Some(validate_remote_path(&request.path)?)
        };
        let client = self.open(&request.login).await?;

        let current_path = match requested {
            Some(path) => Ok(path),
            None => client.home_dir().await,
        };
        let result = match current_path {
            Ok(current_path) => client.list_files(&current_path).await.map(|entries| ListFilesResponse {
                entries,
                current_path,
            }),
            Err(e) => Err(e),
        };
        client.close();
        result
    }

    pub async fn stat(&self, request: PathRequest) -> EngineResult<FileInfo> {
        tracing::info!("SFTP stat: host={}, path={}", request.login.host_id, request.path);
        let path = validate_remote_path(&request.path)?;
        let client = self.open(&request.login).await?;
        let result = client.stat(&path).await;
        client.close();
        result
    }

    pub async fn download(&self, request: PathRequest) -> EngineResult<Vec<u8>> {
        tracing::info!("SFTP download: host={}, path={}", request.login.host_id, request.path);
        let path = validate_remote_path(&request.path)?;
        let client = self.open(&request.login).await?;
        let traced = path.clone();
        let result = client
            .download_bytes(&path, move |p: TransferProgress| {
                tracing::trace!("{}: {}/{} bytes", traced, p.transferred, p.total);
            })
            .await;
        client.close();
        result
    }

    pub async fn upload(&self, request: UploadRequest) -> EngineResult<UploadResponse> {
        tracing::info!(
            "SFTP upload: host={}, path={}, size={}",
            request.login.host_id,
            request.remote_path,
            request.contents.len()
        );
        let path = validate_remote_path(&request.remote_path)?;
        let client = self.open(&request.login).await?;
        let result = client
            .upload_bytes(request.contents, &path, request.overwrite, |_| {})
            .await;
        client.close();
        Ok(UploadResponse {
            path,
            bytes_written: result?,
        })
    }

    pub async fn delete(&self, request: PathRequest) -> EngineResult<()> {
        tracing::info!("SFTP delete: host={}, path={}", request.login.host_id, request.path);
        let path = validate_remote_path(&request.path)?;
        let client = self.open(&request.login).await?;
        let result = client.delete(&path).await;
        client.close();
        result
    }

    pub async fn rename(&self, request: RenameRequest) -> EngineResult<()> {
        tracing::info!(
            "SFTP rename: host={}, from={}, to={}",
            request.login.host_id,
            request.from_path,
            request.to_path
        );
        let from = validate_remote_path(&request.from_path)?;
        let to = validate_remote_path(&request.to_path)?;
        let client = self.open(&request.login).await?;
        let result = client.rename(&from, &to).await;
        client.close();
        result
    }

    pub async fn create_directory(&self, request: PathRequest) -> EngineResult<()> {
        tracing::info!("SFTP mkdir: host={}, path={}", request.login.host_id, request.path);
        let path = validate_remote_path(&request.path)?;
        let client = self.open(&request.login).await?;
        let result = client.create_directory(&path).await;
        client.close();
        result
    }

    pub async fn set_permissions(&self, request: PermissionsRequest) -> EngineResult<()> {
        tracing::info!(
            "SFTP chmod: host={}, path={}, mode={}",
            request.login.host_id,
            request.path,
            request.mode
        );
        // Bad modes and paths fail before any connection is made
        super::parse_mode(&request.mode)?;
        let path = validate_remote_path(&request.path)?;
        let client = self.open(&request.login).await?;
        let result = client.set_permissions(&path, &request.mode).await;
        client.close();
        result
    }

    pub async fn home_dir(&self, login: HostLogin) -> EngineResult<String> {
        let client = self.open(&login).await?;
        let result = client.home_dir().await;
        client.close();
        result
    }
}
