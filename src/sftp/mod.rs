//! SFTP file transfer support
//!
//! `SftpClient` owns one authenticated connection and opens the SFTP
//! subsystem on it per operation. Every call runs on the blocking pool.

pub mod commands;
pub mod transfer;

pub use transfer::{copy_with_progress, format_permissions, parse_mode, validate_remote_path, TransferProgress};

use crate::error::{EngineError, EngineResult};
use crate::ssh::{connect, ConnectParams, RemoteConnection};
use serde::{Deserialize, Serialize};
use ssh2::{FileStat, OpenFlags, OpenType, Sftp};
use std::io::Cursor;
use std::path::{Path, PathBuf};

/// Remote file or directory entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub is_symlink: bool,
    pub size: u64,
    pub modified: Option<i64>,
    pub permissions: String,
}

impl FileInfo {
    fn from_stat(path: &Path, stat: &FileStat) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string());
        let is_symlink = stat.file_type().is_symlink();

        Self {
            name,
            path: path.to_string_lossy().to_string(),
            is_dir: stat.is_dir(),
            is_symlink,
            size: stat.size.unwrap_or(0),
            modified: stat.mtime.map(|t| t as i64),
            permissions: format_permissions(stat.perm.unwrap_or(0), stat.is_dir(), is_symlink),
        }
    }
}

/// Directories first, then case-insensitive by name
fn sort_entries(entries: &mut [FileInfo]) {
    entries.sort_by(|a, b| match (a.is_dir, b.is_dir) {
        (true, false) => std::cmp::Ordering::Less,
        (false, true) => std::cmp::Ordering::Greater,
        _ => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
    });
}

/// File operations against one host
pub struct SftpClient {
    connection: RemoteConnection,
    chunk_size: usize,
}

impl SftpClient {
    pub async fn connect(params: &ConnectParams, chunk_size: usize) -> EngineResult<Self> {
        let connection = connect(params).await?;
        Ok(Self::new(connection, chunk_size))
    }

    pub fn new(connection: RemoteConnection, chunk_size: usize) -> Self {
        Self {
            connection,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn host_id(&self) -> &str {
        self.connection.host_id()
    }

    pub fn close(self) {
        self.connection.close();
    }

    /// Run `op` with a fresh SFTP channel on the blocking pool.
    async fn with_sftp<T, F>(&self, operation: &'static str, op: F) -> EngineResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Sftp) -> EngineResult<T> + Send + 'static,
    {
        let session = self.connection.session().clone();
        let host_id = self.connection.host_id().to_string();

        tokio::task::spawn_blocking(move || {
            session.set_blocking(true);
            let sftp = session
                .sftp()
                .map_err(|e| EngineError::Ssh(format!("Failed to open SFTP: {}", e)))?;
            op(&sftp)
        })
        .await?
        .map_err(|e| match e {
            // Caller input problems are reported as-is
            EngineError::Resource(_) => e,
            other => other.context(host_id, operation),
        })
    }

    /// List directory contents, without `.` and `..`
    pub async fn list_files(&self, path: &str) -> EngineResult<Vec<FileInfo>> {
        let path = validate_remote_path(path)?;
        tracing::debug!("SFTP list {} on {}", path, self.host_id());

        self.with_sftp("list files", move |sftp| {
            let entries = sftp
                .readdir(Path::new(&path))
                .map_err(|e| EngineError::Ssh(format!("Failed to list directory: {}", e)))?;

            let mut result: Vec<FileInfo> = entries
                .iter()
                .map(|(entry_path, stat)| FileInfo::from_stat(entry_path, stat))
                .filter(|info| info.name != "." && info.name != "..")
                .collect();
            sort_entries(&mut result);
            Ok(result)
        })
        .await
    }

    pub async fn stat(&self, path: &str) -> EngineResult<FileInfo> {
        let path = validate_remote_path(path)?;
        self.with_sftp("stat", move |sftp| {
            let stat = sftp
                .stat(Path::new(&path))
                .map_err(|e| EngineError::Ssh(format!("Failed to stat: {}", e)))?;
            Ok(FileInfo::from_stat(Path::new(&path), &stat))
        })
        .await
    }

    /// Upload a local file. Returns bytes written.
    pub async fn upload<F>(&self, local: &Path, remote: &str, overwrite: bool, on_progress: F) -> EngineResult<u64>
    where
        F: FnMut(TransferProgress) + Send + 'static,
    {
        let remote = validate_remote_path(remote)?;
        let local = local.to_path_buf();
        let chunk_size = self.chunk_size;
        tracing::info!("Uploading {} to {}:{}", local.display(), self.host_id(), remote);

        self.with_sftp("upload", move |sftp| {
            let mut source = std::fs::File::open(&local)?;
            let total = source.metadata()?.len();
            write_remote(sftp, &remote, overwrite, &mut source, total, chunk_size, on_progress)
        })
        .await
    }

    /// Upload an in-memory payload. Returns bytes written.
    pub async fn upload_bytes<F>(&self, data: Vec<u8>, remote: &str, overwrite: bool, on_progress: F) -> EngineResult<u64>
    where
        F: FnMut(TransferProgress) + Send + 'static,
    {
        let remote = validate_remote_path(remote)?;
        let chunk_size = self.chunk_size;
        tracing::info!("Uploading {} bytes to {}:{}", data.len(), self.host_id(), remote);

        self.with_sftp("upload", move |sftp| {
            let total = data.len() as u64;
            write_remote(sftp, &remote, overwrite, &mut Cursor::new(data), total, chunk_size, on_progress)
        })
        .await
    }

    /// Download into a local file. Returns bytes read.
    pub async fn download<F>(&self, remote: &str, local: &Path, on_progress: F) -> EngineResult<u64>
    where
        F: FnMut(TransferProgress) + Send + 'static,
    {
        let remote = validate_remote_path(remote)?;
        let local: PathBuf = local.to_path_buf();
        let chunk_size = self.chunk_size;
        tracing::info!("Downloading {}:{} to {}", self.host_id(), remote, local.display());

        self.with_sftp("download", move |sftp| {
            let mut target = std::fs::File::create(&local)?;
            read_remote(sftp, &remote, &mut target, chunk_size, on_progress)
        })
        .await
    }

    /// Download into memory
    pub async fn download_bytes<F>(&self, remote: &str, on_progress: F) -> EngineResult<Vec<u8>>
    where
        F: FnMut(TransferProgress) + Send + 'static,
    {
        let remote = validate_remote_path(remote)?;
        let chunk_size = self.chunk_size;

        self.with_sftp("download", move |sftp| {
            let mut contents = Vec::new();
            read_remote(sftp, &remote, &mut contents, chunk_size, on_progress)?;
            Ok(contents)
        })
        .await
    }

    /// Delete a file, or an empty directory
    pub async fn delete(&self, path: &str) -> EngineResult<()> {
        let path = validate_remote_path(path)?;
        tracing::info!("Deleting {}:{}", self.host_id(), path);

        self.with_sftp("delete", move |sftp| {
            let target = Path::new(&path);
            let stat = sftp
                .lstat(target)
                .map_err(|e| EngineError::Ssh(format!("Failed to stat: {}", e)))?;
            if stat.is_dir() {
                sftp.rmdir(target)
                    .map_err(|e| EngineError::Ssh(format!("Failed to delete directory: {}", e)))
            } else {
                sftp.unlink(target)
                    .map_err(|e| EngineError::Ssh(format!("Failed to delete file: {}", e)))
            }
        })
        .await
    }

    /// Rename/move a file or directory
    pub async fn rename(&self, from: &str, to: &str) -> EngineResult<()> {
        let from = validate_remote_path(from)?;
        let to = validate_remote_path(to)?;
        tracing::info!("Renaming {} to {} on {}", from, to, self.host_id());

        self.with_sftp("rename", move |sftp| {
            sftp.rename(Path::new(&from), Path::new(&to), None)
                .map_err(|e| EngineError::Ssh(format!("Failed to rename: {}", e)))
        })
        .await
    }

    pub async fn create_directory(&self, path: &str) -> EngineResult<()> {
        let path = validate_remote_path(path)?;
        self.with_sftp("create directory", move |sftp| {
            sftp.mkdir(Path::new(&path), 0o755)
                .map_err(|e| EngineError::Ssh(format!("Failed to create directory: {}", e)))
        })
        .await
    }

    /// Apply an octal mode string such as `"0644"`
    pub async fn set_permissions(&self, path: &str, mode: &str) -> EngineResult<()> {
        let path = validate_remote_path(path)?;
        let mode = parse_mode(mode)?;

        self.with_sftp("set permissions", move |sftp| {
            let stat = FileStat {
                size: None,
                uid: None,
                gid: None,
                perm: Some(mode),
                atime: None,
                mtime: None,
            };
            sftp.setstat(Path::new(&path), stat)
                .map_err(|e| EngineError::Ssh(format!("Failed to set permissions: {}", e)))
        })
        .await
    }

    /// Login directory, `/` when the server will not say
    pub async fn home_dir(&self) -> EngineResult<String> {
        self.with_sftp("home dir", |sftp| {
            Ok(match sftp.realpath(Path::new(".")) {
                Ok(path) => path.to_string_lossy().to_string(),
                Err(_) => "/".to_string(),
            })
        })
        .await
    }
}

fn write_remote<R, F>(
    sftp: &Sftp,
    remote: &str,
    overwrite: bool,
    source: &mut R,
    total: u64,
    chunk_size: usize,
    on_progress: F,
) -> EngineResult<u64>
where
    R: std::io::Read,
    F: FnMut(TransferProgress),
{
    let target = Path::new(remote);
    if !overwrite && sftp.stat(target).is_ok() {
        return Err(EngineError::Resource(format!("Remote file {} already exists", remote)));
    }

    let flags = if overwrite {
        OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE
    } else {
        OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::EXCLUSIVE
    };
    let mut file = sftp
        .open_mode(target, flags, 0o644, OpenType::File)
        .map_err(|e| EngineError::Ssh(format!("Failed to create file: {}", e)))?;

    copy_with_progress(source, &mut file, total, chunk_size, on_progress).map_err(|(transferred, source)| {
        EngineError::PartialTransfer {
            path: remote.to_string(),
            transferred,
            source,
        }
    })
}

fn read_remote<W, F>(sftp: &Sftp, remote: &str, target: &mut W, chunk_size: usize, on_progress: F) -> EngineResult<u64>
where
    W: std::io::Write,
    F: FnMut(TransferProgress),
{
    let path = Path::new(remote);
    let total = sftp
        .stat(path)
        .map_err(|e| EngineError::Ssh(format!("Failed to stat: {}", e)))?
        .size
        .unwrap_or(0);
    let mut file = sftp
        .open(path)
        .map_err(|e| EngineError::Ssh(format!("Failed to open file: {}", e)))?;

    copy_with_progress(&mut file, target, total, chunk_size, on_progress).map_err(|(transferred, source)| {
        EngineError::PartialTransfer {
            path: remote.to_string(),
            transferred,
            source,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str, is_dir: bool) -> FileInfo {
        FileInfo {
            name: name.into(),
            path: format!("/srv/{}", name),
            is_dir,
            is_symlink: false,
            size: 0,
            modified: None,
            permissions: String::new(),
        }
    }

    #[test]
    fn test_directories_sort_first() {
        let mut entries = vec![info("b.txt", false), info("logs", true), info("A.txt", false), info("bin", true)];
        sort_entries(&mut entries);
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["bin", "logs", "A.txt", "b.txt"]);
    }

    #[test]
    fn test_file_info_from_stat() {
        let stat = FileStat {
            size: Some(42),
            uid: None,
            gid: None,
            perm: Some(0o100640),
            atime: None,
            mtime: Some(1_700_000_000),
        };
        let info = FileInfo::from_stat(Path::new("/etc/app.conf"), &stat);
        assert_eq!(info.name, "app.conf");
        assert_eq!(info.size, 42);
        assert!(!info.is_dir);
        assert_eq!(info.permissions, "-rw-r-----");
        assert_eq!(info.modified, Some(1_700_000_000));
    }

    /// Needs a reachable server: OPSRELAY_TEST_HOST, OPSRELAY_TEST_USER, OPSRELAY_TEST_PASSWORD
    #[tokio::test]
    #[ignore]
    async fn test_live_upload_download_roundtrip() {
        let host = std::env::var("OPSRELAY_TEST_HOST").unwrap();
        let user = std::env::var("OPSRELAY_TEST_USER").unwrap();
        let password = std::env::var("OPSRELAY_TEST_PASSWORD").unwrap();
        let params = ConnectParams::new("live", host, 22, user, crate::ssh::Credentials::password(password));

        let client = SftpClient::connect(&params, transfer::DEFAULT_CHUNK_SIZE).await.unwrap();
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 253) as u8).collect();
        let remote = format!("/tmp/opsrelay-{}", uuid::Uuid::new_v4());

        let written = client.upload_bytes(payload.clone(), &remote, false, |_| {}).await.unwrap();
        assert_eq!(written, payload.len() as u64);

        let last = std::sync::Arc::new(parking_lot::Mutex::new(None));
        let sink = last.clone();
        let fetched = client
            .download_bytes(&remote, move |p| *sink.lock() = Some(p))
            .await
            .unwrap();
        assert_eq!(fetched, payload);
        assert_eq!(last.lock().map(|p| p.transferred), Some(payload.len() as u64));

        assert!(client.upload_bytes(vec![1], &remote, false, |_| {}).await.is_err());
        client.delete(&remote).await.unwrap();
        client.close();
    }
}
