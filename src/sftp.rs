//! SFTP subsystem.
//!
//! Hosts an SFTP server over the session channel against the workspace
//! filesystem. Relative paths resolve against the user's home directory so
//! connections land there, the same place a login shell starts.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::os::unix::fs::{FileExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use russh::server::Msg;
use russh::Channel;
use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle as SftpHandle, Name, OpenFlags, Status, StatusCode,
    Version,
};

use crate::metrics::ServerMetrics;

/// How many directory entries go out per readdir response.
const READDIR_BATCH: usize = 128;

const MAX_HANDLES: usize = 256;

/// Serves SFTP on the session channel until the client disconnects.
pub(crate) async fn run_sftp(metrics: Arc<ServerMetrics>, channel: Channel<Msg>, cwd: PathBuf) {
    metrics.sftp_connections_total.fetch_add(1, Ordering::Relaxed);

    let session = SftpSession {
        cwd,
        metrics,
        next_handle: 0,
        handles: HashMap::new(),
    };
    russh_sftp::server::run(channel.into_stream(), session).await;
}

struct FileHandle {
    path: PathBuf,
    file: Option<Arc<std::fs::File>>,
    dir: Option<tokio::fs::ReadDir>,
}

struct SftpSession {
    cwd: PathBuf,
    metrics: Arc<ServerMetrics>,
    next_handle: u64,
    handles: HashMap<String, FileHandle>,
}

impl SftpSession {
    /// Resolves a client path; relative paths land in the home directory.
    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.cwd.join(path)
        }
    }

    fn next_handle_id(&mut self) -> String {
        let id = self.next_handle;
        self.next_handle += 1;
        format!("{:x}", id)
    }

    fn io_error(&self, err: &std::io::Error) -> StatusCode {
        match err.kind() {
            std::io::ErrorKind::NotFound => StatusCode::NoSuchFile,
            std::io::ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
            _ => {
                self.metrics.sftp_server_errors.fetch_add(1, Ordering::Relaxed);
                StatusCode::Failure
            }
        }
    }

    fn ok(id: u32) -> Status {
        Status {
            id,
            status_code: StatusCode::Ok,
            error_message: "Ok".to_string(),
            language_tag: "en-US".to_string(),
        }
    }

    fn convert_entry(path: &Path, metadata: std::fs::Metadata) -> File {
        let mut attrs = FileAttributes {
            size: Some(metadata.len()),
            atime: None,
            mtime: metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as u32),
            permissions: Some(metadata.permissions().mode()),
            ..Default::default()
        };
        attrs.set_dir(metadata.is_dir());
        attrs.set_regular(metadata.is_file());
        attrs.set_symlink(metadata.is_symlink());

        File::new(
            path.file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "/".to_string()),
            attrs,
        )
    }
}

impl russh_sftp::server::Handler for SftpSession {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(
        &mut self,
        _version: u32,
        _extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        Ok(Version::new())
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let resolved = self.resolve(&path);
        let canonical = resolved.canonicalize().unwrap_or(resolved);
        Ok(Name {
            id,
            files: vec![File::dummy(canonical.to_string_lossy())],
        })
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> Result<SftpHandle, Self::Error> {
        if self.handles.len() >= MAX_HANDLES {
            return Err(StatusCode::Failure);
        }

        let path = self.resolve(&filename);
        let file = OpenOptions::from(pflags)
            .open(&path)
            .map_err(|err| self.io_error(&err))?;

        let handle = self.next_handle_id();
        self.handles.insert(
            handle.clone(),
            FileHandle {
                path,
                file: Some(Arc::new(file)),
                dir: None,
            },
        );

        Ok(SftpHandle { id, handle })
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        self.handles.remove(&handle);
        Ok(Self::ok(id))
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        let entry = self.handles.get(&handle).ok_or(StatusCode::NoSuchFile)?;
        let file = entry.file.as_ref().ok_or(StatusCode::NoSuchFile)?.clone();

        let result = tokio::task::spawn_blocking(move || {
            let mut buf = vec![0; len.min(16 * 1024 * 1024) as usize];
            file.read_at(&mut buf, offset).map(|n| {
                buf.truncate(n);
                buf
            })
        })
        .await
        .map_err(|_| StatusCode::Failure)?;

        match result {
            Ok(data) if data.is_empty() => Err(StatusCode::Eof),
            Ok(data) => Ok(Data { id, data }),
            Err(err) => Err(self.io_error(&err)),
        }
    }

    async fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Status, Self::Error> {
        let entry = self.handles.get(&handle).ok_or(StatusCode::NoSuchFile)?;
        let file = entry.file.as_ref().ok_or(StatusCode::NoSuchFile)?.clone();

        let result = tokio::task::spawn_blocking(move || file.write_all_at(&data, offset))
            .await
            .map_err(|_| StatusCode::Failure)?;

        result.map_err(|err| self.io_error(&err))?;
        Ok(Self::ok(id))
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let path = self.resolve(&path);
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|err| self.io_error(&err))?;
        Ok(Attrs {
            id,
            attrs: Self::convert_entry(&path, metadata).attrs,
        })
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let path = self.resolve(&path);
        let metadata = tokio::fs::symlink_metadata(&path)
            .await
            .map_err(|err| self.io_error(&err))?;
        Ok(Attrs {
            id,
            attrs: Self::convert_entry(&path, metadata).attrs,
        })
    }

    async fn fstat(&mut self, id: u32, handle: String) -> Result<Attrs, Self::Error> {
        let path = {
            let entry = self.handles.get(&handle).ok_or(StatusCode::NoSuchFile)?;
            entry.path.to_string_lossy().into_owned()
        };
        self.stat(id, path).await
    }

    async fn setstat(
        &mut self,
        id: u32,
        path: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        let path = self.resolve(&path);

        if let Some(permissions) = attrs.permissions {
            let permissions = std::fs::Permissions::from_mode(permissions & 0o7777);
            tokio::fs::set_permissions(&path, permissions)
                .await
                .map_err(|err| self.io_error(&err))?;
        }

        if let Some(size) = attrs.size {
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .map_err(|err| self.io_error(&err))?;
            file.set_len(size).map_err(|err| self.io_error(&err))?;
        }

        Ok(Self::ok(id))
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<SftpHandle, Self::Error> {
        if self.handles.len() >= MAX_HANDLES {
            return Err(StatusCode::Failure);
        }

        let path = self.resolve(&path);
        let dir = tokio::fs::read_dir(&path)
            .await
            .map_err(|err| self.io_error(&err))?;

        let handle = self.next_handle_id();
        self.handles.insert(
            handle.clone(),
            FileHandle {
                path,
                file: None,
                dir: Some(dir),
            },
        );

        Ok(SftpHandle { id, handle })
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        let entry = self
            .handles
            .get_mut(&handle)
            .ok_or(StatusCode::NoSuchFile)?;
        let dir = entry.dir.as_mut().ok_or(StatusCode::NoSuchFile)?;

        let mut files = Vec::new();
        loop {
            let dirent = match dir.next_entry().await {
                Ok(Some(dirent)) => dirent,
                Ok(None) => break,
                Err(_) => return Err(StatusCode::NoSuchFile),
            };

            let path = dirent.path();
            let metadata = match tokio::fs::symlink_metadata(&path).await {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };
            files.push(Self::convert_entry(&path, metadata));

            if files.len() >= READDIR_BATCH {
                break;
            }
        }

        if files.is_empty() {
            return Err(StatusCode::Eof);
        }
        Ok(Name { id, files })
    }

    async fn remove(&mut self, id: u32, filename: String) -> Result<Status, Self::Error> {
        let path = self.resolve(&filename);
        tokio::fs::remove_file(&path)
            .await
            .map_err(|err| self.io_error(&err))?;
        Ok(Self::ok(id))
    }

    async fn mkdir(
        &mut self,
        id: u32,
        path: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        let path = self.resolve(&path);
        tokio::fs::create_dir(&path)
            .await
            .map_err(|err| self.io_error(&err))?;

        if let Some(permissions) = attrs.permissions {
            let permissions = std::fs::Permissions::from_mode(permissions & 0o7777);
            let _ = tokio::fs::set_permissions(&path, permissions).await;
        }

        Ok(Self::ok(id))
    }

    async fn rmdir(&mut self, id: u32, path: String) -> Result<Status, Self::Error> {
        let path = self.resolve(&path);
        tokio::fs::remove_dir(&path)
            .await
            .map_err(|err| self.io_error(&err))?;
        Ok(Self::ok(id))
    }

    async fn rename(
        &mut self,
        id: u32,
        old_path: String,
        new_path: String,
    ) -> Result<Status, Self::Error> {
        let old_path = self.resolve(&old_path);
        let new_path = self.resolve(&new_path);
        tokio::fs::rename(&old_path, &new_path)
            .await
            .map_err(|err| self.io_error(&err))?;
        Ok(Self::ok(id))
    }

    async fn readlink(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let path = self.resolve(&path);
        let target = tokio::fs::read_link(&path)
            .await
            .map_err(|err| self.io_error(&err))?;
        Ok(Name {
            id,
            files: vec![File::dummy(target.to_string_lossy())],
        })
    }

    async fn symlink(
        &mut self,
        id: u32,
        link_path: String,
        target_path: String,
    ) -> Result<Status, Self::Error> {
        let link_path = self.resolve(&link_path);
        tokio::fs::symlink(&target_path, &link_path)
            .await
            .map_err(|err| self.io_error(&err))?;
        Ok(Self::ok(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(cwd: &Path) -> SftpSession {
        SftpSession {
            cwd: cwd.to_path_buf(),
            metrics: Arc::new(ServerMetrics::new()),
            next_handle: 0,
            handles: HashMap::new(),
        }
    }

    #[test]
    fn test_resolve_relative_to_home() {
        let session = session(Path::new("/home/dev"));
        assert_eq!(session.resolve("notes.txt"), PathBuf::from("/home/dev/notes.txt"));
        assert_eq!(session.resolve("/etc/hosts"), PathBuf::from("/etc/hosts"));
    }

    #[test]
    fn test_io_error_mapping() {
        let session = session(Path::new("/"));
        let not_found = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert_eq!(session.io_error(&not_found), StatusCode::NoSuchFile);
        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert_eq!(session.io_error(&denied), StatusCode::PermissionDenied);

        let other = std::io::Error::other("boom");
        assert_eq!(session.io_error(&other), StatusCode::Failure);
        assert_eq!(session.metrics.snapshot().sftp_server_errors, 1);
    }

    #[test]
    fn test_convert_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"12345").unwrap();

        let file = SftpSession::convert_entry(&path, std::fs::metadata(&path).unwrap());
        assert_eq!(file.name, "data.bin");
        assert_eq!(file.attrs.size, Some(5));
        assert!(file.attrs.permissions.is_some());
    }
}
