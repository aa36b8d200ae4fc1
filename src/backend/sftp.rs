//! SFTP backend using `russh` + `russh-sftp`.
//!
//! Each logical operation opens its own SSH session, uses it for the
//! duration of that operation and disconnects afterwards. A chunk stream and
//! a final-object writer each own their session until they are consumed.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use russh::client;
use russh::keys::known_hosts::{known_host_keys_path, learn_known_hosts_path};
use russh::keys::ssh_key;
use russh_sftp::client::SftpSession;
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::protocol::{OpenFlags, StatusCode};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use super::{
    ChunkStore, ChunkStream, FinalObjectWriter, StoreError, StoreResult, ancestors_below,
    temp_name, validate_key,
};
use crate::models::upload_object::StorageKind;
use crate::services::path_namer::chunk_name;

/// Inactivity timeout for established SSH sessions.
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(300);

const MKDIR_ATTEMPTS: usize = 3;

/// Connection parameters for the remote host.
#[derive(Clone)]
pub struct SftpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub base_path: String,
    /// When set, the server key must match this file (learned on first use).
    pub known_hosts: Option<PathBuf>,
    pub connect_timeout: Duration,
    pub operation_timeout: Duration,
}

impl std::fmt::Debug for SftpSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("base_path", &self.base_path)
            .field("known_hosts", &self.known_hosts)
            .field("connect_timeout", &self.connect_timeout)
            .field("operation_timeout", &self.operation_timeout)
            .finish()
    }
}

/// SSH client handler. Host identity is only checked when a known_hosts
/// file is configured.
struct SshHandler {
    host: String,
    port: u16,
    known_hosts: Option<PathBuf>,
}

impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        let Some(path) = self.known_hosts.as_deref() else {
            warn!(
                host = %self.host,
                port = self.port,
                "accepting SSH host key without verification"
            );
            return Ok(true);
        };

        ensure_known_hosts_file(path).map_err(russh::Error::IO)?;
        let known = known_host_keys_path(&self.host, self.port, path)?;
        if known.iter().any(|(_, key)| key == server_public_key) {
            return Ok(true);
        }
        if known.is_empty() {
            learn_known_hosts_path(&self.host, self.port, server_public_key, path)?;
            warn!(
                host = %self.host,
                port = self.port,
                known_hosts = %path.display(),
                "learned new SSH host key"
            );
            return Ok(true);
        }
        Err(russh::Error::KeyChanged { line: known[0].0 })
    }
}

fn ensure_known_hosts_file(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
    {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}

/// An open SSH session with the SFTP subsystem started.
struct SftpConn {
    sftp: SftpSession,
    session: client::Handle<SshHandler>,
}

impl SftpConn {
    async fn close(self) {
        let _ = self.sftp.close().await;
        let _ = self
            .session
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await;
    }
}

pub struct SftpStore {
    settings: Arc<SftpSettings>,
    root: String,
}

impl SftpStore {
    pub fn new(settings: SftpSettings) -> Self {
        let root = normalize_root(&settings.base_path);
        Self {
            settings: Arc::new(settings),
            root,
        }
    }

    fn full_path(&self, key: &str) -> StoreResult<String> {
        validate_key(key)?;
        Ok(join_root_key(&self.root, key))
    }

    /// Open a session and start the SFTP subsystem. The whole handshake,
    /// authentication included, runs under the connect timeout.
    async fn connect(&self) -> StoreResult<SftpConn> {
        let s = &self.settings;
        tokio::time::timeout(s.connect_timeout, self.handshake())
            .await
            .map_err(|_| {
                StoreError::Unavailable(format!(
                    "SSH connect to {}:{} timed out after {}s",
                    s.host,
                    s.port,
                    s.connect_timeout.as_secs()
                ))
            })?
    }

    async fn handshake(&self) -> StoreResult<SftpConn> {
        let s = &self.settings;
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(INACTIVITY_TIMEOUT),
            ..Default::default()
        });
        let handler = SshHandler {
            host: s.host.clone(),
            port: s.port,
            known_hosts: s.known_hosts.clone(),
        };

        let mut session = client::connect(config, (s.host.as_str(), s.port), handler)
            .await
            .map_err(|e| ssh_error("connect", &s.host, s.port, e))?;

        let auth = session
            .authenticate_password(&s.username, &s.password)
            .await
            .map_err(|e| ssh_error("authenticate", &s.host, s.port, e))?;
        if !auth.success() {
            return Err(StoreError::Unavailable(format!(
                "SSH password authentication failed for user '{}' on {}:{}",
                s.username, s.host, s.port
            )));
        }

        let channel = session
            .channel_open_session()
            .await
            .map_err(|e| ssh_error("open channel", &s.host, s.port, e))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| ssh_error("request sftp subsystem", &s.host, s.port, e))?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| sftp_error("session init", &format!("{}:{}", s.host, s.port), e))?;

        debug!(host = %s.host, port = s.port, "opened SFTP session");
        Ok(SftpConn { sftp, session })
    }

    /// Run `op` on a fresh connection under the operation timeout, then
    /// disconnect regardless of the outcome.
    async fn with_conn<T, F, Fut>(&self, name: &str, op: F) -> StoreResult<T>
    where
        F: FnOnce(Arc<SftpConn>) -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let conn = Arc::new(self.connect().await?);
        let result = timed(self.settings.operation_timeout, name, op(conn.clone())).await;
        if let Ok(conn) = Arc::try_unwrap(conn) {
            conn.close().await;
        }
        result
    }
}

async fn timed<T>(
    limit: Duration,
    name: &str,
    fut: impl Future<Output = StoreResult<T>>,
) -> StoreResult<T> {
    tokio::time::timeout(limit, fut).await.map_err(|_| {
        StoreError::Unavailable(format!("SFTP {name} timed out after {}s", limit.as_secs()))
    })?
}

/// Normalize the configured base path to an absolute path without a
/// trailing slash.
fn normalize_root(root: &str) -> String {
    let root = root.trim_matches('/');
    if root.is_empty() {
        "/".to_string()
    } else {
        format!("/{root}")
    }
}

fn join_root_key(root: &str, key: &str) -> String {
    let key = key.trim_start_matches('/');
    if key.is_empty() {
        root.to_string()
    } else if root == "/" {
        format!("/{key}")
    } else {
        format!("{root}/{key}")
    }
}

fn parent_of(path: &str) -> Option<&str> {
    path.rsplit_once('/')
        .map(|(parent, _)| if parent.is_empty() { "/" } else { parent })
}

fn ssh_error(op: &str, host: &str, port: u16, e: russh::Error) -> StoreError {
    StoreError::Unavailable(format!("SSH {op} {host}:{port}: {e}"))
}

fn sftp_error(op: &str, path: &str, e: SftpError) -> StoreError {
    StoreError::Unavailable(format!("SFTP {op} '{path}': {e}"))
}

fn is_not_found(e: &SftpError) -> bool {
    matches!(e, SftpError::Status(s) if s.status_code == StatusCode::NoSuchFile)
}

/// Create `path` and its ancestors. A parent removed by a concurrent
/// empty-directory sweep is recreated on the next attempt.
async fn mkdir_p(sftp: &SftpSession, path: &str) -> StoreResult<()> {
    let mut attempt = 1;
    loop {
        match mkdir_components(sftp, path).await {
            Err(e) if attempt < MKDIR_ATTEMPTS => {
                debug!(path, attempt, "retrying mkdir: {e}");
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// SFTP has no recursive mkdir, so every component is created (or
/// confirmed) in turn, parent first.
async fn mkdir_components(sftp: &SftpSession, path: &str) -> StoreResult<()> {
    let mut current = String::new();
    for component in path.split('/') {
        if component.is_empty() {
            if current.is_empty() {
                current.push('/');
            }
            continue;
        }
        if current.is_empty() || current == "/" {
            current = format!("{current}{component}");
        } else {
            current = format!("{current}/{component}");
        }
        if sftp.metadata(&current).await.is_ok() {
            continue;
        }
        if let Err(e) = sftp.create_dir(&current).await {
            // Lost a race with another writer creating the same directory.
            if sftp.metadata(&current).await.is_err() {
                return Err(sftp_error("mkdir", &current, e));
            }
        }
    }
    Ok(())
}

/// Upload to a temporary sibling, then replace `path` with it.
async fn put_atomic(sftp: &SftpSession, path: &str, data: &[u8]) -> StoreResult<()> {
    let parent = parent_of(path).unwrap_or("/");
    let tmp = join_root_key(parent, &temp_name());

    let written = async {
        let mut file = sftp
            .open_with_flags(
                &tmp,
                OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
            )
            .await
            .map_err(|e| sftp_error("create", &tmp, e))?;
        file.write_all(data)
            .await
            .map_err(|e| StoreError::io("write", &tmp, e))?;
        file.shutdown()
            .await
            .map_err(|e| StoreError::io("close", &tmp, e))?;
        replace_remote(sftp, &tmp, path).await
    }
    .await;

    if written.is_err() {
        let _ = sftp.remove_file(&tmp).await;
    }
    written
}

/// SFTP rename refuses to overwrite, so an existing target is removed first.
async fn replace_remote(sftp: &SftpSession, from: &str, to: &str) -> StoreResult<()> {
    match sftp.remove_file(to).await {
        Ok(()) => {}
        Err(e) if is_not_found(&e) => {}
        Err(e) => return Err(sftp_error("remove", to, e)),
    }
    sftp.rename(from, to)
        .await
        .map_err(|e| sftp_error("rename", to, e))
}

async fn read_chunk(
    sftp: &SftpSession,
    path: &str,
    index: u32,
    limit: Duration,
) -> StoreResult<Bytes> {
    timed(limit, "read chunk", async {
        let mut file = match sftp.open(path).await {
            Ok(f) => f,
            Err(e) if is_not_found(&e) => return Err(StoreError::ChunkMissing(index)),
            Err(e) => return Err(sftp_error("open", path, e)),
        };
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .await
            .map_err(|e| StoreError::io("read", path, e))?;
        Ok(Bytes::from(buf))
    })
    .await
}

struct ChunkReadState {
    conn: Option<SftpConn>,
    dir: String,
    next: u32,
    count: u32,
    limit: Duration,
}

#[async_trait]
impl ChunkStore for SftpStore {
    fn kind(&self) -> StorageKind {
        StorageKind::Remote
    }

    async fn ensure_directory(&self, path: &str) -> StoreResult<()> {
        let full = self.full_path(path)?;
        self.with_conn("mkdir", |conn| async move { mkdir_p(&conn.sftp, &full).await })
            .await
    }

    async fn write_chunk(&self, staging_dir: &str, index: u32, bytes: Bytes) -> StoreResult<()> {
        let dir = self.full_path(staging_dir)?;
        let path = format!("{dir}/{}", chunk_name(index));
        self.with_conn("write chunk", |conn| async move {
            mkdir_p(&conn.sftp, &dir).await?;
            put_atomic(&conn.sftp, &path, &bytes).await?;
            debug!(path = %path, size = bytes.len(), "wrote remote chunk");
            Ok(())
        })
        .await
    }

    async fn read_chunks_in_order(
        &self,
        staging_dir: &str,
        count: u32,
    ) -> StoreResult<ChunkStream> {
        let dir = self.full_path(staging_dir)?;
        let conn = self.connect().await?;
        let state = ChunkReadState {
            conn: Some(conn),
            dir,
            next: 0,
            count,
            limit: self.settings.operation_timeout,
        };

        let stream = futures::stream::unfold(state, |mut st| async move {
            let conn = st.conn.take()?;
            if st.next >= st.count {
                conn.close().await;
                return None;
            }
            let index = st.next;
            st.next += 1;
            let path = format!("{}/{}", st.dir, chunk_name(index));
            let item = read_chunk(&conn.sftp, &path, index, st.limit).await;
            if item.is_ok() {
                st.conn = Some(conn);
            } else {
                conn.close().await;
            }
            Some((item, st))
        });
        Ok(stream.boxed())
    }

    async fn create_final_object(&self, path: &str) -> StoreResult<Box<dyn FinalObjectWriter>> {
        let final_path = self.full_path(path)?;
        let parent = parent_of(&final_path).unwrap_or("/").to_string();
        let tmp_path = join_root_key(&parent, &temp_name());
        let conn = self.connect().await?;

        let opened = timed(self.settings.operation_timeout, "create", async {
            mkdir_p(&conn.sftp, &parent).await?;
            conn.sftp
                .open_with_flags(
                    &tmp_path,
                    OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
                )
                .await
                .map_err(|e| sftp_error("create", &tmp_path, e))
        })
        .await;

        match opened {
            Ok(file) => Ok(Box::new(SftpFinalWriter {
                conn: Some(conn),
                file: Some(file),
                tmp_path,
                final_path,
                limit: self.settings.operation_timeout,
            })),
            Err(e) => {
                conn.close().await;
                Err(e)
            }
        }
    }

    async fn remove_directory_tree(&self, staging_dir: &str) -> StoreResult<()> {
        let dir = self.full_path(staging_dir)?;
        self.with_conn("remove tree", |conn| async move {
            let entries = match conn.sftp.read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if is_not_found(&e) => return Ok(()),
                Err(e) => return Err(sftp_error("readdir", &dir, e)),
            };
            for entry in entries {
                let name = entry.file_name();
                if name == "." || name == ".." || entry.metadata().file_type().is_dir() {
                    continue;
                }
                let path = format!("{dir}/{name}");
                if let Err(e) = conn.sftp.remove_file(&path).await {
                    if !is_not_found(&e) {
                        return Err(sftp_error("remove", &path, e));
                    }
                }
            }
            conn.sftp
                .remove_dir(&dir)
                .await
                .map_err(|e| sftp_error("rmdir", &dir, e))
        })
        .await
    }

    async fn remove_empty_ancestors(&self, path: &str, stop_at: &str) -> StoreResult<()> {
        let dirs = ancestors_below(path, stop_at)?
            .iter()
            .map(|key| join_root_key(&self.root, key))
            .collect::<Vec<_>>();
        self.with_conn("remove empty directories", |conn| async move {
            for dir in &dirs {
                match conn.sftp.remove_dir(dir).await {
                    Ok(()) => debug!(path = %dir, "removed empty remote directory"),
                    Err(e) if is_not_found(&e) => {}
                    // SFTP reports a non-empty directory as a generic failure.
                    Err(e) => {
                        debug!(path = %dir, "stopping directory sweep: {e}");
                        break;
                    }
                }
            }
            Ok(())
        })
        .await
    }

    /// Connect and list the base path.
    async fn test_reachability(&self) -> StoreResult<()> {
        let root = self.root.clone();
        self.with_conn("list base path", |conn| async move {
            conn.sftp
                .read_dir(&root)
                .await
                .map(|_| ())
                .map_err(|e| StoreError::Unavailable(format!("cannot access base path {root}: {e}")))
        })
        .await
    }
}

struct SftpFinalWriter {
    conn: Option<SftpConn>,
    file: Option<russh_sftp::client::fs::File>,
    tmp_path: String,
    final_path: String,
    limit: Duration,
}

#[async_trait]
impl FinalObjectWriter for SftpFinalWriter {
    async fn append(&mut self, bytes: &[u8]) -> StoreResult<()> {
        let file = self.file.as_mut().ok_or_else(|| {
            StoreError::io(
                "write",
                &self.final_path,
                std::io::Error::other("writer already closed"),
            )
        })?;
        let path = &self.tmp_path;
        timed(self.limit, "append", async {
            file.write_all(bytes)
                .await
                .map_err(|e| StoreError::io("write", path, e))
        })
        .await
    }

    async fn close(mut self: Box<Self>) -> StoreResult<()> {
        let Some(conn) = self.conn.take() else {
            return Err(StoreError::Unavailable("SFTP session already released".into()));
        };
        let file = self.file.take();
        let result = timed(self.limit, "close", async {
            if let Some(mut file) = file {
                file.shutdown()
                    .await
                    .map_err(|e| StoreError::io("close", &self.tmp_path, e))?;
            }
            replace_remote(&conn.sftp, &self.tmp_path, &self.final_path).await
        })
        .await;

        if result.is_err() {
            let _ = conn.sftp.remove_file(&self.tmp_path).await;
        }
        conn.close().await;
        result
    }

    async fn abort(mut self: Box<Self>) {
        self.file.take();
        if let Some(conn) = self.conn.take() {
            if let Err(e) = conn.sftp.remove_file(&self.tmp_path).await {
                debug!(path = %self.tmp_path, "failed to remove partial remote object: {e}");
            }
            conn.close().await;
        }
    }
}

impl Drop for SftpFinalWriter {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        self.file.take();
        let tmp_path = std::mem::take(&mut self.tmp_path);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = conn.sftp.remove_file(&tmp_path).await;
                conn.close().await;
            });
        }
    }
}
