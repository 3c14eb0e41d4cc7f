//! Remote execution channel: the capability set the engine needs from a compute node
//! or an archive host.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use simfleet_core::Endpoint;
use tokio::io::AsyncRead;

/// Failure of a remote operation.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// The connection is gone or could not be established. Recoverable by reconnecting.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The remote side ran the operation and reported failure.
    #[error("remote command failed: {0}")]
    Command(String),
    /// Local I/O while feeding or draining the channel.
    #[error("remote i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    /// Whether the error means the channel must be re-established.
    pub fn is_transport(&self) -> bool {
        matches!(self, RemoteError::Transport(_))
    }
}

/// Result of a remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Whether the command exited successfully.
    pub success: bool,
    /// Standard output followed by standard error.
    pub output: String,
}

/// Streamed contents of a remote file.
pub type RemoteReader = Pin<Box<dyn AsyncRead + Send>>;

/// An authenticated connection to one remote host.
///
/// Only `exec`, `upload`, `open_read`, `is_alive` and `close` are required; the
/// filesystem helpers default to shell commands run through `exec`.
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// Runs a shell script (fed to `bash`) and returns its combined output.
    async fn exec(&self, script: &str) -> Result<CommandOutput, RemoteError>;

    /// Writes `contents` to `path`, creating intermediate directories.
    ///
    /// `path` is replaced only once every byte arrived; an interrupted upload
    /// leaves it absent or at its previous contents.
    async fn upload(&self, path: &str, contents: &[u8]) -> Result<(), RemoteError>;

    /// Opens `path` for a streamed read.
    async fn open_read(&self, path: &str) -> Result<RemoteReader, RemoteError>;

    /// False once the keep-alive has failed; the channel is then unusable.
    fn is_alive(&self) -> bool;

    /// Tears the connection down. Idempotent.
    async fn close(&self);

    /// Creates `path` and its parents; succeeds if it already exists.
    async fn mkdir_all(&self, path: &str) -> Result<(), RemoteError> {
        let out = self.exec(&format!("mkdir -p {}", shell_quote(path))).await?;
        if !out.success {
            return Err(RemoteError::Command(format!(
                "mkdir -p {path}: {}",
                out.output.trim()
            )));
        }
        Ok(())
    }

    /// Whether `path` exists.
    async fn exists(&self, path: &str) -> Result<bool, RemoteError> {
        let out = self
            .exec(&format!(
                "if [ -e {} ]; then echo yes; else echo no; fi",
                shell_quote(path)
            ))
            .await?;
        Ok(last_line(&out.output) == Some("yes"))
    }

    /// Names of the regular files directly inside `dir`, sorted.
    async fn list_files(&self, dir: &str) -> Result<Vec<String>, RemoteError> {
        let out = self
            .exec(&format!(
                "find {} -mindepth 1 -maxdepth 1 -type f -printf '%f\\n'",
                shell_quote(dir)
            ))
            .await?;
        if !out.success {
            return Err(RemoteError::Command(format!(
                "list {dir}: {}",
                out.output.trim()
            )));
        }
        let mut files: Vec<String> = out
            .output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        files.sort();
        Ok(files)
    }
}

/// Opens channels to endpoints.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Authenticates against `endpoint` and starts its keep-alive.
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn RemoteChannel>, RemoteError>;
}

/// Quotes `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-' | '+' | ':' | ','))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Last non-empty, trimmed line of a command's output.
pub(crate) fn last_line(output: &str) -> Option<&str> {
    output.lines().map(str::trim).rev().find(|l| !l.is_empty())
}

/// A GPU reported by a compute node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredResource {
    /// Device index.
    pub device_id: u32,
    /// Product name.
    pub name: String,
    /// Device UUID.
    pub uuid: String,
}

/// Parses `nvidia-smi -L` lines of the form `GPU 0: <name> (UUID: <uuid>)`.
pub fn parse_gpu_list(output: &str) -> Vec<DiscoveredResource> {
    output
        .lines()
        .filter_map(|line| {
            let rest = line.trim().strip_prefix("GPU ")?;
            let (index, rest) = rest.split_once(": ")?;
            let device_id = index.trim().parse().ok()?;
            let (name, uuid) = rest.rsplit_once(" (UUID: ")?;
            let uuid = uuid.strip_suffix(')')?;
            Some(DiscoveredResource {
                device_id,
                name: name.trim().to_string(),
                uuid: uuid.trim().to_string(),
            })
        })
        .collect()
}

/// Lists the GPUs of the node behind `channel`.
pub async fn discover_resources(
    channel: &dyn RemoteChannel,
) -> Result<Vec<DiscoveredResource>, RemoteError> {
    let out = channel.exec("nvidia-smi -L").await?;
    if !out.success {
        return Err(RemoteError::Command(format!(
            "nvidia-smi -L: {}",
            out.output.trim()
        )));
    }
    Ok(parse_gpu_list(&out.output))
}

/// Disk usage of a filesystem, in KiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskSpace {
    /// Used KiB.
    pub used_kib: u64,
    /// Used plus available KiB.
    pub total_kib: u64,
}

/// Parses POSIX `df -Pk` output (header line, then one filesystem line).
pub fn parse_df(output: &str) -> Option<DiskSpace> {
    let line = output.lines().filter(|l| !l.trim().is_empty()).nth(1)?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    let used: u64 = fields.get(2)?.parse().ok()?;
    let available: u64 = fields.get(3)?.parse().ok()?;
    Some(DiskSpace {
        used_kib: used,
        total_kib: used.saturating_add(available),
    })
}

/// Reports the usage of the filesystem holding `dir`, creating `dir` first.
pub async fn disk_space(
    channel: &dyn RemoteChannel,
    dir: &str,
) -> Result<Option<DiskSpace>, RemoteError> {
    let dir = if dir.is_empty() { "." } else { dir };
    let quoted = shell_quote(dir);
    let out = channel
        .exec(&format!("mkdir -p {quoted} && df -Pk {quoted}"))
        .await?;
    if !out.success {
        return Err(RemoteError::Command(format!("df {dir}: {}", out.output.trim())));
    }
    Ok(parse_df(&out.output))
}
