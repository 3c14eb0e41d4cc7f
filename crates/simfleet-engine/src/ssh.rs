//! [`Connector`] backed by the system OpenSSH client.
//!
//! Each channel owns one `ssh -M` control master; every operation is a
//! short-lived client multiplexed over its control socket, so a channel is a
//! single authenticated connection. Password credentials are fed to the master
//! through `sshpass -e`.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use simfleet_core::{Endpoint, SshSettings};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio::process::{Child, ChildStdout, Command};

use crate::remote::{CommandOutput, Connector, RemoteChannel, RemoteError, RemoteReader, shell_quote};

/// Exit status `ssh` itself uses for connection-level failures.
const SSH_TRANSPORT_EXIT: i32 = 255;

static NEXT_SOCKET: AtomicU64 = AtomicU64::new(0);

/// Opens OpenSSH control-master channels.
#[derive(Debug, Clone)]
pub struct SshConnector {
    settings: SshSettings,
    control_dir: PathBuf,
}

impl SshConnector {
    /// Creates a connector; control sockets go to `settings.control_dir` or a temp directory.
    pub fn new(settings: SshSettings) -> Self {
        let control_dir = settings
            .control_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("simfleet-ssh"));
        Self {
            settings,
            control_dir,
        }
    }
}

#[derive(Debug, Clone)]
struct SshTarget {
    destination: String,
    port: u16,
    control_path: PathBuf,
}

impl SshTarget {
    /// A client multiplexed over the control socket; never authenticates itself.
    fn client(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-p")
            .arg(self.port.to_string())
            .arg("-o")
            .arg("ControlMaster=no")
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg("-o")
            .arg("BatchMode=yes")
            .arg(&self.destination)
            .kill_on_drop(true);
        cmd
    }

    fn control(&self, op: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-p")
            .arg(self.port.to_string())
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg("-O")
            .arg(op)
            .arg(&self.destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    async fn check(&self) -> bool {
        matches!(self.control("check").status().await, Ok(status) if status.success())
    }
}

fn master_command(endpoint: &Endpoint, settings: &SshSettings, target: &SshTarget) -> Command {
    let creds = &endpoint.credentials;
    let mut cmd = match &creds.password {
        Some(password) => {
            let mut cmd = Command::new("sshpass");
            cmd.arg("-e").arg("ssh").env("SSHPASS", password);
            cmd
        }
        None => Command::new("ssh"),
    };
    cmd.arg("-M")
        .arg("-N")
        .arg("-p")
        .arg(target.port.to_string())
        .arg("-o")
        .arg("ControlMaster=yes")
        .arg("-o")
        .arg("ControlPersist=no")
        .arg("-o")
        .arg(format!("ControlPath={}", target.control_path.display()))
        .arg("-o")
        .arg(format!("ConnectTimeout={}", settings.connect_timeout_secs))
        .arg("-o")
        .arg(format!("ServerAliveInterval={}", settings.keepalive_interval_secs))
        .arg("-o")
        .arg("ServerAliveCountMax=1")
        .arg("-o")
        .arg("StrictHostKeyChecking=accept-new");
    if creds.password.is_none() {
        cmd.arg("-o").arg("BatchMode=yes");
    }
    if let Some(identity) = &creds.identity_file {
        cmd.arg("-i").arg(identity);
    }
    cmd.arg(&target.destination)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// Writes stdin to `<path>.part` and renames it into place, so `path` only ever
/// holds a complete file.
fn upload_command(path: &str) -> String {
    let part = format!("{path}.part");
    let store = format!(
        "cat > {} && mv -f {} {}",
        shell_quote(&part),
        shell_quote(&part),
        shell_quote(path)
    );
    match Path::new(path).parent().map(|p| p.to_string_lossy()) {
        Some(parent) if !parent.is_empty() => {
            format!("mkdir -p {} && {store}", shell_quote(&parent))
        }
        _ => store,
    }
}

fn destination(endpoint: &Endpoint) -> String {
    if endpoint.credentials.username.is_empty() {
        endpoint.address.clone()
    } else {
        format!("{}@{}", endpoint.credentials.username, endpoint.address)
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn RemoteChannel>, RemoteError> {
        tokio::fs::create_dir_all(&self.control_dir).await?;
        let socket = NEXT_SOCKET.fetch_add(1, Ordering::Relaxed);
        let target = SshTarget {
            destination: destination(endpoint),
            port: self.settings.port,
            control_path: self
                .control_dir
                .join(format!("cm-{}-{socket}", std::process::id())),
        };

        let mut master = master_command(endpoint, &self.settings, &target)
            .spawn()
            .map_err(|err| RemoteError::Transport(format!("spawn ssh master: {err}")))?;

        let timeout = Duration::from_secs(self.settings.connect_timeout_secs.max(1));
        wait_for_master(&mut master, &target, timeout, &endpoint.address).await?;

        let alive = Arc::new(AtomicBool::new(true));
        let keepalive = tokio::spawn(run_keepalive(
            target.clone(),
            alive.clone(),
            Duration::from_secs(self.settings.keepalive_interval_secs.max(1)),
        ));

        Ok(Arc::new(SshChannel {
            target,
            alive,
            master: tokio::sync::Mutex::new(Some(master)),
            keepalive: parking_lot::Mutex::new(Some(keepalive)),
        }))
    }
}

async fn wait_for_master(
    master: &mut Child,
    target: &SshTarget,
    timeout: Duration,
    address: &str,
) -> Result<(), RemoteError> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = master.try_wait()? {
            let mut stderr = String::new();
            if let Some(mut err) = master.stderr.take() {
                let _ = err.read_to_string(&mut stderr).await;
            }
            return Err(RemoteError::Transport(format!(
                "ssh to {address} exited ({status}): {}",
                stderr.trim()
            )));
        }
        if target.check().await {
            return Ok(());
        }
        if Instant::now() >= deadline {
            let _ = master.start_kill();
            return Err(RemoteError::Transport(format!(
                "ssh to {address}: no connection after {}s",
                timeout.as_secs()
            )));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

async fn run_keepalive(target: SshTarget, alive: Arc<AtomicBool>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if !target.check().await {
            alive.store(false, Ordering::SeqCst);
            return;
        }
    }
}

/// One control-master connection.
pub(crate) struct SshChannel {
    target: SshTarget,
    alive: Arc<AtomicBool>,
    master: tokio::sync::Mutex<Option<Child>>,
    keepalive: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SshChannel {
    fn ensure_alive(&self) -> Result<(), RemoteError> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(RemoteError::Transport(format!(
                "connection to {} lost",
                self.target.destination
            )))
        }
    }

    async fn run(&self, mut cmd: Command, stdin: &[u8]) -> Result<CommandOutput, RemoteError> {
        self.ensure_alive()?;
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| RemoteError::Transport(format!("spawn ssh: {err}")))?;

        if let Some(mut input) = child.stdin.take() {
            input.write_all(stdin).await?;
            input.shutdown().await?;
        }
        let out = child.wait_with_output().await?;

        let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&out.stderr));

        if out.status.code() == Some(SSH_TRANSPORT_EXIT) {
            self.alive.store(false, Ordering::SeqCst);
            return Err(RemoteError::Transport(output.trim().to_string()));
        }
        Ok(CommandOutput {
            success: out.status.success(),
            output,
        })
    }
}

#[async_trait]
impl RemoteChannel for SshChannel {
    async fn exec(&self, script: &str) -> Result<CommandOutput, RemoteError> {
        let mut cmd = self.target.client();
        cmd.arg("bash -s");
        self.run(cmd, script.as_bytes()).await
    }

    async fn upload(&self, path: &str, contents: &[u8]) -> Result<(), RemoteError> {
        let remote = upload_command(path);
        let mut cmd = self.target.client();
        cmd.arg(remote);
        let out = self.run(cmd, contents).await?;
        if !out.success {
            return Err(RemoteError::Command(format!(
                "upload {path}: {}",
                out.output.trim()
            )));
        }
        Ok(())
    }

    async fn open_read(&self, path: &str) -> Result<RemoteReader, RemoteError> {
        self.ensure_alive()?;
        let mut cmd = self.target.client();
        cmd.arg(format!("cat {}", shell_quote(path)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        let mut child = cmd
            .spawn()
            .map_err(|err| RemoteError::Transport(format!("spawn ssh: {err}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RemoteError::Transport("ssh stdout not captured".to_string()))?;
        Ok(Box::pin(ChildReader {
            child,
            stdout,
            path: path.to_string(),
        }))
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(task) = self.keepalive.lock().take() {
            task.abort();
        }
        let mut master = self.master.lock().await;
        if let Some(mut child) = master.take() {
            let _ = self.target.control("exit").status().await;
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

/// Streams a remote `cat`; a non-zero exit seen at end of stream is an error.
struct ChildReader {
    child: Child,
    stdout: ChildStdout,
    path: String,
}

impl AsyncRead for ChildReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let this = &mut *self;
        match Pin::new(&mut this.stdout).poll_read(cx, buf) {
            Poll::Ready(Ok(())) if buf.filled().len() == before => {
                match this.child.try_wait() {
                    Ok(Some(status)) if !status.success() => {
                        Poll::Ready(Err(std::io::Error::other(format!(
                            "remote read of {} failed ({status})",
                            this.path
                        ))))
                    }
                    Ok(_) => Poll::Ready(Ok(())),
                    Err(err) => Poll::Ready(Err(err)),
                }
            }
            other => other,
        }
    }
}
