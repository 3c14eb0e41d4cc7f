//! In-memory compute nodes and archive hosts that understand the scripts the engine runs.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use simfleet_core::layout::{EXIT_STATUS_FILE, LOG_FILE, PID_FILE, remote_join};
use simfleet_core::{
    Archive, ArchiveId, CatalogSnapshot, Credentials, Endpoint, Model, Resource, Server, Template,
};

use crate::remote::{CommandOutput, Connector, RemoteChannel, RemoteError, RemoteReader};

const DF_OUTPUT: &str = "Filesystem     1024-blocks   Used Available Capacity Mounted on\n\
                         /dev/fake          1000000 250000    750000      25% /\n";

struct FakeProcess {
    dir: String,
    polls_left: u32,
    exit_code: i32,
    running: bool,
}

struct FakeHost {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    processes: HashMap<u32, FakeProcess>,
    next_pid: u32,
    unreachable: bool,
    epoch: u64,
    connects: usize,
    launches: usize,
    max_running: usize,
    hold: bool,
    /// Completion checks that report `running` before a launched process exits.
    run_polls: u32,
    exit_code: i32,
    fail_upload_suffix: Option<String>,
    cut_upload_suffix: Option<String>,
    fail_execs: u32,
    uploads: HashMap<String, usize>,
}

impl FakeHost {
    fn new() -> Self {
        Self {
            files: BTreeMap::new(),
            dirs: BTreeSet::new(),
            processes: HashMap::new(),
            next_pid: 1000,
            unreachable: false,
            epoch: 0,
            connects: 0,
            launches: 0,
            max_running: 0,
            hold: false,
            run_polls: 1,
            exit_code: 0,
            fail_upload_suffix: None,
            cut_upload_suffix: None,
            fail_execs: 0,
            uploads: HashMap::new(),
        }
    }

    fn add_dir(&mut self, path: &str) {
        let mut current = String::new();
        for part in path.split('/') {
            if part.is_empty() {
                if current.is_empty() && path.starts_with('/') {
                    current.push('/');
                }
                continue;
            }
            if !current.is_empty() && !current.ends_with('/') {
                current.push('/');
            }
            current.push_str(part);
            self.dirs.insert(current.clone());
        }
    }

    fn write_file(&mut self, path: &str, contents: Vec<u8>) {
        if let Some((parent, _)) = path.rsplit_once('/') {
            self.add_dir(parent);
        }
        self.files.insert(path.to_string(), contents);
    }

    fn add_process(&mut self, pid: u32, dir: &str, exit_code: i32) {
        self.processes.insert(
            pid,
            FakeProcess {
                dir: dir.to_string(),
                polls_left: self.run_polls,
                exit_code,
                running: true,
            },
        );
        let running = self.processes.values().filter(|p| p.running).count();
        self.max_running = self.max_running.max(running);
    }

    fn launch(&mut self, script: &str) -> CommandOutput {
        let dir = cd_dir(script);
        if !self.dirs.contains(&dir) {
            return failed(format!("cd: {dir}: No such file or directory"));
        }
        self.files.remove(&remote_join([dir.as_str(), PID_FILE]));
        self.files.remove(&remote_join([dir.as_str(), EXIT_STATUS_FILE]));

        self.launches += 1;
        let pid = self.next_pid;
        self.next_pid += 1;
        self.write_file(&remote_join([dir.as_str(), PID_FILE]), format!("{pid}\n").into_bytes());
        self.write_file(&remote_join([dir.as_str(), LOG_FILE]), b"step 0\n".to_vec());
        let exit_code = self.exit_code;
        self.add_process(pid, &dir, exit_code);
        ok(format!("{pid}\n"))
    }

    fn poll(&mut self, script: &str) -> CommandOutput {
        let dir = cd_dir(script);
        let pid: u32 = script
            .split("/proc/")
            .nth(1)
            .map(|rest| rest.chars().take_while(char::is_ascii_digit).collect::<String>())
            .and_then(|digits| digits.parse().ok())
            .unwrap_or(0);

        let hold = self.hold;
        let mut exited = None;
        if let Some(process) = self.processes.get_mut(&pid).filter(|p| p.running) {
            if hold {
                return ok("running\n".to_string());
            }
            if process.polls_left > 0 {
                process.polls_left -= 1;
                return ok("running\n".to_string());
            }
            process.running = false;
            exited = Some((process.dir.clone(), process.exit_code));
        }
        if let Some((process_dir, code)) = exited {
            self.write_file(
                &remote_join([process_dir.as_str(), EXIT_STATUS_FILE]),
                format!("{code}\n").into_bytes(),
            );
        }

        let status = self
            .files
            .get(&remote_join([dir.as_str(), EXIT_STATUS_FILE]))
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default();
        ok(status)
    }

    fn list(&self, dir: &str) -> CommandOutput {
        if !self.dirs.contains(dir) {
            return failed(format!("find: '{dir}': No such file or directory"));
        }
        let prefix = format!("{dir}/");
        let names: Vec<&str> = self
            .files
            .keys()
            .filter_map(|path| path.strip_prefix(&prefix))
            .filter(|name| !name.contains('/'))
            .collect();
        let mut out = names.join("\n");
        out.push('\n');
        ok(out)
    }

    fn exec(&mut self, script: &str) -> Result<CommandOutput, RemoteError> {
        if self.fail_execs > 0 {
            self.fail_execs -= 1;
            self.epoch += 1;
            return Err(RemoteError::Transport("connection reset by peer".to_string()));
        }

        if script.contains("echo $! >") {
            return Ok(self.launch(script));
        }
        if script.contains("/proc/") {
            return Ok(self.poll(script));
        }
        if script.starts_with("nvidia-smi") {
            return Ok(ok("GPU 0: Fake GPU (UUID: GPU-fake-0)\n".to_string()));
        }
        if let Some(rest) = script.strip_prefix("mkdir -p ") {
            let dir = shell_word(rest);
            self.add_dir(&dir);
            if script.contains("df -Pk") {
                return Ok(ok(DF_OUTPUT.to_string()));
            }
            return Ok(ok(String::new()));
        }
        if let Some(rest) = script.strip_prefix("if [ -e ") {
            let path = shell_word(rest);
            let found = self.files.contains_key(&path) || self.dirs.contains(&path);
            return Ok(ok(if found { "yes\n" } else { "no\n" }.to_string()));
        }
        if let Some(rest) = script.strip_prefix("find ") {
            return Ok(self.list(&shell_word(rest)));
        }
        Ok(failed(format!("fake host cannot run: {script}")))
    }
}

fn ok(output: String) -> CommandOutput {
    CommandOutput {
        success: true,
        output,
    }
}

fn failed(output: String) -> CommandOutput {
    CommandOutput {
        success: false,
        output,
    }
}

/// First shell word of `s`, with single quotes removed.
fn shell_word(s: &str) -> String {
    let mut out = String::new();
    let mut quoted = false;
    let mut chars = s.trim_start().chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' => quoted = !quoted,
            '\\' if !quoted => {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            c if c.is_whitespace() && !quoted => break,
            c => out.push(c),
        }
    }
    out
}

fn cd_dir(script: &str) -> String {
    script
        .lines()
        .find_map(|line| line.strip_prefix("cd "))
        .map(shell_word)
        .unwrap_or_default()
}

#[derive(Default)]
struct FleetState {
    hosts: HashMap<String, FakeHost>,
}

impl FleetState {
    fn host(&mut self, name: &str) -> &mut FakeHost {
        self.hosts
            .entry(name.to_string())
            .or_insert_with(FakeHost::new)
    }
}

/// Hosts are created on first use, reachable and empty.
#[derive(Clone, Default)]
pub(crate) struct FakeFleet {
    state: Arc<Mutex<FleetState>>,
}

impl FakeFleet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    pub(crate) fn endpoint(host: &str) -> Endpoint {
        Endpoint {
            address: host.to_string(),
            credentials: Credentials::default(),
        }
    }

    pub(crate) fn connects(&self, host: &str) -> usize {
        self.state.lock().host(host).connects
    }

    pub(crate) fn launches(&self, host: &str) -> usize {
        self.state.lock().host(host).launches
    }

    /// Most processes ever running at once on `host`.
    pub(crate) fn max_running(&self, host: &str) -> usize {
        self.state.lock().host(host).max_running
    }

    pub(crate) fn uploads(&self, host: &str, path: &str) -> usize {
        self.state
            .lock()
            .host(host)
            .uploads
            .get(path)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn put_file(&self, host: &str, path: &str, contents: &[u8]) {
        self.state.lock().host(host).write_file(path, contents.to_vec());
    }

    pub(crate) fn file(&self, host: &str, path: &str) -> Option<Vec<u8>> {
        self.state.lock().host(host).files.get(path).cloned()
    }

    /// Unreachable hosts refuse connections and kill the open ones.
    pub(crate) fn set_reachable(&self, host: &str, reachable: bool) {
        let mut state = self.state.lock();
        let host = state.host(host);
        host.unreachable = !reachable;
        if !reachable {
            host.epoch += 1;
        }
    }

    pub(crate) fn drop_connections(&self, host: &str) {
        self.state.lock().host(host).epoch += 1;
    }

    /// While held, running processes never exit.
    pub(crate) fn hold(&self, host: &str, hold: bool) {
        self.state.lock().host(host).hold = hold;
    }

    /// The next upload to a path ending in `suffix` fails.
    pub(crate) fn fail_next_upload(&self, host: &str, suffix: &str) {
        self.state.lock().host(host).fail_upload_suffix = Some(suffix.to_string());
    }

    /// The connection drops halfway through the next upload to a path ending in `suffix`.
    pub(crate) fn cut_next_upload(&self, host: &str, suffix: &str) {
        self.state.lock().host(host).cut_upload_suffix = Some(suffix.to_string());
    }

    /// The next `count` commands fail as if the connection dropped.
    pub(crate) fn fail_next_execs(&self, host: &str, count: u32) {
        self.state.lock().host(host).fail_execs = count;
    }

    /// A process started outside the engine, e.g. before a restart.
    pub(crate) fn spawn_process(&self, host: &str, dir: &str, pid: u32, exit_code: i32) {
        let mut state = self.state.lock();
        let host = state.host(host);
        host.add_dir(dir);
        host.add_process(pid, dir, exit_code);
    }
}

#[async_trait]
impl Connector for FakeFleet {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn RemoteChannel>, RemoteError> {
        let mut state = self.state.lock();
        let host = state.host(&endpoint.address);
        if host.unreachable {
            return Err(RemoteError::Transport(format!(
                "ssh: connect to host {}: Connection timed out",
                endpoint.address
            )));
        }
        host.connects += 1;
        Ok(Arc::new(FakeChannel {
            state: self.state.clone(),
            host: endpoint.address.clone(),
            epoch: host.epoch,
            closed: AtomicBool::new(false),
        }))
    }
}

struct FakeChannel {
    state: Arc<Mutex<FleetState>>,
    host: String,
    epoch: u64,
    closed: AtomicBool,
}

impl FakeChannel {
    fn with_host<T>(
        &self,
        f: impl FnOnce(&mut FakeHost) -> Result<T, RemoteError>,
    ) -> Result<T, RemoteError> {
        let mut state = self.state.lock();
        let host = state.host(&self.host);
        if self.closed.load(Ordering::SeqCst) || host.epoch != self.epoch || host.unreachable {
            return Err(RemoteError::Transport("connection closed".to_string()));
        }
        f(host)
    }
}

#[async_trait]
impl RemoteChannel for FakeChannel {
    async fn exec(&self, script: &str) -> Result<CommandOutput, RemoteError> {
        self.with_host(|host| host.exec(script))
    }

    async fn upload(&self, path: &str, contents: &[u8]) -> Result<(), RemoteError> {
        self.with_host(|host| {
            if host
                .fail_upload_suffix
                .as_deref()
                .is_some_and(|suffix| path.ends_with(suffix))
            {
                host.fail_upload_suffix = None;
                return Err(RemoteError::Command(format!("upload {path}: Disk quota exceeded")));
            }
            if host
                .cut_upload_suffix
                .as_deref()
                .is_some_and(|suffix| path.ends_with(suffix))
            {
                host.cut_upload_suffix = None;
                let half = contents[..contents.len() / 2].to_vec();
                host.write_file(&format!("{path}.part"), half);
                host.epoch += 1;
                return Err(RemoteError::Transport("Broken pipe".to_string()));
            }
            host.write_file(path, contents.to_vec());
            *host.uploads.entry(path.to_string()).or_default() += 1;
            Ok(())
        })
    }

    async fn open_read(&self, path: &str) -> Result<RemoteReader, RemoteError> {
        let bytes = self.with_host(|host| {
            host.files
                .get(path)
                .cloned()
                .ok_or_else(|| RemoteError::Command(format!("cat {path}: No such file or directory")))
        })?;
        Ok(Box::pin(Cursor::new(bytes)))
    }

    fn is_alive(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let mut state = self.state.lock();
        let host = state.host(&self.host);
        host.epoch == self.epoch && !host.unreachable
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// `servers` enabled nodes (`node1`, `node2`, ...) with one GPU each, one model and one template.
pub(crate) fn sample_catalog(servers: u64) -> CatalogSnapshot {
    CatalogSnapshot {
        servers: (1..=servers)
            .map(|id| Server {
                id,
                address: format!("node{id}"),
                credentials: Credentials {
                    username: "sim".to_string(),
                    ..Credentials::default()
                },
                working_directory: "/scratch".to_string(),
                enabled: true,
            })
            .collect(),
        resources: (1..=servers)
            .map(|id| Resource {
                server_id: id,
                device_id: 0,
                name: "Fake GPU".to_string(),
                uuid: format!("GPU-fake-{id}"),
                in_use: false,
            })
            .collect(),
        models: vec![Model {
            id: 1,
            name: "Villin".to_string(),
            files: vec!["villin.tpr".to_string(), "villin.top".to_string()],
        }],
        templates: vec![Template {
            id: 1,
            name: "npt".to_string(),
            file: PathBuf::from("templates/npt.conf"),
        }],
        ..CatalogSnapshot::default()
    }
}

pub(crate) fn sample_archive(id: ArchiveId, host: &str) -> Archive {
    Archive {
        id,
        address: host.to_string(),
        credentials: Credentials::default(),
        working_directory: "/archive".to_string(),
        enabled: true,
        space_used: 0,
        space_total: 0,
    }
}
