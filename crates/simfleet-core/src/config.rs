use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    pub port: u16,
    pub connect_timeout_secs: u64,
    /// Interval between keep-alive probes; the first failed probe marks the link dead.
    pub keepalive_interval_secs: u64,
    /// Directory for control sockets. Defaults to a per-user temp directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_dir: Option<PathBuf>,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            port: 22,
            connect_timeout_secs: 60,
            keepalive_interval_secs: 2,
            control_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Local directory holding `<model name>/<file>` inputs.
    pub data_root: PathBuf,
    /// Executable launched for native configuration templates.
    pub native_command: String,
    /// Pacing of every resource worker loop.
    pub tick_ms: u64,
    /// Interval between completion checks of a running remote process.
    pub poll_interval_secs: u64,
    /// Upper bound of a random delay before provisioning a claimed instance.
    pub claim_jitter_secs: u64,
    pub ssh: SshSettings,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("data"),
            native_command: "ProtoMol".to_string(),
            tick_ms: 1_000,
            poll_interval_secs: 5,
            claim_jitter_secs: 0,
            ssh: SshSettings::default(),
        }
    }
}

impl FleetConfig {
    fn normalize(&mut self) {
        let defaults = Self::default();

        self.native_command = self.native_command.trim().to_string();
        if self.native_command.is_empty() {
            self.native_command = defaults.native_command;
        }
        if self.data_root.as_os_str().is_empty() {
            self.data_root = defaults.data_root;
        }
        if self.tick_ms == 0 {
            self.tick_ms = defaults.tick_ms;
        }
        if self.poll_interval_secs == 0 {
            self.poll_interval_secs = defaults.poll_interval_secs;
        }
        if self.ssh.port == 0 {
            self.ssh.port = defaults.ssh.port;
        }
        if self.ssh.connect_timeout_secs == 0 {
            self.ssh.connect_timeout_secs = defaults.ssh.connect_timeout_secs;
        }
        if self.ssh.keepalive_interval_secs == 0 {
            self.ssh.keepalive_interval_secs = defaults.ssh.keepalive_interval_secs;
        }
    }
}

fn xdg_config_home() -> anyhow::Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME") {
        let dir = PathBuf::from(dir);
        if dir.as_os_str().is_empty() {
            anyhow::bail!("XDG_CONFIG_HOME is set but empty");
        }
        return Ok(dir);
    }

    let home = std::env::var_os("HOME").ok_or_else(|| anyhow::anyhow!("HOME is not set"))?;
    let home = PathBuf::from(home);
    if home.as_os_str().is_empty() {
        anyhow::bail!("HOME is set but empty");
    }
    Ok(home.join(".config"))
}

fn xdg_state_home() -> anyhow::Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_STATE_HOME") {
        let dir = PathBuf::from(dir);
        if dir.as_os_str().is_empty() {
            anyhow::bail!("XDG_STATE_HOME is set but empty");
        }
        return Ok(dir);
    }

    let home = std::env::var_os("HOME").ok_or_else(|| anyhow::anyhow!("HOME is not set"))?;
    let home = PathBuf::from(home);
    if home.as_os_str().is_empty() {
        anyhow::bail!("HOME is set but empty");
    }
    Ok(home.join(".local").join("state"))
}

pub fn config_path() -> anyhow::Result<PathBuf> {
    Ok(xdg_config_home()?.join("simfleet").join("config.json"))
}

/// Default location of the JSON catalog.
pub fn catalog_path() -> anyhow::Result<PathBuf> {
    Ok(xdg_state_home()?.join("simfleet").join("catalog.json"))
}

/// Loads the config at `path`; a missing file yields the defaults.
pub fn load_config_from(path: &Path) -> anyhow::Result<FleetConfig> {
    if !path.exists() {
        return Ok(FleetConfig::default());
    }
    let raw = std::fs::read_to_string(path)?;
    let mut cfg: FleetConfig = serde_json::from_str(&raw)?;
    cfg.normalize();
    Ok(cfg)
}

pub fn load_config() -> anyhow::Result<FleetConfig> {
    load_config_from(&config_path()?)
}

pub fn save_config_to(path: &Path, cfg: &FleetConfig) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid config path: {}", path.display()))?;
    std::fs::create_dir_all(dir)?;

    let mut cfg = cfg.clone();
    cfg.normalize();

    let json = serde_json::to_string_pretty(&cfg)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}
