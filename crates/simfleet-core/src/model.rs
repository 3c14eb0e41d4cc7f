use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Catalog identifier of a compute server.
pub type ServerId = u64;
/// Catalog identifier of a model.
pub type ModelId = u64;
/// Catalog identifier of a template.
pub type TemplateId = u64;
/// Catalog identifier of a job.
pub type JobId = u64;
/// Catalog identifier of a job instance.
pub type InstanceId = u64;
/// Catalog identifier of an archive target.
pub type ArchiveId = u64;

/// Identity of one execution slot: its server plus the device index on that server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub server_id: ServerId,
    pub device_id: u32,
}

impl ResourceKey {
    pub fn new(server_id: ServerId, device_id: u32) -> Self {
        Self {
            server_id,
            device_id,
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.server_id, self.device_id)
    }
}

/// Login material for a remote endpoint.
///
/// A password is handed to the transport as-is; an identity file is passed as a
/// private key. When both are absent the transport relies on the user's agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<PathBuf>,
}

/// Network address plus credentials; what a transport needs to open a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub address: String,
    pub credentials: Credentials,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub id: ServerId,
    pub address: String,
    pub credentials: Credentials,
    #[serde(default)]
    pub working_directory: String,
    #[serde(default)]
    pub enabled: bool,
}

impl Server {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            address: self.address.clone(),
            credentials: self.credentials.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub server_id: ServerId,
    pub device_id: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub uuid: String,
    /// True exactly while the resource's worker holds an instance.
    #[serde(default)]
    pub in_use: bool,
}

impl Resource {
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.server_id, self.device_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    pub id: ModelId,
    pub name: String,
    #[serde(default)]
    pub files: Vec<String>,
}

impl Model {
    /// Where `file` lives on the local disk, below the data root.
    pub fn local_path(&self, data_root: &Path, file: &str) -> PathBuf {
        data_root.join(&self.name).join(file)
    }
}

/// How a template's rendered output is executed on the compute node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TemplateKind {
    /// A configuration file consumed by the native simulation binary.
    NativeConfig,
    /// A self-contained script, executed directly (its shebang picks the interpreter).
    Script { extension: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub id: TemplateId,
    pub name: String,
    pub file: PathBuf,
}

impl Template {
    pub fn kind(&self) -> TemplateKind {
        let extension = self
            .file
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if extension == "conf" {
            TemplateKind::NativeConfig
        } else {
            TemplateKind::Script { extension }
        }
    }

    /// File name the rendered template is uploaded as, inside the instance directory.
    pub fn rendered_file_name(&self) -> String {
        match self.kind() {
            TemplateKind::NativeConfig => "sim.conf".to_string(),
            TemplateKind::Script { extension } if extension.is_empty() => "sim".to_string(),
            TemplateKind::Script { extension } => format!("sim.{extension}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub model_id: ModelId,
    pub template_id: TemplateId,
    /// Instances in creation order; fixed once the job exists.
    #[serde(default)]
    pub instances: Vec<InstanceId>,
}

impl Job {
    /// Position of `instance` within this job, used to name its remote directory.
    pub fn sequence_of(&self, instance: InstanceId) -> Option<usize> {
        self.instances.iter().position(|id| *id == instance)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInstance {
    pub id: InstanceId,
    pub job_id: JobId,
    /// Remote process id, set once the instance has been launched.
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub completed: bool,
    /// Resource this instance is bound to, if it was ever claimed.
    #[serde(default)]
    pub resource: Option<ResourceKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Last provisioning failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl JobInstance {
    pub fn new(id: InstanceId, job_id: JobId) -> Self {
        Self {
            id,
            job_id,
            pid: None,
            completed: false,
            resource: None,
            exit_code: None,
            failure: None,
        }
    }

    pub fn is_launched(&self) -> bool {
        self.pid.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Archive {
    pub id: ArchiveId,
    pub address: String,
    pub credentials: Credentials,
    #[serde(default)]
    pub working_directory: String,
    #[serde(default)]
    pub enabled: bool,
    /// Used space in KiB, as last reported by the archive.
    #[serde(default)]
    pub space_used: u64,
    /// Total space in KiB, as last reported by the archive.
    #[serde(default)]
    pub space_total: u64,
}

impl Archive {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            address: self.address.clone(),
            credentials: self.credentials.clone(),
        }
    }

    pub fn usage_percent(&self) -> f64 {
        if self.space_total == 0 {
            return 0.0;
        }
        self.space_used as f64 / self.space_total as f64 * 100.0
    }
}
