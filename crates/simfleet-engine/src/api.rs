//! Public API types for the in-process scheduling engine.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use simfleet_core::{
    ArchiveId, CatalogSnapshot, FleetConfig, InstanceId, Job, JobId, ModelId, ResourceKey,
    ServerId, TemplateId,
};

use crate::remote::Connector;
use crate::store::CatalogStore;

/// Configuration for the in-process engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Local directory holding `<model name>/<file>` inputs.
    pub data_root: PathBuf,

    /// Executable launched for native configuration templates.
    pub native_command: String,

    /// Pacing of every resource worker loop.
    pub tick: Duration,

    /// Interval between completion checks of a running remote process.
    pub poll_interval: Duration,

    /// Upper bound of a random delay between claiming an instance and provisioning it.
    ///
    /// Zero disables the delay.
    pub claim_jitter: Duration,

    /// Maximum number of finished instances retained in the snapshot.
    pub recent_outcomes_max: usize,
}

impl EngineConfig {
    /// Default worker tick.
    pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

    /// Default completion polling interval.
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

    /// Default size of the recent-outcomes ring buffer.
    pub const DEFAULT_RECENT_OUTCOMES_MAX: usize = 100;

    /// Default executable for native configuration templates.
    pub const DEFAULT_NATIVE_COMMAND: &'static str = "ProtoMol";

    /// Engine settings from the on-disk fleet configuration.
    pub fn from_fleet(cfg: &FleetConfig) -> Self {
        Self {
            data_root: cfg.data_root.clone(),
            native_command: cfg.native_command.clone(),
            tick: Duration::from_millis(cfg.tick_ms),
            poll_interval: Duration::from_secs(cfg.poll_interval_secs),
            claim_jitter: Duration::from_secs(cfg.claim_jitter_secs),
            recent_outcomes_max: Self::DEFAULT_RECENT_OUTCOMES_MAX,
        }
    }
}

/// Stage of a resource worker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkerStage {
    /// Server disabled or unreachable.
    Disconnected,
    /// Connected, nothing queued for this resource.
    Idle,
    /// An instance was taken off a queue and is being bound to the resource.
    Claiming,
    /// Uploading inputs and launching the remote process.
    Provisioning,
    /// The remote process is running.
    Awaiting,
    /// Copying results to the archives.
    Replicating,
}

/// A lightweight summary of a claimed job instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceSummary {
    /// Catalog instance identifier.
    pub instance_id: InstanceId,
    /// Parent job identifier.
    pub job_id: JobId,
    /// Parent job name.
    pub job_name: String,
    /// Position within the job; names the remote instance directory.
    pub sequence: usize,
    /// Remote process id, once launched.
    pub pid: Option<u32>,
}

/// Result of one claim of an instance (completed or failed).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceOutcome {
    /// Resource that held the instance.
    pub resource: ResourceKey,
    /// Instance metadata.
    pub instance: InstanceSummary,
    /// Whether the instance was marked completed.
    pub completed: bool,
    /// Exit code of the remote process, when it ran to the end.
    pub exit_code: Option<i32>,
    /// Human-readable failure message, for provisioning errors.
    pub error: Option<String>,
    /// Archives that received the results.
    pub archives_ok: Vec<ArchiveId>,
    /// Archives that could not be updated, with the reason.
    pub archives_failed: Vec<String>,
    /// Time from claim to release (milliseconds).
    pub total_ms: u64,
    /// Unix timestamp (seconds) of the release.
    pub finished_at: i64,
}

/// Snapshot of a single resource worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceSnapshot {
    /// Resource identity.
    pub resource: ResourceKey,
    /// Address of the owning server.
    pub server: String,
    /// Current stage.
    pub stage: WorkerStage,
    /// Claimed instance, if any.
    pub instance: Option<InstanceSummary>,
    /// Instances waiting in this resource's own queue.
    pub pinned_queued: usize,
}

/// Engine event stream payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum EngineEvent {
    /// Engine started.
    Started,
    /// Engine is stopping (graceful shutdown requested).
    StopRequested,
    /// Worker stage transition.
    WorkerStage {
        /// Resource of the worker.
        resource: ResourceKey,
        /// New stage.
        stage: WorkerStage,
    },
    /// Worker claimed an instance.
    InstanceClaimed {
        /// Resource of the worker.
        resource: ResourceKey,
        /// Instance summary.
        instance: InstanceSummary,
    },
    /// The remote process of an instance was started.
    InstanceLaunched {
        /// Resource of the worker.
        resource: ResourceKey,
        /// Instance identifier.
        instance_id: InstanceId,
        /// Remote process id.
        pid: u32,
    },
    /// Worker released an instance (completed or failed).
    InstanceFinished {
        /// Instance outcome.
        outcome: InstanceOutcome,
    },
    /// A warning from the engine.
    Warning {
        /// Warning message.
        message: String,
    },
    /// A non-fatal error from the engine.
    Error {
        /// Error message.
        message: String,
    },
    /// Engine stopped (no more workers running).
    Stopped,
}

/// Current engine state snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusSnapshot {
    /// Whether the engine has been asked to stop.
    pub stop_requested: bool,
    /// Per-resource snapshots.
    pub resources: Vec<ResourceSnapshot>,
    /// Instances waiting in the shared queue.
    pub queued: usize,
    /// Recently finished instances (newest last).
    pub recent_outcomes: Vec<InstanceOutcome>,
}

/// Handle to a running in-process engine instance.
pub struct EngineHandle {
    pub(crate) inner: Arc<crate::engine::EngineInner>,
    pub(crate) join: tokio::task::JoinHandle<anyhow::Result<()>>,
}

/// Load the catalog from `store` and start one worker per resource.
pub async fn start_engine(
    config: EngineConfig,
    store: Arc<dyn CatalogStore>,
    connector: Arc<dyn Connector>,
) -> anyhow::Result<EngineHandle> {
    crate::engine::start_engine(config, store, connector).await
}

impl EngineHandle {
    /// Subscribe to the engine event stream.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Get the latest engine snapshot.
    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner.snapshot_rx.borrow().clone()
    }

    /// Copy of the engine's current catalog.
    pub async fn catalog_snapshot(&self) -> CatalogSnapshot {
        self.inner.catalog.snapshot().await
    }

    /// Request a graceful shutdown.
    ///
    /// Workers exit at their next tick. Remote processes keep running and are
    /// watched again after a restart.
    pub fn request_stop(&self) {
        self.inner.request_stop();
    }

    /// Create a job with `count` instances and queue all of them.
    pub async fn create_job(
        &self,
        name: &str,
        model_id: ModelId,
        template_id: TemplateId,
        count: usize,
    ) -> anyhow::Result<Job> {
        self.inner
            .create_job(name, model_id, template_id, count)
            .await
    }

    /// Remove a job and its instance rows. Running instances are not signalled.
    pub async fn remove_job(&self, job_id: JobId) -> anyhow::Result<()> {
        self.inner.remove_job(job_id).await
    }

    /// Enable or disable dispatching to a server's resources.
    pub async fn set_server_enabled(&self, server_id: ServerId, enabled: bool) -> anyhow::Result<()> {
        self.inner.set_server_enabled(server_id, enabled).await
    }

    /// `(completed, total)` instance counts of a job.
    pub async fn job_progress(&self, job_id: JobId) -> Option<(usize, usize)> {
        self.inner.catalog.job_progress(job_id).await
    }

    /// Wait for the engine to stop, returning the engine task result.
    pub async fn wait(self) -> anyhow::Result<()> {
        match self.join.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("engine task join error: {err}")),
        }
    }
}
