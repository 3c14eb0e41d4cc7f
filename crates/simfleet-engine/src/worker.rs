use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use simfleet_core::layout::{job_dir, model_dir, model_file, remote_join};
use simfleet_core::{InstanceId, ResourceKey, Server, ServerId};
use tokio::sync::{mpsc, watch};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::api::{EngineConfig, InstanceOutcome, InstanceSummary, WorkerStage};
use crate::archive::{ArchiveReplicator, ReplicationReport};
use crate::catalog::{Catalog, TransitionError, WorkContext};
use crate::links::LinkPool;
use crate::protocol::{PollStatus, launch_plan, launch_script, parse_pid, parse_poll, poll_script};
use crate::queue::DispatchQueues;
use crate::remote::{RemoteChannel, RemoteError};
use crate::template::{TemplateParams, draw_seed, load_and_render};

pub(crate) enum WorkerInternalEvent {
    StageChanged {
        resource: ResourceKey,
        stage: WorkerStage,
    },
    Claimed {
        resource: ResourceKey,
        instance: InstanceSummary,
    },
    Launched {
        resource: ResourceKey,
        instance_id: InstanceId,
        pid: u32,
    },
    Finished {
        outcome: InstanceOutcome,
    },
    Warning {
        message: String,
    },
}

/// State every worker shares with the engine.
pub(crate) struct WorkerShared {
    pub(crate) cfg: EngineConfig,
    pub(crate) catalog: Arc<Catalog>,
    pub(crate) queues: Arc<DispatchQueues>,
    pub(crate) servers: Arc<LinkPool>,
    pub(crate) replicator: Arc<ArchiveReplicator>,
    pub(crate) internal_tx: mpsc::UnboundedSender<WorkerInternalEvent>,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Provisioning { not_before: Instant },
    Awaiting { pid: u32, next_poll_at: Instant },
}

struct Claim {
    work: WorkContext,
    summary: InstanceSummary,
    job_dir: String,
    phase: Phase,
    claimed_at: Instant,
}

enum ProvisionError {
    /// Channel lost; provisioning is retried after reconnecting.
    Transport(RemoteError),
    Failed(String),
}

impl From<RemoteError> for ProvisionError {
    fn from(err: RemoteError) -> Self {
        if err.is_transport() {
            ProvisionError::Transport(err)
        } else {
            ProvisionError::Failed(err.to_string())
        }
    }
}

/// Runs the control loop of one resource until `stop` flips to true.
pub(crate) async fn run_worker(
    key: ResourceKey,
    address: String,
    shared: Arc<WorkerShared>,
    mut stop: watch::Receiver<bool>,
) {
    let span = info_span!(
        "worker",
        server = %address,
        server_id = key.server_id,
        device = key.device_id
    );
    async move {
        let mut worker = ResourceWorker::new(key, shared);
        let mut ticker = tokio::time::interval(worker.shared.cfg.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                res = stop.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
            }
            if *stop.borrow() {
                break;
            }
            worker.tick().await;
        }

        if let Some(claim) = &worker.claim {
            info!(
                instance = claim.summary.instance_id,
                pid = ?claim.summary.pid,
                "stopping with an instance in flight"
            );
        }
    }
    .instrument(span)
    .await
}

struct ResourceWorker {
    key: ResourceKey,
    shared: Arc<WorkerShared>,
    stage: WorkerStage,
    link: Option<Arc<dyn RemoteChannel>>,
    claim: Option<Claim>,
    connect_failures: u32,
}

impl ResourceWorker {
    fn new(key: ResourceKey, shared: Arc<WorkerShared>) -> Self {
        Self {
            key,
            shared,
            stage: WorkerStage::Disconnected,
            link: None,
            claim: None,
            connect_failures: 0,
        }
    }

    fn send(&self, event: WorkerInternalEvent) {
        let _ = self.shared.internal_tx.send(event);
    }

    fn report_warning(&self, message: String) {
        warn!("{message}");
        self.send(WorkerInternalEvent::Warning {
            message: format!("{}: {message}", self.key),
        });
    }

    fn set_stage(&mut self, stage: WorkerStage) {
        if self.stage == stage {
            return;
        }
        debug!(from = ?self.stage, to = ?stage, "stage");
        self.stage = stage;
        self.send(WorkerInternalEvent::StageChanged {
            resource: self.key,
            stage,
        });
    }

    async fn tick(&mut self) {
        let server = self
            .shared
            .catalog
            .server(self.key.server_id)
            .await
            .filter(|s| s.enabled);
        let Some(server) = server else {
            if self.link.take().is_some() {
                info!("server disabled; dropping connection");
                self.shared.servers.disconnect(self.key.server_id).await;
            }
            self.set_stage(WorkerStage::Disconnected);
            return;
        };

        let Some(link) = self.ensure_link(&server).await else {
            self.set_stage(WorkerStage::Disconnected);
            return;
        };

        if self.claim.is_none() {
            match self.try_claim(&server).await {
                Some(claim) => self.claim = Some(claim),
                None => {
                    self.set_stage(WorkerStage::Idle);
                    return;
                }
            }
        }

        self.advance(&server, &link).await;
    }

    async fn ensure_link(&mut self, server: &Server) -> Option<Arc<dyn RemoteChannel>> {
        if let Some(link) = self.link.take() {
            if link.is_alive() {
                self.link = Some(link.clone());
                return Some(link);
            }
            warn!("connection lost");
            self.shared.servers.invalidate(server.id, &link).await;
        }

        match self.shared.servers.connect(server.id, &server.endpoint()).await {
            Ok(link) => {
                if self.connect_failures > 0 {
                    info!(attempts = self.connect_failures + 1, "reconnected");
                } else {
                    debug!("connected");
                }
                self.connect_failures = 0;
                self.link = Some(link.clone());
                Some(link)
            }
            Err(err) => {
                self.connect_failures += 1;
                if self.connect_failures == 1 {
                    self.report_warning(format!("cannot connect to {}: {err}", server.address));
                } else {
                    debug!(attempts = self.connect_failures, error = %err, "still unreachable");
                }
                None
            }
        }
    }

    async fn drop_link(&mut self, server_id: ServerId, link: &Arc<dyn RemoteChannel>) {
        self.link = None;
        self.shared.servers.invalidate(server_id, link).await;
        self.set_stage(WorkerStage::Disconnected);
    }

    async fn try_claim(&mut self, server: &Server) -> Option<Claim> {
        loop {
            let id = self.shared.queues.pull(self.key)?;
            let work = match self.shared.catalog.work_context(id).await {
                Ok(work) => work,
                Err(err) => {
                    debug!(instance = id, error = %err, "dropping queued instance");
                    continue;
                }
            };
            if work.instance.completed {
                debug!(instance = id, "dropping queued instance; already completed");
                continue;
            }
            return Some(self.begin(server, work).await);
        }
    }

    async fn begin(&mut self, server: &Server, work: WorkContext) -> Claim {
        self.set_stage(WorkerStage::Claiming);
        let id = work.instance.id;

        if let Err(err) = self.shared.catalog.set_in_use(self.key, true).await {
            warn!(error = %err, "cannot mark resource in use");
        }
        if work.instance.resource != Some(self.key) {
            if let Err(err) = self.shared.catalog.bind(id, self.key).await {
                self.report_warning(format!("instance {id}: cannot record binding: {err}"));
            }
        }

        let summary = InstanceSummary {
            instance_id: id,
            job_id: work.job.id,
            job_name: work.job.name.clone(),
            sequence: work.sequence,
            pid: work.instance.pid,
        };
        info!(
            instance = id,
            job = %work.job.name,
            sequence = work.sequence,
            resumed = work.instance.pid.is_some(),
            "claimed instance"
        );
        self.send(WorkerInternalEvent::Claimed {
            resource: self.key,
            instance: summary.clone(),
        });

        let now = Instant::now();
        let phase = match work.instance.pid {
            Some(pid) => Phase::Awaiting {
                pid,
                next_poll_at: now,
            },
            None => Phase::Provisioning {
                not_before: now + self.jitter(),
            },
        };
        Claim {
            job_dir: job_dir(&server.working_directory, &work.job.name, work.sequence),
            work,
            summary,
            phase,
            claimed_at: now,
        }
    }

    fn jitter(&self) -> Duration {
        let max = self.shared.cfg.claim_jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }

    async fn advance(&mut self, server: &Server, link: &Arc<dyn RemoteChannel>) {
        let Some(phase) = self.claim.as_ref().map(|c| c.phase) else {
            return;
        };
        match phase {
            Phase::Provisioning { not_before } => {
                if Instant::now() < not_before {
                    return;
                }
                self.provision_step(server, link).await;
            }
            Phase::Awaiting { pid, next_poll_at } => {
                self.set_stage(WorkerStage::Awaiting);
                if Instant::now() < next_poll_at {
                    return;
                }
                self.poll_step(server.id, link, pid).await;
            }
        }
    }

    async fn provision_step(&mut self, server: &Server, link: &Arc<dyn RemoteChannel>) {
        self.set_stage(WorkerStage::Provisioning);
        let Some(claim) = self.claim.as_ref() else {
            return;
        };
        let id = claim.work.instance.id;
        let result = provision(
            &self.shared.cfg,
            server,
            link.as_ref(),
            &claim.work,
            &claim.job_dir,
            self.key.device_id,
        )
        .await;

        match result {
            Ok(pid) => {
                info!(instance = id, pid, "launched");
                if let Err(err) = self.shared.catalog.assign_pid(id, pid).await {
                    self.report_warning(format!("instance {id}: cannot record pid {pid}: {err}"));
                }
                self.send(WorkerInternalEvent::Launched {
                    resource: self.key,
                    instance_id: id,
                    pid,
                });
                let next_poll_at = Instant::now() + self.shared.cfg.poll_interval;
                if let Some(claim) = self.claim.as_mut() {
                    claim.summary.pid = Some(pid);
                    claim.phase = Phase::Awaiting { pid, next_poll_at };
                }
                self.set_stage(WorkerStage::Awaiting);
            }
            Err(ProvisionError::Transport(err)) => {
                warn!(instance = id, error = %err, "connection lost while provisioning; will retry");
                self.drop_link(server.id, link).await;
            }
            Err(ProvisionError::Failed(message)) => {
                error!(instance = id, error = %message, "provisioning failed");
                if let Err(err) = self.shared.catalog.record_failure(id, &message).await {
                    warn!(instance = id, error = %err, "cannot record failure");
                }
                self.release(false, None, Some(message), ReplicationReport::default())
                    .await;
            }
        }
    }

    fn schedule_poll(&mut self) {
        let next = Instant::now() + self.shared.cfg.poll_interval;
        if let Some(Claim {
            phase: Phase::Awaiting { next_poll_at, .. },
            ..
        }) = self.claim.as_mut()
        {
            *next_poll_at = next;
        }
    }

    async fn poll_step(&mut self, server_id: ServerId, link: &Arc<dyn RemoteChannel>, pid: u32) {
        let Some(claim) = self.claim.as_ref() else {
            return;
        };
        let id = claim.work.instance.id;
        let script = poll_script(&claim.job_dir, pid);

        let status = match link.exec(&script).await {
            Ok(out) if out.success => parse_poll(&out.output),
            Ok(out) => {
                warn!(instance = id, output = out.output.trim(), "completion check failed; retrying");
                self.schedule_poll();
                return;
            }
            Err(err) if err.is_transport() => {
                warn!(instance = id, error = %err, "connection lost while waiting");
                self.drop_link(server_id, link).await;
                return;
            }
            Err(err) => {
                warn!(instance = id, error = %err, "completion check failed; retrying");
                self.schedule_poll();
                return;
            }
        };

        match status {
            PollStatus::Running | PollStatus::NotFinished => self.schedule_poll(),
            PollStatus::Unrecognized(line) => {
                warn!(instance = id, output = %line, "unexpected completion check output");
                self.schedule_poll();
            }
            PollStatus::Exited(code) => self.finish(link, code).await,
        }
    }

    async fn finish(&mut self, link: &Arc<dyn RemoteChannel>, exit_code: i32) {
        let Some(claim) = self.claim.as_ref() else {
            return;
        };
        let id = claim.work.instance.id;
        let job_dir = claim.job_dir.clone();
        let job_name = claim.work.job.name.clone();
        let sequence = claim.work.sequence;
        info!(instance = id, exit_code, "remote process ended");

        self.set_stage(WorkerStage::Replicating);
        let report = self
            .shared
            .replicator
            .replicate(link.as_ref(), &job_dir, &job_name, sequence)
            .await;

        let completed = match self.shared.catalog.complete(id, Some(exit_code)).await {
            Ok(()) => true,
            Err(TransitionError::Store(err)) => {
                self.report_warning(format!("instance {id}: cannot persist completion: {err:#}"));
                true
            }
            Err(TransitionError::Rejected(err)) => {
                self.report_warning(format!("instance {id}: cannot mark completed: {err}"));
                false
            }
        };
        self.release(completed, Some(exit_code), None, report).await;
    }

    async fn release(
        &mut self,
        completed: bool,
        exit_code: Option<i32>,
        error: Option<String>,
        report: ReplicationReport,
    ) {
        let Some(claim) = self.claim.take() else {
            return;
        };
        if let Err(err) = self.shared.catalog.set_in_use(self.key, false).await {
            warn!(error = %err, "cannot release resource");
        }

        let outcome = InstanceOutcome {
            resource: self.key,
            instance: claim.summary,
            completed,
            exit_code,
            error,
            archives_ok: report.succeeded,
            archives_failed: report
                .failed
                .into_iter()
                .map(|(id, message)| format!("archive {id}: {message}"))
                .collect(),
            total_ms: claim.claimed_at.elapsed().as_millis() as u64,
            finished_at: Utc::now().timestamp(),
        };
        self.send(WorkerInternalEvent::Finished { outcome });
        self.set_stage(WorkerStage::Idle);
    }
}

/// Uploads inputs, renders the template and launches the remote process.
async fn provision(
    cfg: &EngineConfig,
    server: &Server,
    link: &dyn RemoteChannel,
    work: &WorkContext,
    dir: &str,
    device_id: u32,
) -> Result<u32, ProvisionError> {
    let workdir = &server.working_directory;
    let model = &work.model;

    link.mkdir_all(&model_dir(workdir, &model.name)).await?;
    link.mkdir_all(dir).await?;

    for file in &model.files {
        let remote = model_file(workdir, &model.name, file);
        if link.exists(&remote).await? {
            continue;
        }
        let local = model.local_path(&cfg.data_root, file);
        let bytes = tokio::fs::read(&local).await.map_err(|err| {
            ProvisionError::Failed(format!("read model file {}: {err}", local.display()))
        })?;
        debug!(file = %remote, bytes = bytes.len(), "uploading model file");
        link.upload(&remote, &bytes).await?;
    }

    let params = TemplateParams::for_instance(model, device_id, draw_seed());
    let rendered = load_and_render(&work.template, &params)
        .await
        .map_err(|err| ProvisionError::Failed(err.to_string()))?;
    let file_name = work.template.rendered_file_name();
    link.upload(&remote_join([dir, file_name.as_str()]), rendered.as_bytes())
        .await?;

    let plan = launch_plan(&work.template.kind(), &file_name, &cfg.native_command);
    let out = link.exec(&launch_script(dir, &plan)).await?;
    if !out.success {
        return Err(ProvisionError::Failed(format!(
            "launch failed: {}",
            out.output.trim()
        )));
    }
    parse_pid(&out.output).ok_or_else(|| {
        ProvisionError::Failed(format!("launch printed no pid: {}", out.output.trim()))
    })
}
