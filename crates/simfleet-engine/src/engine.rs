use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use simfleet_core::{CatalogSnapshot, Job, JobId, ModelId, ResourceKey, ServerId, TemplateId};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::api::{
    EngineConfig, EngineEvent, EngineHandle, InstanceOutcome, InstanceSummary, ResourceSnapshot,
    StatusSnapshot, WorkerStage,
};
use crate::archive::ArchiveReplicator;
use crate::catalog::Catalog;
use crate::links::LinkPool;
use crate::queue::DispatchQueues;
use crate::remote::Connector;
use crate::store::CatalogStore;
use crate::worker::{WorkerInternalEvent, WorkerShared, run_worker};

pub(crate) struct EngineInner {
    pub(crate) event_tx: broadcast::Sender<EngineEvent>,
    pub(crate) snapshot_rx: watch::Receiver<StatusSnapshot>,
    pub(crate) catalog: Arc<Catalog>,
    queues: Arc<DispatchQueues>,
    stop_requested: AtomicBool,
    notify: tokio::sync::Notify,
}

impl EngineInner {
    pub(crate) fn request_stop(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            let _ = self.event_tx.send(EngineEvent::StopRequested);
            self.notify.notify_one();
        }
    }

    fn should_stop(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub(crate) async fn create_job(
        &self,
        name: &str,
        model_id: ModelId,
        template_id: TemplateId,
        count: usize,
    ) -> anyhow::Result<Job> {
        let (job, instances) = self
            .catalog
            .create_job(name, model_id, template_id, count)
            .await
            .context("create job")?;
        for instance in &instances {
            self.queues.push_global(instance.id);
        }
        info!(job = job.id, name = %job.name, instances = instances.len(), "job created");
        Ok(job)
    }

    pub(crate) async fn remove_job(&self, id: JobId) -> anyhow::Result<()> {
        let job = self
            .catalog
            .remove_job(id)
            .await
            .with_context(|| format!("remove job {id}"))?;
        self.queues.forget(&job.instances);
        info!(job = id, name = %job.name, "job removed");
        Ok(())
    }

    pub(crate) async fn set_server_enabled(&self, id: ServerId, enabled: bool) -> anyhow::Result<()> {
        self.catalog
            .set_server_enabled(id, enabled)
            .await
            .with_context(|| format!("update server {id}"))?;
        info!(server_id = id, enabled, "server toggled");
        Ok(())
    }
}

#[derive(Debug)]
struct ResourceRuntime {
    key: ResourceKey,
    server: String,
    stage: WorkerStage,
    instance: Option<InstanceSummary>,
}

struct EngineRuntime {
    cfg: EngineConfig,

    resources: Vec<ResourceRuntime>,
    internal_rx: mpsc::UnboundedReceiver<WorkerInternalEvent>,
    internal_open: bool,
    worker_join: JoinSet<()>,
    stop_tx: watch::Sender<bool>,

    queues: Arc<DispatchQueues>,
    servers: Arc<LinkPool>,
    archives: Arc<LinkPool>,

    recent_outcomes: VecDeque<InstanceOutcome>,
    snapshot_tx: watch::Sender<StatusSnapshot>,
    inner: Arc<EngineInner>,
}

impl EngineRuntime {
    fn build_snapshot(&self) -> StatusSnapshot {
        let resources = self
            .resources
            .iter()
            .map(|r| ResourceSnapshot {
                resource: r.key,
                server: r.server.clone(),
                stage: r.stage,
                instance: r.instance.clone(),
                pinned_queued: self.queues.private_len(r.key),
            })
            .collect();

        StatusSnapshot {
            stop_requested: self.inner.should_stop(),
            resources,
            queued: self.queues.global_len(),
            recent_outcomes: self.recent_outcomes.iter().cloned().collect(),
        }
    }

    fn push_snapshot(&self) {
        let snap = self.build_snapshot();
        let _ = self.snapshot_tx.send(snap);
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.inner.event_tx.send(event);
    }

    fn resource_mut(&mut self, key: ResourceKey) -> Option<&mut ResourceRuntime> {
        self.resources.iter_mut().find(|r| r.key == key)
    }

    fn handle_internal_event(&mut self, ev: WorkerInternalEvent) {
        match ev {
            WorkerInternalEvent::StageChanged { resource, stage } => {
                if let Some(r) = self.resource_mut(resource) {
                    r.stage = stage;
                }
                self.emit(EngineEvent::WorkerStage { resource, stage });
            }
            WorkerInternalEvent::Claimed { resource, instance } => {
                if let Some(r) = self.resource_mut(resource) {
                    r.instance = Some(instance.clone());
                }
                self.emit(EngineEvent::InstanceClaimed { resource, instance });
            }
            WorkerInternalEvent::Launched {
                resource,
                instance_id,
                pid,
            } => {
                if let Some(summary) = self
                    .resource_mut(resource)
                    .and_then(|r| r.instance.as_mut())
                {
                    summary.pid = Some(pid);
                }
                self.emit(EngineEvent::InstanceLaunched {
                    resource,
                    instance_id,
                    pid,
                });
            }
            WorkerInternalEvent::Finished { outcome } => {
                if let Some(r) = self.resource_mut(outcome.resource) {
                    r.instance = None;
                }
                self.recent_outcomes.push_back(outcome.clone());
                while self.recent_outcomes.len() > self.cfg.recent_outcomes_max.max(1) {
                    self.recent_outcomes.pop_front();
                }
                self.emit(EngineEvent::InstanceFinished { outcome });
            }
            WorkerInternalEvent::Warning { message } => {
                self.emit(EngineEvent::Warning { message });
            }
        }
        self.push_snapshot();
    }

    async fn shutdown_workers(&mut self) {
        let _ = self.stop_tx.send(true);
        while let Some(res) = self.worker_join.join_next().await {
            if let Err(err) = res {
                warn!(error = %err, "worker task join error");
            }
        }
        while let Ok(ev) = self.internal_rx.try_recv() {
            self.handle_internal_event(ev);
        }
        self.servers.close_all().await;
        self.archives.close_all().await;
    }

    async fn run(mut self) -> anyhow::Result<()> {
        self.emit(EngineEvent::Started);
        self.push_snapshot();

        let mut result: anyhow::Result<()> = Ok(());

        while !self.inner.should_stop() {
            let internal_open = self.internal_open;
            let workers_running = !self.worker_join.is_empty();

            let loop_result: anyhow::Result<()> = tokio::select! {
                _ = self.inner.notify.notified() => Ok(()),
                ev_opt = self.internal_rx.recv(), if internal_open => {
                    match ev_opt {
                        Some(ev) => self.handle_internal_event(ev),
                        None => self.internal_open = false,
                    }
                    Ok(())
                }
                res = self.worker_join.join_next(), if workers_running => {
                    match res {
                        Some(Ok(())) => Err(anyhow::anyhow!("worker task exited unexpectedly")),
                        Some(Err(err)) => Err(anyhow::anyhow!("worker task join error: {err:#}")),
                        None => Ok(()),
                    }
                }
            };

            if let Err(err) = loop_result {
                result = Err(err);
                break;
            }
        }

        if let Err(err) = &result {
            error!(error = %err, "engine error");
            self.emit(EngineEvent::Error {
                message: format!("engine error: {err:#}"),
            });
        }

        info!("stopping workers");
        self.shutdown_workers().await;
        self.push_snapshot();
        self.emit(EngineEvent::Stopped);
        result
    }
}

fn normalize_config(cfg: &mut EngineConfig) {
    if cfg.tick == Duration::ZERO {
        cfg.tick = EngineConfig::DEFAULT_TICK;
    }
    if cfg.poll_interval == Duration::ZERO {
        cfg.poll_interval = EngineConfig::DEFAULT_POLL_INTERVAL;
    }
    if cfg.recent_outcomes_max == 0 {
        cfg.recent_outcomes_max = EngineConfig::DEFAULT_RECENT_OUTCOMES_MAX;
    }
    cfg.native_command = cfg.native_command.trim().to_string();
    if cfg.native_command.is_empty() {
        cfg.native_command = EngineConfig::DEFAULT_NATIVE_COMMAND.to_string();
    }
}

/// Queues every incomplete instance: bound ones to their resource, the rest to the
/// shared queue. Returns the number queued.
fn queue_pending(catalog: &CatalogSnapshot, queues: &DispatchQueues) -> usize {
    let known: HashSet<ResourceKey> = catalog.resources.iter().map(|r| r.key()).collect();
    let mut queued = 0;
    for instance in catalog.pending_instances() {
        match instance.resource {
            Some(key) if known.contains(&key) => queues.push_private(key, instance.id),
            Some(key) if instance.is_launched() => {
                warn!(
                    instance = instance.id,
                    resource = %key,
                    pid = ?instance.pid,
                    "instance was launched on a resource that no longer exists; not resuming"
                );
                continue;
            }
            _ => queues.push_global(instance.id),
        }
        queued += 1;
    }
    queued
}

pub(crate) async fn start_engine(
    mut cfg: EngineConfig,
    store: Arc<dyn CatalogStore>,
    connector: Arc<dyn Connector>,
) -> anyhow::Result<EngineHandle> {
    normalize_config(&mut cfg);

    let mut snapshot = store.load().await.context("load catalog")?;
    snapshot.validate().context("catalog is inconsistent")?;
    for resource in &mut snapshot.resources {
        resource.in_use = false;
    }
    snapshot
        .resources
        .sort_by_key(|r| (r.server_id, r.device_id));

    let queues = Arc::new(DispatchQueues::new());
    let queued = queue_pending(&snapshot, &queues);
    if queued > 0 {
        info!(instances = queued, "queued incomplete instances from catalog");
    }

    let catalog = Arc::new(Catalog::new(snapshot.clone(), store));
    let servers = Arc::new(LinkPool::new(connector.clone()));
    let archives = Arc::new(LinkPool::new(connector));
    let replicator = Arc::new(ArchiveReplicator::new(catalog.clone(), archives.clone()));

    let (event_tx, _) = broadcast::channel::<EngineEvent>(1024);
    let (internal_tx, internal_rx) = mpsc::unbounded_channel::<WorkerInternalEvent>();
    let (stop_tx, stop_rx) = watch::channel(false);

    let shared = Arc::new(WorkerShared {
        cfg: cfg.clone(),
        catalog: catalog.clone(),
        queues: queues.clone(),
        servers: servers.clone(),
        replicator,
        internal_tx,
    });

    let mut resources = Vec::with_capacity(snapshot.resources.len());
    let mut worker_join = JoinSet::new();
    for resource in &snapshot.resources {
        let key = resource.key();
        let address = snapshot
            .server(resource.server_id)
            .map(|s| s.address.clone())
            .unwrap_or_default();
        resources.push(ResourceRuntime {
            key,
            server: address.clone(),
            stage: WorkerStage::Disconnected,
            instance: None,
        });
        worker_join.spawn(run_worker(key, address, shared.clone(), stop_rx.clone()));
    }
    drop(shared);
    info!(resources = resources.len(), "engine started");

    let (snapshot_tx, snapshot_rx) = watch::channel(StatusSnapshot {
        stop_requested: false,
        resources: Vec::new(),
        queued: 0,
        recent_outcomes: Vec::new(),
    });

    let inner = Arc::new(EngineInner {
        event_tx,
        snapshot_rx,
        catalog,
        queues: queues.clone(),
        stop_requested: AtomicBool::new(false),
        notify: tokio::sync::Notify::new(),
    });

    let runtime = EngineRuntime {
        cfg,
        resources,
        internal_rx,
        internal_open: true,
        worker_join,
        stop_tx,
        queues,
        servers,
        archives,
        recent_outcomes: VecDeque::new(),
        snapshot_tx,
        inner: inner.clone(),
    };
    runtime.push_snapshot();

    let join = tokio::spawn(runtime.run());
    Ok(EngineHandle { inner, join })
}
