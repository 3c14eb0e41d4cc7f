use std::sync::Arc;

use simfleet_core::{
    Archive, ArchiveId, CatalogError, CatalogSnapshot, InstanceId, Job, JobId, JobInstance, Model,
    ModelId, ResourceKey, Server, ServerId, Template, TemplateId,
};
use tokio::sync::RwLock;

use crate::store::CatalogStore;

/// Everything a worker needs to provision and track one instance.
#[derive(Debug, Clone)]
pub(crate) struct WorkContext {
    pub(crate) instance: JobInstance,
    pub(crate) job: Job,
    pub(crate) sequence: usize,
    pub(crate) model: Model,
    pub(crate) template: Template,
}

/// Failure of a catalog transition.
#[derive(Debug, thiserror::Error)]
pub(crate) enum TransitionError {
    #[error(transparent)]
    Rejected(#[from] CatalogError),
    /// Applied in memory but not written to the store.
    #[error("catalog store write failed: {0:#}")]
    Store(anyhow::Error),
}

/// In-memory view of the catalog shared by the engine and its workers.
///
/// Reads never observe a half-applied transition. Durable transitions are checked
/// against the in-memory state first and then written through to the store.
pub(crate) struct Catalog {
    state: RwLock<CatalogSnapshot>,
    store: Arc<dyn CatalogStore>,
}

impl Catalog {
    pub(crate) fn new(snapshot: CatalogSnapshot, store: Arc<dyn CatalogStore>) -> Self {
        Self {
            state: RwLock::new(snapshot),
            store,
        }
    }

    pub(crate) async fn snapshot(&self) -> CatalogSnapshot {
        self.state.read().await.clone()
    }

    pub(crate) async fn server(&self, id: ServerId) -> Option<Server> {
        self.state.read().await.server(id).cloned()
    }

    pub(crate) async fn enabled_archives(&self) -> Vec<Archive> {
        self.state
            .read()
            .await
            .archives
            .iter()
            .filter(|a| a.enabled)
            .cloned()
            .collect()
    }

    pub(crate) async fn job_progress(&self, id: JobId) -> Option<(usize, usize)> {
        self.state.read().await.job_progress(id)
    }

    pub(crate) async fn work_context(&self, id: InstanceId) -> Result<WorkContext, CatalogError> {
        let state = self.state.read().await;
        let instance = state
            .instance(id)
            .ok_or(CatalogError::UnknownInstance(id))?
            .clone();
        let job = state
            .job(instance.job_id)
            .ok_or(CatalogError::UnknownJob(instance.job_id))?
            .clone();
        let sequence = job
            .sequence_of(id)
            .ok_or(CatalogError::UnknownInstance(id))?;
        let model = state
            .model(job.model_id)
            .ok_or(CatalogError::UnknownModel(job.model_id))?
            .clone();
        let template = state
            .template(job.template_id)
            .ok_or(CatalogError::UnknownTemplate(job.template_id))?
            .clone();
        Ok(WorkContext {
            instance,
            job,
            sequence,
            model,
            template,
        })
    }

    /// Volatile; only the resource's own worker calls this.
    pub(crate) async fn set_in_use(&self, key: ResourceKey, in_use: bool) -> Result<(), CatalogError> {
        self.state.write().await.set_in_use(key, in_use)
    }

    pub(crate) async fn bind(
        &self,
        instance: InstanceId,
        key: ResourceKey,
    ) -> Result<(), TransitionError> {
        self.state.write().await.bind_resource(instance, key)?;
        self.store
            .record_binding(instance, key)
            .await
            .map_err(TransitionError::Store)
    }

    pub(crate) async fn assign_pid(
        &self,
        instance: InstanceId,
        pid: u32,
    ) -> Result<(), TransitionError> {
        self.state.write().await.assign_pid(instance, pid)?;
        self.store
            .record_pid(instance, pid)
            .await
            .map_err(TransitionError::Store)
    }

    pub(crate) async fn complete(
        &self,
        instance: InstanceId,
        exit_code: Option<i32>,
    ) -> Result<(), TransitionError> {
        self.state.write().await.complete(instance, exit_code)?;
        self.store
            .record_completion(instance, exit_code)
            .await
            .map_err(TransitionError::Store)
    }

    pub(crate) async fn record_failure(
        &self,
        instance: InstanceId,
        message: &str,
    ) -> Result<(), TransitionError> {
        self.state.write().await.record_failure(instance, message)?;
        self.store
            .record_failure(instance, message)
            .await
            .map_err(TransitionError::Store)
    }

    pub(crate) async fn update_archive_space(
        &self,
        archive: ArchiveId,
        used: u64,
        total: u64,
    ) -> Result<(), TransitionError> {
        self.state
            .write()
            .await
            .update_archive_space(archive, used, total)?;
        self.store
            .record_archive_space(archive, used, total)
            .await
            .map_err(TransitionError::Store)
    }

    pub(crate) async fn set_server_enabled(
        &self,
        server: ServerId,
        enabled: bool,
    ) -> Result<(), TransitionError> {
        self.state.write().await.set_server_enabled(server, enabled)?;
        self.store
            .record_server_enabled(server, enabled)
            .await
            .map_err(TransitionError::Store)
    }

    /// Creates a job; nothing is kept in memory unless the store accepted it.
    pub(crate) async fn create_job(
        &self,
        name: &str,
        model_id: ModelId,
        template_id: TemplateId,
        count: usize,
    ) -> Result<(Job, Vec<JobInstance>), TransitionError> {
        let mut state = self.state.write().await;
        let (job, instances) = state.insert_job(name, model_id, template_id, count)?;
        if let Err(err) = self.store.insert_job(&job, &instances).await {
            state.remove_job(job.id)?;
            return Err(TransitionError::Store(err));
        }
        Ok((job, instances))
    }

    pub(crate) async fn remove_job(&self, id: JobId) -> Result<Job, TransitionError> {
        let mut state = self.state.write().await;
        if state.job(id).is_none() {
            return Err(CatalogError::UnknownJob(id).into());
        }
        self.store.remove_job(id).await.map_err(TransitionError::Store)?;
        Ok(state.remove_job(id)?)
    }
}
