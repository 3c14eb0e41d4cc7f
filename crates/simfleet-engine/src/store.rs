//! Durable catalog backends.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use simfleet_core::{
    ArchiveId, CatalogError, CatalogSnapshot, InstanceId, Job, JobId, JobInstance, ResourceKey,
    ServerId,
};

/// Durable side of the catalog.
///
/// The engine reads everything once through [`CatalogStore::load`] and afterwards
/// only writes individual transitions back.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Reads the full catalog.
    async fn load(&self) -> anyhow::Result<CatalogSnapshot>;

    /// Records that `instance` is bound to `resource`.
    async fn record_binding(
        &self,
        instance: InstanceId,
        resource: ResourceKey,
    ) -> anyhow::Result<()>;

    /// Records the remote process id of a launched instance.
    async fn record_pid(&self, instance: InstanceId, pid: u32) -> anyhow::Result<()>;

    /// Records that `instance` completed.
    async fn record_completion(
        &self,
        instance: InstanceId,
        exit_code: Option<i32>,
    ) -> anyhow::Result<()>;

    /// Records a provisioning failure against `instance`.
    async fn record_failure(&self, instance: InstanceId, message: &str) -> anyhow::Result<()>;

    /// Records a server enable/disable toggle.
    async fn record_server_enabled(&self, server: ServerId, enabled: bool) -> anyhow::Result<()>;

    /// Records the last reported capacity of an archive, in KiB.
    async fn record_archive_space(
        &self,
        archive: ArchiveId,
        used: u64,
        total: u64,
    ) -> anyhow::Result<()>;

    /// Stores a new job together with its instances.
    async fn insert_job(&self, job: &Job, instances: &[JobInstance]) -> anyhow::Result<()>;

    /// Deletes a job and its instance rows.
    async fn remove_job(&self, job: JobId) -> anyhow::Result<()>;
}

fn store_job(
    catalog: &mut CatalogSnapshot,
    job: &Job,
    instances: &[JobInstance],
) -> Result<(), CatalogError> {
    if catalog.job(job.id).is_some() {
        return Err(CatalogError::InvalidJob(format!("job {} already stored", job.id)));
    }
    if let Some(dup) = instances.iter().find(|i| catalog.instance(i.id).is_some()) {
        return Err(CatalogError::InvalidJob(format!(
            "job instance {} already stored",
            dup.id
        )));
    }
    catalog.note_ids(job, instances);
    catalog.jobs.push(job.clone());
    catalog.instances.extend(instances.iter().cloned());
    Ok(())
}

fn store_completion(
    catalog: &mut CatalogSnapshot,
    instance: InstanceId,
    exit_code: Option<i32>,
) -> Result<(), CatalogError> {
    match catalog.complete(instance, exit_code) {
        Err(CatalogError::AlreadyCompleted(_)) => Ok(()),
        other => other,
    }
}

/// Catalog kept in a single JSON file, rewritten atomically after every transition.
pub struct JsonCatalogStore {
    path: PathBuf,
    state: tokio::sync::Mutex<CatalogSnapshot>,
}

impl JsonCatalogStore {
    /// Opens the catalog at `path`; a missing file is an empty catalog.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let state = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .map_err(|err| anyhow::anyhow!("read catalog {}: {err}", path.display()))?;
            let state: CatalogSnapshot = serde_json::from_str(&raw)
                .map_err(|err| anyhow::anyhow!("parse catalog {}: {err}", path.display()))?;
            state.validate()?;
            state
        } else {
            CatalogSnapshot::default()
        };
        Ok(Self {
            path,
            state: tokio::sync::Mutex::new(state),
        })
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn update<F>(&self, apply: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut CatalogSnapshot) -> Result<(), CatalogError> + Send,
    {
        // The lock is held across the write so files land in transition order.
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        apply(&mut next)?;

        let path = self.path.clone();
        let file = next.clone();
        tokio::task::spawn_blocking(move || persist_file(&path, &file))
            .await
            .map_err(|err| anyhow::anyhow!("persist catalog: {err:#}"))??;

        *state = next;
        Ok(())
    }
}

fn persist_file(path: &Path, catalog: &CatalogSnapshot) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid catalog path: {}", path.display()))?;
    std::fs::create_dir_all(dir)?;

    let json = serde_json::to_string_pretty(catalog)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

#[async_trait]
impl CatalogStore for JsonCatalogStore {
    async fn load(&self) -> anyhow::Result<CatalogSnapshot> {
        Ok(self.state.lock().await.clone())
    }

    async fn record_binding(
        &self,
        instance: InstanceId,
        resource: ResourceKey,
    ) -> anyhow::Result<()> {
        self.update(|c| c.bind_resource(instance, resource)).await
    }

    async fn record_pid(&self, instance: InstanceId, pid: u32) -> anyhow::Result<()> {
        self.update(|c| c.assign_pid(instance, pid)).await
    }

    async fn record_completion(
        &self,
        instance: InstanceId,
        exit_code: Option<i32>,
    ) -> anyhow::Result<()> {
        self.update(|c| store_completion(c, instance, exit_code)).await
    }

    async fn record_failure(&self, instance: InstanceId, message: &str) -> anyhow::Result<()> {
        let message = message.to_string();
        self.update(move |c| c.record_failure(instance, &message)).await
    }

    async fn record_server_enabled(&self, server: ServerId, enabled: bool) -> anyhow::Result<()> {
        self.update(|c| c.set_server_enabled(server, enabled)).await
    }

    async fn record_archive_space(
        &self,
        archive: ArchiveId,
        used: u64,
        total: u64,
    ) -> anyhow::Result<()> {
        self.update(|c| c.update_archive_space(archive, used, total))
            .await
    }

    async fn insert_job(&self, job: &Job, instances: &[JobInstance]) -> anyhow::Result<()> {
        self.update(|c| store_job(c, job, instances)).await
    }

    async fn remove_job(&self, job: JobId) -> anyhow::Result<()> {
        self.update(|c| c.remove_job(job).map(|_| ())).await
    }
}

/// Volatile catalog, for embedding and tests.
#[derive(Default)]
pub struct MemoryCatalogStore {
    state: parking_lot::Mutex<CatalogSnapshot>,
}

impl MemoryCatalogStore {
    /// Wraps an initial catalog.
    pub fn new(catalog: CatalogSnapshot) -> Self {
        Self {
            state: parking_lot::Mutex::new(catalog),
        }
    }

    /// Copy of the stored records.
    pub fn contents(&self) -> CatalogSnapshot {
        self.state.lock().clone()
    }

    fn update<F>(&self, apply: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut CatalogSnapshot) -> Result<(), CatalogError>,
    {
        let mut state = self.state.lock();
        apply(&mut state)?;
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn load(&self) -> anyhow::Result<CatalogSnapshot> {
        Ok(self.contents())
    }

    async fn record_binding(
        &self,
        instance: InstanceId,
        resource: ResourceKey,
    ) -> anyhow::Result<()> {
        self.update(|c| c.bind_resource(instance, resource))
    }

    async fn record_pid(&self, instance: InstanceId, pid: u32) -> anyhow::Result<()> {
        self.update(|c| c.assign_pid(instance, pid))
    }

    async fn record_completion(
        &self,
        instance: InstanceId,
        exit_code: Option<i32>,
    ) -> anyhow::Result<()> {
        self.update(|c| store_completion(c, instance, exit_code))
    }

    async fn record_failure(&self, instance: InstanceId, message: &str) -> anyhow::Result<()> {
        self.update(|c| c.record_failure(instance, message))
    }

    async fn record_server_enabled(&self, server: ServerId, enabled: bool) -> anyhow::Result<()> {
        self.update(|c| c.set_server_enabled(server, enabled))
    }

    async fn record_archive_space(
        &self,
        archive: ArchiveId,
        used: u64,
        total: u64,
    ) -> anyhow::Result<()> {
        self.update(|c| c.update_archive_space(archive, used, total))
    }

    async fn insert_job(&self, job: &Job, instances: &[JobInstance]) -> anyhow::Result<()> {
        self.update(|c| store_job(c, job, instances))
    }

    async fn remove_job(&self, job: JobId) -> anyhow::Result<()> {
        self.update(|c| c.remove_job(job).map(|_| ()))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use simfleet_core::{Credentials, Model, Resource, Server, Template};

    use super::*;

    fn seed() -> CatalogSnapshot {
        CatalogSnapshot {
            servers: vec![Server {
                id: 1,
                address: "node1".to_string(),
                credentials: Credentials::default(),
                working_directory: "/scratch".to_string(),
                enabled: true,
            }],
            resources: vec![Resource {
                server_id: 1,
                device_id: 0,
                name: "GPU".to_string(),
                uuid: "GPU-0".to_string(),
                in_use: false,
            }],
            models: vec![Model {
                id: 1,
                name: "Villin".to_string(),
                files: vec!["villin.tpr".to_string()],
            }],
            templates: vec![Template {
                id: 1,
                name: "npt".to_string(),
                file: PathBuf::from("templates/npt.conf"),
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn json_store_persists_transitions_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("catalog.json");

        let mut catalog = seed();
        let (job, instances) = catalog.insert_job("villin", 1, 1, 2).unwrap();

        let store = JsonCatalogStore::open(&path).unwrap();
        assert_eq!(store.load().await.unwrap(), CatalogSnapshot::default());
        // Seed the fixed records by writing them through a fresh file.
        persist_file(&path, &seed()).unwrap();
        let store = JsonCatalogStore::open(&path).unwrap();

        store.insert_job(&job, &instances).await.unwrap();
        let key = ResourceKey::new(1, 0);
        store.record_binding(instances[0].id, key).await.unwrap();
        store.record_pid(instances[0].id, 4242).await.unwrap();
        store.record_completion(instances[0].id, Some(0)).await.unwrap();
        store.record_failure(instances[1].id, "upload failed").await.unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        let reopened = JsonCatalogStore::open(&path).unwrap();
        let loaded = reopened.load().await.unwrap();
        let first = loaded.instance(instances[0].id).unwrap();
        assert_eq!(first.resource, Some(key));
        assert_eq!(first.pid, Some(4242));
        assert!(first.completed);
        assert_eq!(
            loaded.instance(instances[1].id).unwrap().failure.as_deref(),
            Some("upload failed")
        );
        assert_eq!(loaded.job_progress(job.id), Some((1, 2)));
    }

    #[tokio::test]
    async fn json_store_rejects_invalid_transition_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        let mut catalog = seed();
        let (_, instances) = catalog.insert_job("villin", 1, 1, 1).unwrap();
        persist_file(&path, &catalog).unwrap();

        let store = JsonCatalogStore::open(&path).unwrap();
        assert!(store.record_completion(instances[0].id, Some(0)).await.is_err());
        store.record_pid(instances[0].id, 7).await.unwrap();
        assert!(store.record_pid(instances[0].id, 8).await.is_err());

        let reopened = JsonCatalogStore::open(&path).unwrap();
        let inst = reopened.load().await.unwrap().instances[0].clone();
        assert_eq!(inst.pid, Some(7));
        assert!(!inst.completed);
    }

    #[tokio::test]
    async fn memory_store_removes_jobs_with_their_instances() {
        let store = MemoryCatalogStore::new(seed());
        let mut catalog = seed();
        let (job, instances) = catalog.insert_job("villin", 1, 1, 3).unwrap();
        store.insert_job(&job, &instances).await.unwrap();
        assert!(store.insert_job(&job, &instances).await.is_err());
        assert_eq!(store.contents().instances.len(), 3);

        store.remove_job(job.id).await.unwrap();
        let contents = store.contents();
        assert!(contents.jobs.is_empty());
        assert!(contents.instances.is_empty());
    }

    #[test]
    fn open_rejects_dangling_references() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        let mut catalog = seed();
        catalog.resources[0].server_id = 9;
        persist_file(&path, &catalog).unwrap();
        assert!(JsonCatalogStore::open(&path).is_err());
    }
}
