//! Durable catalog contents and the state transitions allowed on them.

use serde::{Deserialize, Serialize};

use crate::model::{
    Archive, ArchiveId, InstanceId, Job, JobId, JobInstance, Model, ModelId, Resource,
    ResourceKey, Server, ServerId, Template, TemplateId,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("unknown server {0}")]
    UnknownServer(ServerId),
    #[error("unknown resource {0}")]
    UnknownResource(ResourceKey),
    #[error("unknown model {0}")]
    UnknownModel(ModelId),
    #[error("unknown template {0}")]
    UnknownTemplate(TemplateId),
    #[error("unknown job {0}")]
    UnknownJob(JobId),
    #[error("unknown job instance {0}")]
    UnknownInstance(InstanceId),
    #[error("unknown archive {0}")]
    UnknownArchive(ArchiveId),
    #[error("job instance {instance} already has pid {pid}")]
    PidAlreadyAssigned { instance: InstanceId, pid: u32 },
    #[error("job instance {0} cannot complete before it was launched")]
    NotLaunched(InstanceId),
    #[error("job instance {0} is already completed")]
    AlreadyCompleted(InstanceId),
    #[error("invalid job: {0}")]
    InvalidJob(String),
}

/// Everything the engine reads at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    #[serde(default)]
    pub servers: Vec<Server>,
    #[serde(default)]
    pub resources: Vec<Resource>,
    #[serde(default)]
    pub models: Vec<Model>,
    #[serde(default)]
    pub templates: Vec<Template>,
    #[serde(default)]
    pub jobs: Vec<Job>,
    #[serde(default)]
    pub instances: Vec<JobInstance>,
    #[serde(default)]
    pub archives: Vec<Archive>,
    /// Highest job id ever issued; ids are not reused after a removal.
    #[serde(default)]
    pub last_job_id: JobId,
    /// Highest instance id ever issued.
    #[serde(default)]
    pub last_instance_id: InstanceId,
}

impl CatalogSnapshot {
    pub fn server(&self, id: ServerId) -> Option<&Server> {
        self.servers.iter().find(|s| s.id == id)
    }

    pub fn resource(&self, key: ResourceKey) -> Option<&Resource> {
        self.resources.iter().find(|r| r.key() == key)
    }

    pub fn model(&self, id: ModelId) -> Option<&Model> {
        self.models.iter().find(|m| m.id == id)
    }

    pub fn template(&self, id: TemplateId) -> Option<&Template> {
        self.templates.iter().find(|t| t.id == id)
    }

    pub fn job(&self, id: JobId) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == id)
    }

    pub fn instance(&self, id: InstanceId) -> Option<&JobInstance> {
        self.instances.iter().find(|i| i.id == id)
    }

    pub fn archive(&self, id: ArchiveId) -> Option<&Archive> {
        self.archives.iter().find(|a| a.id == id)
    }

    /// Resources owned by `server`, ordered by device index.
    pub fn resources_of(&self, server: ServerId) -> Vec<&Resource> {
        let mut out: Vec<&Resource> = self
            .resources
            .iter()
            .filter(|r| r.server_id == server)
            .collect();
        out.sort_by_key(|r| r.device_id);
        out
    }

    /// Incomplete instances in job order, the order they are queued at load.
    pub fn pending_instances(&self) -> Vec<&JobInstance> {
        self.jobs
            .iter()
            .flat_map(|job| job.instances.iter())
            .filter_map(|id| self.instance(*id))
            .filter(|inst| !inst.completed)
            .collect()
    }

    /// `(completed, total)` instance counts of a job.
    pub fn job_progress(&self, id: JobId) -> Option<(usize, usize)> {
        let job = self.job(id)?;
        let completed = job
            .instances
            .iter()
            .filter_map(|iid| self.instance(*iid))
            .filter(|inst| inst.completed)
            .count();
        Some((completed, job.instances.len()))
    }

    fn instance_mut(&mut self, id: InstanceId) -> Result<&mut JobInstance, CatalogError> {
        self.instances
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or(CatalogError::UnknownInstance(id))
    }

    pub fn set_in_use(&mut self, key: ResourceKey, in_use: bool) -> Result<(), CatalogError> {
        let resource = self
            .resources
            .iter_mut()
            .find(|r| r.key() == key)
            .ok_or(CatalogError::UnknownResource(key))?;
        resource.in_use = in_use;
        Ok(())
    }

    pub fn set_server_enabled(&mut self, id: ServerId, enabled: bool) -> Result<(), CatalogError> {
        let server = self
            .servers
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(CatalogError::UnknownServer(id))?;
        server.enabled = enabled;
        Ok(())
    }

    pub fn bind_resource(&mut self, id: InstanceId, key: ResourceKey) -> Result<(), CatalogError> {
        self.instance_mut(id)?.resource = Some(key);
        Ok(())
    }

    /// Records the launched process id. A pid is assigned at most once.
    pub fn assign_pid(&mut self, id: InstanceId, pid: u32) -> Result<(), CatalogError> {
        let inst = self.instance_mut(id)?;
        if let Some(prev) = inst.pid {
            return Err(CatalogError::PidAlreadyAssigned {
                instance: id,
                pid: prev,
            });
        }
        inst.pid = Some(pid);
        inst.failure = None;
        Ok(())
    }

    /// Flips `completed` to true. Only valid once, and only after a launch.
    pub fn complete(&mut self, id: InstanceId, exit_code: Option<i32>) -> Result<(), CatalogError> {
        let inst = self.instance_mut(id)?;
        if inst.completed {
            return Err(CatalogError::AlreadyCompleted(id));
        }
        if inst.pid.is_none() {
            return Err(CatalogError::NotLaunched(id));
        }
        inst.completed = true;
        inst.exit_code = exit_code;
        Ok(())
    }

    pub fn record_failure(&mut self, id: InstanceId, message: &str) -> Result<(), CatalogError> {
        self.instance_mut(id)?.failure = Some(message.to_string());
        Ok(())
    }

    pub fn update_archive_space(
        &mut self,
        id: ArchiveId,
        used: u64,
        total: u64,
    ) -> Result<(), CatalogError> {
        let archive = self
            .archives
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or(CatalogError::UnknownArchive(id))?;
        archive.space_used = used;
        archive.space_total = total;
        Ok(())
    }

    /// Creates a job with `count` fresh instances and returns copies of the new rows.
    pub fn insert_job(
        &mut self,
        name: &str,
        model_id: ModelId,
        template_id: TemplateId,
        count: usize,
    ) -> Result<(Job, Vec<JobInstance>), CatalogError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CatalogError::InvalidJob("name is empty".to_string()));
        }
        if name.contains('/') || name == "." || name == ".." {
            return Err(CatalogError::InvalidJob(format!(
                "name {name:?} is not a directory name"
            )));
        }
        let dir_name = name.to_lowercase();
        if let Some(other) = self.jobs.iter().find(|j| j.name.to_lowercase() == dir_name) {
            return Err(CatalogError::InvalidJob(format!(
                "name {name:?} clashes with job {} ({:?})",
                other.id, other.name
            )));
        }
        if count == 0 {
            return Err(CatalogError::InvalidJob("instance count must be >= 1".to_string()));
        }
        if self.model(model_id).is_none() {
            return Err(CatalogError::UnknownModel(model_id));
        }
        if self.template(template_id).is_none() {
            return Err(CatalogError::UnknownTemplate(template_id));
        }

        let job_id = self
            .jobs
            .iter()
            .map(|j| j.id)
            .fold(self.last_job_id, u64::max)
            + 1;
        let first_instance = self
            .instances
            .iter()
            .map(|i| i.id)
            .fold(self.last_instance_id, u64::max)
            + 1;
        let instances: Vec<JobInstance> = (0..count as u64)
            .map(|offset| JobInstance::new(first_instance + offset, job_id))
            .collect();
        let job = Job {
            id: job_id,
            name: name.to_string(),
            model_id,
            template_id,
            instances: instances.iter().map(|i| i.id).collect(),
        };

        self.note_ids(&job, &instances);
        self.jobs.push(job.clone());
        self.instances.extend(instances.iter().cloned());
        Ok((job, instances))
    }

    /// Raises the id high-water marks to cover `job` and `instances`.
    pub fn note_ids(&mut self, job: &Job, instances: &[JobInstance]) {
        self.last_job_id = self.last_job_id.max(job.id);
        if let Some(max) = instances.iter().map(|i| i.id).max() {
            self.last_instance_id = self.last_instance_id.max(max);
        }
    }

    /// Removes a job and its instance rows. Remote files are left alone.
    pub fn remove_job(&mut self, id: JobId) -> Result<Job, CatalogError> {
        let pos = self
            .jobs
            .iter()
            .position(|j| j.id == id)
            .ok_or(CatalogError::UnknownJob(id))?;
        let job = self.jobs.remove(pos);
        self.instances.retain(|i| i.job_id != id);
        Ok(job)
    }

    /// Checks that every reference between records resolves.
    pub fn validate(&self) -> Result<(), CatalogError> {
        for resource in &self.resources {
            if self.server(resource.server_id).is_none() {
                return Err(CatalogError::UnknownServer(resource.server_id));
            }
        }
        for job in &self.jobs {
            if self.model(job.model_id).is_none() {
                return Err(CatalogError::UnknownModel(job.model_id));
            }
            if self.template(job.template_id).is_none() {
                return Err(CatalogError::UnknownTemplate(job.template_id));
            }
            for id in &job.instances {
                if self.instance(*id).is_none() {
                    return Err(CatalogError::UnknownInstance(*id));
                }
            }
        }
        for inst in &self.instances {
            if self.job(inst.job_id).is_none() {
                return Err(CatalogError::UnknownJob(inst.job_id));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::model::Credentials;

    fn catalog() -> CatalogSnapshot {
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

    #[test]
    fn insert_job_creates_exactly_count_instances() {
        let mut cat = catalog();
        let (job, instances) = cat.insert_job(" villin ", 1, 1, 3).unwrap();
        assert_eq!(job.name, "villin");
        assert_eq!(instances.len(), 3);
        assert_eq!(job.instances, vec![1, 2, 3]);
        assert!(instances.iter().all(|i| i.pid.is_none() && !i.completed));
        assert_eq!(cat.job_progress(job.id), Some((0, 3)));
        assert!(cat.validate().is_ok());

        let (second, _) = cat.insert_job("other", 1, 1, 1).unwrap();
        assert_eq!(second.id, 2);
        assert_eq!(second.instances, vec![4]);
    }

    #[test]
    fn insert_job_rejects_bad_input() {
        let mut cat = catalog();
        assert!(matches!(cat.insert_job("", 1, 1, 1), Err(CatalogError::InvalidJob(_))));
        assert!(matches!(cat.insert_job("a", 1, 1, 0), Err(CatalogError::InvalidJob(_))));
        assert_eq!(cat.insert_job("a", 9, 1, 1), Err(CatalogError::UnknownModel(9)));
        assert_eq!(cat.insert_job("a", 1, 9, 1), Err(CatalogError::UnknownTemplate(9)));
        for name in ["x/y", "/abs", ".", ".."] {
            assert!(
                matches!(cat.insert_job(name, 1, 1, 1), Err(CatalogError::InvalidJob(_))),
                "{name} accepted"
            );
        }
        assert!(cat.jobs.is_empty());
    }

    #[test]
    fn job_names_map_to_distinct_directories() {
        let mut cat = catalog();
        let (first, _) = cat.insert_job("Villin", 1, 1, 1).unwrap();
        assert!(matches!(cat.insert_job("villin", 1, 1, 1), Err(CatalogError::InvalidJob(_))));
        assert!(matches!(cat.insert_job("VILLIN ", 1, 1, 1), Err(CatalogError::InvalidJob(_))));
        assert_eq!(cat.jobs.len(), 1);
        assert_eq!(cat.instances.len(), 1);

        let (second, _) = cat.insert_job("villin-2", 1, 1, 1).unwrap();
        assert_ne!(
            crate::layout::job_dir("/w", &first.name, 0),
            crate::layout::job_dir("/w", &second.name, 0)
        );

        // The name frees up once its job is gone.
        cat.remove_job(first.id).unwrap();
        assert!(cat.insert_job("villin", 1, 1, 1).is_ok());
    }

    #[test]
    fn pid_is_assigned_once_and_completion_needs_it() {
        let mut cat = catalog();
        let (_, instances) = cat.insert_job("j", 1, 1, 1).unwrap();
        let id = instances[0].id;

        assert_eq!(cat.complete(id, Some(0)), Err(CatalogError::NotLaunched(id)));
        cat.record_failure(id, "upload failed").unwrap();
        cat.assign_pid(id, 4242).unwrap();
        assert_eq!(cat.instance(id).unwrap().failure, None);
        assert_eq!(
            cat.assign_pid(id, 1),
            Err(CatalogError::PidAlreadyAssigned {
                instance: id,
                pid: 4242
            })
        );

        cat.complete(id, Some(0)).unwrap();
        assert_eq!(cat.complete(id, Some(0)), Err(CatalogError::AlreadyCompleted(id)));
        let inst = cat.instance(id).unwrap();
        assert!(inst.completed);
        assert_eq!(inst.pid, Some(4242));
        assert_eq!(inst.exit_code, Some(0));
    }

    #[test]
    fn pending_instances_skip_completed_and_keep_job_order() {
        let mut cat = catalog();
        let (_, a) = cat.insert_job("a", 1, 1, 2).unwrap();
        let (_, b) = cat.insert_job("b", 1, 1, 1).unwrap();
        cat.assign_pid(a[0].id, 7).unwrap();
        cat.complete(a[0].id, None).unwrap();

        let pending: Vec<_> = cat.pending_instances().iter().map(|i| i.id).collect();
        assert_eq!(pending, vec![a[1].id, b[0].id]);
    }

    #[test]
    fn remove_job_drops_instance_rows() {
        let mut cat = catalog();
        let (a, _) = cat.insert_job("a", 1, 1, 2).unwrap();
        let (b, _) = cat.insert_job("b", 1, 1, 1).unwrap();
        cat.remove_job(a.id).unwrap();
        assert!(cat.job(a.id).is_none());
        assert_eq!(cat.instances.len(), 1);
        assert_eq!(cat.instances[0].job_id, b.id);
        assert_eq!(cat.remove_job(a.id), Err(CatalogError::UnknownJob(a.id)));

        let (c, fresh) = cat.insert_job("c", 1, 1, 1).unwrap();
        assert_eq!(c.id, 3);
        assert_eq!(fresh[0].id, 4);
    }

    #[test]
    fn validate_reports_dangling_references() {
        let mut cat = catalog();
        cat.resources.push(Resource {
            server_id: 9,
            device_id: 0,
            name: String::new(),
            uuid: String::new(),
            in_use: false,
        });
        assert_eq!(cat.validate(), Err(CatalogError::UnknownServer(9)));
    }
}
