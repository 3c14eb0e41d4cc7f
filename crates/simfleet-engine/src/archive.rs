use std::sync::Arc;

use simfleet_core::layout::{job_dir, remote_join};
use simfleet_core::{Archive, ArchiveId};
use tokio::io::AsyncReadExt;
use tracing::{Instrument, info, info_span, warn};

use crate::catalog::Catalog;
use crate::links::LinkPool;
use crate::remote::{RemoteChannel, RemoteError, disk_space};

/// Per-archive result of one replication.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ReplicationReport {
    pub(crate) succeeded: Vec<ArchiveId>,
    pub(crate) failed: Vec<(ArchiveId, String)>,
}

/// Copies a finished instance directory to every enabled archive.
///
/// Best-effort: each archive is attempted independently and failures are only
/// reported.
pub(crate) struct ArchiveReplicator {
    catalog: Arc<Catalog>,
    links: Arc<LinkPool>,
}

impl ArchiveReplicator {
    pub(crate) fn new(catalog: Arc<Catalog>, links: Arc<LinkPool>) -> Self {
        Self { catalog, links }
    }

    pub(crate) async fn replicate(
        &self,
        source: &dyn RemoteChannel,
        source_dir: &str,
        job_name: &str,
        sequence: usize,
    ) -> ReplicationReport {
        let mut report = ReplicationReport::default();
        let archives = self.catalog.enabled_archives().await;
        if archives.is_empty() {
            return report;
        }

        let files = match source.list_files(source_dir).await {
            Ok(files) => files,
            Err(err) => {
                warn!(dir = source_dir, error = %err, "cannot list instance output; skipping archives");
                report.failed = archives
                    .iter()
                    .map(|a| (a.id, format!("list {source_dir}: {err}")))
                    .collect();
                return report;
            }
        };

        for archive in &archives {
            let span = info_span!("archive", archive_id = archive.id, archive = %archive.address);
            let result = self
                .replicate_to(archive, source, source_dir, &files, job_name, sequence)
                .instrument(span.clone())
                .await;
            match result {
                Ok(()) => {
                    info!(parent: &span, files = files.len(), "replicated");
                    report.succeeded.push(archive.id);
                }
                Err(err) => {
                    warn!(parent: &span, error = %err, "replication failed");
                    report.failed.push((archive.id, err.to_string()));
                }
            }
        }
        report
    }

    async fn replicate_to(
        &self,
        archive: &Archive,
        source: &dyn RemoteChannel,
        source_dir: &str,
        files: &[String],
        job_name: &str,
        sequence: usize,
    ) -> Result<(), RemoteError> {
        let dest = self.links.connect(archive.id, &archive.endpoint()).await?;
        let result = copy_files(
            source,
            dest.as_ref(),
            source_dir,
            files,
            archive,
            job_name,
            sequence,
        )
        .await;
        if let Err(err) = &result {
            if err.is_transport() || !dest.is_alive() {
                self.links.invalidate(archive.id, &dest).await;
                return result;
            }
        }

        match disk_space(dest.as_ref(), &archive.working_directory).await {
            Ok(Some(space)) => {
                if let Err(err) = self
                    .catalog
                    .update_archive_space(archive.id, space.used_kib, space.total_kib)
                    .await
                {
                    warn!(error = %err, "cannot record archive capacity");
                }
            }
            Ok(None) => warn!("unrecognised df output"),
            Err(err) => {
                warn!(error = %err, "cannot read archive capacity");
                if err.is_transport() {
                    self.links.invalidate(archive.id, &dest).await;
                }
            }
        }
        result
    }
}

async fn copy_files(
    source: &dyn RemoteChannel,
    dest: &dyn RemoteChannel,
    source_dir: &str,
    files: &[String],
    archive: &Archive,
    job_name: &str,
    sequence: usize,
) -> Result<(), RemoteError> {
    let dest_dir = job_dir(&archive.working_directory, job_name, sequence);
    dest.mkdir_all(&dest_dir).await?;

    for file in files {
        let mut reader = source.open_read(&remote_join([source_dir, file.as_str()])).await?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        dest.upload(&remote_join([dest_dir.as_str(), file.as_str()]), &buf)
            .await?;
    }
    Ok(())
}
