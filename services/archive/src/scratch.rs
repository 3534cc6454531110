use crate::error::Result;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub removed_files: usize,
    pub removed_dirs: usize,
}

#[derive(Debug, Clone)]
pub struct ScratchDir {
    root: PathBuf,
    ttl: Duration,
}

impl ScratchDir {
    pub fn new(root: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            root: root.into(),
            ttl,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create and return the working directory for one job.
    pub async fn job_dir(&self, job_id: Uuid) -> Result<PathBuf> {
        let dir = self.root.join(job_id.to_string());
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Remove files and emptied directories older than the TTL.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let root = self.root.clone();
        let ttl = self.ttl;
        let report = tokio::task::spawn_blocking(move || sweep_older_than(&root, ttl, SystemTime::now()))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;

        if report.removed_files > 0 || report.removed_dirs > 0 {
            info!(
                root = %self.root.display(),
                files = report.removed_files,
                dirs = report.removed_dirs,
                "Swept scratch directory"
            );
        }
        Ok(report)
    }

    /// Sweep every `interval` until `cancel` fires.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Scratch sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep().await {
                            error!(error = %e, "Scratch sweep failed");
                        }
                    }
                }
            }
        })
    }
}

/// Synchronous sweep relative to `now`. A missing root is not an error.
pub fn sweep_older_than(root: &Path, ttl: Duration, now: SystemTime) -> io::Result<SweepReport> {
    let mut report = SweepReport::default();
    if !root.exists() {
        return Ok(report);
    }
    sweep_dir(root, ttl, now, &mut report)?;
    Ok(report)
}

fn sweep_dir(dir: &Path, ttl: Duration, now: SystemTime, report: &mut SweepReport) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = entry.metadata()?;

        if metadata.is_dir() {
            sweep_dir(&path, ttl, now, report)?;
            let empty = fs::read_dir(&path)?.next().is_none();
            if empty && is_expired(&metadata, ttl, now) {
                match fs::remove_dir(&path) {
                    Ok(()) => report.removed_dirs += 1,
                    Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove scratch dir"),
                }
            }
        } else if is_expired(&metadata, ttl, now) {
            match fs::remove_file(&path) {
                Ok(()) => report.removed_files += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove scratch file"),
            }
        }
    }
    Ok(())
}

fn is_expired(metadata: &fs::Metadata, ttl: Duration, now: SystemTime) -> bool {
    metadata
        .modified()
        .ok()
        .and_then(|modified| now.duration_since(modified).ok())
        .map_or(false, |age| age > ttl)
}
