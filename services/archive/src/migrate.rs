use crate::error::{ArchiveError, Result};
use crate::locator::RecordingLocator;
use crate::progress::{Progress, ProgressFn};
use crate::store::{list_all, ObjectStore};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

/// Extensions that are migrated; everything else is left in place.
const MIGRATED_EXTENSIONS: [&str; 4] = ["ts", "mp4", "m4s", "m3u8"];

/// Outcome of one migration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub moved: usize,
    /// Key and last error of every object that is still at the old root.
    pub failures: BTreeMap<String, String>,
}

impl MigrationReport {
    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

pub struct Migrator {
    store: Arc<dyn ObjectStore>,
    concurrency: usize,
    catchup_delay: Duration,
}

impl Migrator {
    pub fn new(store: Arc<dyn ObjectStore>, concurrency: usize, catchup_delay: Duration) -> Self {
        Self {
            store,
            concurrency: concurrency.max(1),
            catchup_delay,
        }
    }

    /// Move every segment of `locator`'s channel from `old_root` to `new_root`.
    ///
    /// Per-object failures are logged, reported through `progress` and
    /// counted, never returned. After the main pass the old prefix is listed
    /// once more, after `catchup_delay`, to pick up objects written meanwhile.
    #[instrument(skip(self, progress, cancel), fields(device = locator.device_id(), channel = locator.channel_id()))]
    pub async fn move_segments(
        &self,
        locator: &RecordingLocator,
        old_root: &str,
        new_root: &str,
        progress: ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<MigrationReport> {
        let source = locator.with_root(old_root)?;
        let target = locator.with_root(new_root)?;
        if source.root() == target.root() {
            return Err(ArchiveError::InvalidLocator(format!(
                "source and target root are both '{}'",
                source.root()
            )));
        }

        let mut report = MigrationReport::default();
        self.run_pass(&source, &target, &progress, cancel, &mut report).await?;

        tokio::select! {
            _ = cancel.cancelled() => return Err(ArchiveError::Cancelled),
            _ = tokio::time::sleep(self.catchup_delay) => {}
        }
        debug!("Catch-up listing after main pass");
        self.run_pass(&source, &target, &progress, cancel, &mut report).await?;

        info!(
            moved = report.moved,
            failed = report.failed(),
            from = %source,
            to = %target,
            "Migration finished"
        );
        Ok(report)
    }

    async fn run_pass(
        &self,
        source: &RecordingLocator,
        target: &RecordingLocator,
        progress: &ProgressFn,
        cancel: &CancellationToken,
        report: &mut MigrationReport,
    ) -> Result<()> {
        let prefix = format!("{}/", source.channel_prefix());
        let keys: Vec<String> = list_all(self.store.as_ref(), &prefix)
            .await?
            .into_iter()
            .filter(|key| is_migrated(key))
            .collect();

        let total = keys.len();
        let source_root = source.root();
        let target_root = target.root();

        let mut moves = stream::iter(keys)
            .map(|key| {
                let store = self.store.clone();
                let dst = format!("{target_root}{}", &key[source_root.len()..]);
                async move {
                    if cancel.is_cancelled() {
                        return (key, Err(ArchiveError::Cancelled));
                    }
                    let outcome = move_object(store.as_ref(), &key, &dst).await;
                    (key, outcome)
                }
            })
            .buffer_unordered(self.concurrency);

        let mut current = 0;
        while let Some((key, outcome)) = moves.next().await {
            current += 1;
            match outcome {
                Ok(()) => {
                    report.moved += 1;
                    report.failures.remove(&key);
                    metrics::counter!("archive.migration.moved").increment(1);
                    progress(Progress::ok(total, current, key));
                }
                Err(ArchiveError::Cancelled) => {}
                Err(err) => {
                    error!(key = %key, error = %err, "Failed to move object");
                    metrics::counter!("archive.migration.failed").increment(1);
                    progress(Progress::failed(total, current, key.clone(), &err));
                    report.failures.insert(key, err.to_string());
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }
        Ok(())
    }
}

/// Copy then delete; the delete only runs once the copy is visible at `dst`.
async fn move_object(store: &dyn ObjectStore, src: &str, dst: &str) -> Result<()> {
    store.copy_object(src, dst).await?;
    if !store.object_exists(dst).await? {
        return Err(ArchiveError::transport("copy", dst, "target missing after copy"));
    }
    store.delete_object(src).await?;
    debug!(source = src, target = dst, "Moved object");
    Ok(())
}

fn is_migrated(key: &str) -> bool {
    key.rsplit_once('.')
        .map(|(_, ext)| MIGRATED_EXTENSIONS.iter().any(|e| ext.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}
