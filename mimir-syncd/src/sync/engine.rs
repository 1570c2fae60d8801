use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use futures_util::stream::{self, StreamExt};
use mimir_core::{ContentError, RemoteItem};
use tracing::{debug, info, warn};

use super::error::SyncError;
use super::flight::GateEntry;
use super::local_watcher::list_regular_files;
use super::pipeline::{DownloadOutcome, TransferPipeline};
use super::state::{PassReport, SyncState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassResult {
    Completed(PassReport),
    /// Another pass was running; it will run once more on this trigger's behalf.
    Coalesced,
}

pub struct Reconciler {
    pipeline: Arc<TransferPipeline>,
    state: Arc<SyncState>,
    concurrency: usize,
}

impl Reconciler {
    pub fn new(pipeline: Arc<TransferPipeline>, state: Arc<SyncState>) -> Self {
        Self {
            pipeline,
            state,
            concurrency: 4,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn pipeline(&self) -> &Arc<TransferPipeline> {
        &self.pipeline
    }

    pub fn is_running(&self) -> bool {
        self.pipeline.gate().is_running()
    }

    /// Runs a reconciliation pass unless one is already running.
    ///
    /// Triggers that arrive during a pass are folded into one follow-up pass run by the caller
    /// that holds the gate. The gate belongs to the download directory, so passes started by
    /// replaced services still exclude each other.
    pub async fn run_pass(&self) -> Result<PassResult, SyncError> {
        let gate = Arc::clone(self.pipeline.gate());
        let GateEntry::Acquired(mut permit) = gate.enter() else {
            debug!("pass already running; trigger coalesced");
            return Ok(PassResult::Coalesced);
        };
        loop {
            let mut result = self.pass_once().await;
            while permit.take_rerun() {
                info!("running coalesced pass");
                result = self.pass_once().await;
            }
            drop(permit);
            // A trigger may have landed between the last check and the release.
            if !gate.rerun_pending() {
                return result.map(PassResult::Completed);
            }
            match gate.enter() {
                GateEntry::Acquired(next) => permit = next,
                GateEntry::Coalesced => return result.map(PassResult::Completed),
            }
        }
    }

    async fn pass_once(&self) -> Result<PassReport, SyncError> {
        match self.reconcile().await {
            Ok(report) => {
                info!(
                    listed = report.listed,
                    downloaded = report.downloaded,
                    skipped = report.skipped,
                    failed = report.failed,
                    deleted = report.deleted,
                    "reconciliation pass finished"
                );
                self.state.record_pass(report.clone());
                Ok(report)
            }
            Err(err) => {
                warn!(error = %err, kind = ?err.kind(), "reconciliation pass aborted");
                self.state.record_failure(err.to_string());
                Err(err)
            }
        }
    }

    async fn reconcile(&self) -> Result<PassReport, SyncError> {
        let pipeline = &self.pipeline;
        let started = Instant::now();
        let started_wall = SystemTime::now();
        let dir = pipeline.download_dir();
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|err| SyncError::io(dir, err))?;

        let listing = pipeline
            .retry()
            .run("list folder", || {
                pipeline.client().list_folder_contents(pipeline.folder_id())
            })
            .await?;
        let mut report = PassReport {
            listed: listing.len(),
            ..PassReport::default()
        };
        debug!(listed = report.listed, "remote listing fetched");

        let details: Vec<(RemoteItem, Option<ContentError>)> = stream::iter(listing)
            .map(|summary| async move {
                match pipeline.fetch_item(&summary.id).await {
                    Ok(item) => (item, None),
                    Err(err) => (summary, Some(err)),
                }
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        // Names are claimed in listing order so colliding titles resolve the same way each pass.
        let mut expected = HashSet::new();
        let mut listed_ids = HashSet::new();
        let mut planned = Vec::new();
        for (item, fetch_error) in details {
            let name = pipeline.resolve_name(&item);
            expected.insert(name.clone());
            listed_ids.insert(item.id.clone());
            if let Some(err) = fetch_error {
                warn!(item_id = %item.id, error = %err, "item detail fetch failed");
                pipeline
                    .dead_letters()
                    .record_failure(&item.id, Some(&name), &err.to_string());
                report.failed += 1;
            } else if pipeline.dead_letters().is_dead(&item.id) {
                debug!(item_id = %item.id, name = %name, "dead-lettered; waiting for manual retry");
                report.failed += 1;
            } else {
                planned.push((item, name));
            }
        }

        let outcomes: Vec<DownloadOutcome> = stream::iter(planned)
            .map(|(item, name)| async move { pipeline.download_as(&item, &name).await })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        for outcome in &outcomes {
            match outcome {
                DownloadOutcome::Written { .. } => report.downloaded += 1,
                DownloadOutcome::AlreadyPresent { .. } | DownloadOutcome::SkippedNoSource { .. } => {
                    report.skipped += 1
                }
                DownloadOutcome::Failed { .. } => report.failed += 1,
            }
        }

        // Deletions only start once every download above has finished.
        let local = list_regular_files(dir)
            .await
            .map_err(|err| SyncError::io(dir, err))?;
        let deleting_at = SystemTime::now();
        for file in local {
            if expected.contains(&file.name) {
                continue;
            }
            if pipeline.locks().is_held(&file.name)
                || pipeline.names().linked_since(&file.name, started)
                || file
                    .modified
                    .is_some_and(|modified| modified > started_wall && modified <= deleting_at)
            {
                debug!(name = %file.name, "local file is newer than this pass; kept");
                continue;
            }
            match tokio::fs::remove_file(dir.join(&file.name)).await {
                Ok(()) => {
                    info!(name = %file.name, "removed local file missing from remote folder");
                    pipeline.names().release(&file.name);
                    report.deleted += 1;
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(name = %file.name, error = %err, "failed to remove local file");
                    report.failed += 1;
                }
            }
        }

        pipeline.names().retain_listed(&listed_ids, &expected);
        Ok(report)
    }
}
