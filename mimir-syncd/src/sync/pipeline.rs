use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mimir_core::{CompletedPart, ContentClient, ItemKind, NewItem, RemoteItem};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::backoff::RetryPolicy;
use super::codec::canonical_name;
use super::dead_letter::DeadLetters;
use super::error::{ErrorKind, SyncError};
use super::flight::{PassGate, SingleFlight, TargetLocks};
use super::local_watcher::{StabilityCheck, wait_until_stable};
use super::names::NameRegistry;
use super::transfer::TransferClient;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum DownloadOutcome {
    Written { name: String, bytes: u64 },
    AlreadyPresent { name: String },
    SkippedNoSource { name: String },
    Failed {
        name: String,
        reason: String,
        kind: ErrorKind,
    },
}

impl DownloadOutcome {
    pub fn name(&self) -> &str {
        match self {
            DownloadOutcome::Written { name, .. }
            | DownloadOutcome::AlreadyPresent { name }
            | DownloadOutcome::SkippedNoSource { name }
            | DownloadOutcome::Failed { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum UploadStep {
    ReadFile,
    CreateItem,
    RequestTarget,
    TransferBytes,
    CompleteUpload,
    AttachToFolder,
}

impl fmt::Display for UploadStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            UploadStep::ReadFile => "read file",
            UploadStep::CreateItem => "create item",
            UploadStep::RequestTarget => "request upload target",
            UploadStep::TransferBytes => "transfer bytes",
            UploadStep::CompleteUpload => "complete upload",
            UploadStep::AttachToFolder => "attach to folder",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum UploadOutcome {
    Linked { name: String, item_id: String },
    Failed { name: String, step: UploadStep, reason: String },
}

struct StepFailure {
    step: UploadStep,
    reason: String,
}

fn at_step<E: fmt::Display>(step: UploadStep) -> impl FnOnce(E) -> StepFailure {
    move |err| StepFailure {
        step,
        reason: err.to_string(),
    }
}

/// Per-directory state that outlives a service rebuild: name claims, dead letters, the target
/// locks and single-flight tables, and the pass gate.
#[derive(Clone, Default)]
pub struct Coordination {
    pub names: Arc<NameRegistry>,
    pub dead_letters: Arc<DeadLetters>,
    pub locks: TargetLocks,
    pub downloads: Arc<SingleFlight<DownloadOutcome>>,
    pub uploads: Arc<SingleFlight<UploadOutcome>>,
    pub gate: Arc<PassGate>,
}

impl Coordination {
    /// Keeps the locks, flights and gate but starts over on claims and failure counts.
    pub fn for_new_folder(&self) -> Self {
        Self {
            names: Arc::default(),
            dead_letters: Arc::default(),
            ..self.clone()
        }
    }
}

/// Download and Upload for one download directory and remote folder.
///
/// Every transfer on a file name holds that name's target lock; concurrent requests of the same
/// kind for the same name share one execution.
pub struct TransferPipeline {
    client: ContentClient,
    transfer: TransferClient,
    download_dir: PathBuf,
    folder_id: String,
    shared: Coordination,
    retry: RetryPolicy,
}

impl TransferPipeline {
    pub fn new(
        client: ContentClient,
        transfer: TransferClient,
        download_dir: impl Into<PathBuf>,
        folder_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            transfer,
            download_dir: download_dir.into(),
            folder_id: folder_id.into(),
            shared: Coordination::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Joins the coordination state of a pipeline this one replaces.
    pub fn with_shared_state(mut self, shared: Coordination) -> Self {
        self.shared = shared;
        self
    }

    pub fn shared_state(&self) -> &Coordination {
        &self.shared
    }

    pub fn client(&self) -> &ContentClient {
        &self.client
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    pub fn folder_id(&self) -> &str {
        &self.folder_id
    }

    pub fn names(&self) -> &Arc<NameRegistry> {
        &self.shared.names
    }

    pub fn locks(&self) -> &TargetLocks {
        &self.shared.locks
    }

    pub fn gate(&self) -> &Arc<PassGate> {
        &self.shared.gate
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetters> {
        &self.shared.dead_letters
    }

    pub async fn fetch_item(&self, id: &str) -> Result<RemoteItem, mimir_core::ContentError> {
        self.retry
            .run("fetch item", || self.client.fetch_item(id))
            .await
    }

    /// The local name `item` maps to, claimed for it in the name registry.
    pub fn resolve_name(&self, item: &RemoteItem) -> String {
        let canonical = canonical_name(item.display_title().unwrap_or_default());
        self.names().claim_remote(&canonical, &item.id)
    }

    pub async fn download(&self, item: &RemoteItem) -> DownloadOutcome {
        let name = self.resolve_name(item);
        self.download_as(item, &name).await
    }

    /// Re-fetches one item and downloads it regardless of its dead-letter state.
    pub async fn retry_item(&self, id: &str) -> Result<DownloadOutcome, mimir_core::ContentError> {
        let item = self.fetch_item(id).await?;
        Ok(self.download(&item).await)
    }

    pub async fn download_as(&self, item: &RemoteItem, name: &str) -> DownloadOutcome {
        self.shared
            .downloads
            .run(name, || async {
                let _guard = self.locks().acquire(name).await;
                let outcome = self.download_locked(item, name).await;
                // Recorded once by the leader; callers that joined the flight share its result.
                match &outcome {
                    DownloadOutcome::Failed { reason, kind, .. } => {
                        let failures = self
                            .dead_letters()
                            .record_failure(&item.id, Some(name), reason);
                        warn!(
                            item_id = %item.id,
                            name,
                            failures,
                            kind = ?kind,
                            reason = %reason,
                            "download failed"
                        );
                    }
                    _ => self.dead_letters().record_success(&item.id),
                }
                outcome
            })
            .await
    }

    async fn download_locked(&self, item: &RemoteItem, name: &str) -> DownloadOutcome {
        let path = self.download_dir.join(name);
        match tokio::fs::try_exists(&path).await {
            Ok(true) => {
                debug!(name, "already present");
                return DownloadOutcome::AlreadyPresent {
                    name: name.to_string(),
                };
            }
            Ok(false) => {}
            Err(err) => {
                return DownloadOutcome::Failed {
                    name: name.to_string(),
                    reason: err.to_string(),
                    kind: ErrorKind::Filesystem,
                };
            }
        }

        let Some(url) = item.content_url() else {
            debug!(item_id = %item.id, name, "item has no content url");
            return DownloadOutcome::SkippedNoSource {
                name: name.to_string(),
            };
        };

        match self
            .retry
            .run("download", || self.transfer.download_to_path(url, &path))
            .await
        {
            Ok(bytes) => {
                info!(item_id = %item.id, name, bytes, "downloaded");
                DownloadOutcome::Written {
                    name: name.to_string(),
                    bytes,
                }
            }
            Err(err) => {
                let err = SyncError::from(err);
                DownloadOutcome::Failed {
                    name: name.to_string(),
                    reason: err.to_string(),
                    kind: err.kind(),
                }
            }
        }
    }

    pub async fn upload(&self, path: &Path) -> UploadOutcome {
        self.upload_inner(path, None).await
    }

    /// Uploads `path` once its size and modification time stop changing.
    pub async fn upload_when_settled(&self, path: &Path, settle: StabilityCheck) -> UploadOutcome {
        self.upload_inner(path, Some(settle)).await
    }

    async fn upload_inner(&self, path: &Path, settle: Option<StabilityCheck>) -> UploadOutcome {
        let name = match path.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => {
                return UploadOutcome::Failed {
                    name: path.display().to_string(),
                    step: UploadStep::ReadFile,
                    reason: "path has no file name".to_string(),
                };
            }
        };

        self.shared
            .uploads
            .run(&name, || async {
                let _guard = self.locks().acquire(&name).await;
                if let Some(settle) = settle {
                    match wait_until_stable(path, settle).await {
                        Ok(true) => {}
                        Ok(false) => {
                            return UploadOutcome::Failed {
                                name: name.clone(),
                                step: UploadStep::ReadFile,
                                reason: "file kept changing".to_string(),
                            };
                        }
                        Err(err) => {
                            return UploadOutcome::Failed {
                                name: name.clone(),
                                step: UploadStep::ReadFile,
                                reason: err.to_string(),
                            };
                        }
                    }
                }
                self.names().claim_local(&name);
                match self.upload_steps(path, &name).await {
                    Ok(item_id) => {
                        self.names().mark_linked(&name, Instant::now());
                        info!(name = %name, item_id = %item_id, "uploaded and linked");
                        UploadOutcome::Linked {
                            name: name.clone(),
                            item_id,
                        }
                    }
                    Err(failure) => {
                        warn!(name = %name, step = %failure.step, reason = %failure.reason, "upload failed");
                        if failure.step <= UploadStep::CreateItem {
                            self.names().release(&name);
                        }
                        UploadOutcome::Failed {
                            name: name.clone(),
                            step: failure.step,
                            reason: failure.reason,
                        }
                    }
                }
            })
            .await
    }

    async fn upload_steps(&self, path: &Path, name: &str) -> Result<String, StepFailure> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(at_step(UploadStep::ReadFile))?;
        if !metadata.is_file() {
            return Err(StepFailure {
                step: UploadStep::ReadFile,
                reason: "not a regular file".to_string(),
            });
        }

        let new_item = NewItem {
            original_file_name: name.to_string(),
            media_size: metadata.len(),
            item_type: ItemKind::from_file_name(name),
        };
        let item_id = self
            .retry
            .run("create item", || self.client.create_item(&new_item))
            .await
            .map_err(at_step(UploadStep::CreateItem))?;
        self.names().assign_item(name, &item_id);
        debug!(name, item_id = %item_id, kind = new_item.item_type.as_str(), "item created");

        let target = self
            .retry
            .run("request upload target", || {
                self.client.request_upload_target(&item_id, 1, name)
            })
            .await
            .map_err(at_step(UploadStep::RequestTarget))?;
        let part_url = target.part_url(0).ok_or_else(|| StepFailure {
            step: UploadStep::RequestTarget,
            reason: "no upload url".to_string(),
        })?;

        let checksum_tag = self
            .retry
            .run("upload bytes", || self.transfer.upload_from_path(part_url, path))
            .await
            .map_err(at_step(UploadStep::TransferBytes))?
            .ok_or_else(|| StepFailure {
                step: UploadStep::TransferBytes,
                reason: "storage returned no checksum tag".to_string(),
            })?;

        let parts = [CompletedPart {
            checksum_tag,
            part_number: 1,
        }];
        self.retry
            .run("complete upload", || {
                self.client
                    .complete_upload(&item_id, target.upload_id.as_deref(), &parts)
            })
            .await
            .map_err(at_step(UploadStep::CompleteUpload))?;

        let ids = [item_id.clone()];
        self.retry
            .run("attach to folder", || {
                self.client.attach_to_folder(&self.folder_id, &ids)
            })
            .await
            .map_err(at_step(UploadStep::AttachToFolder))?;

        Ok(item_id)
    }
}

/// Default settle sampling used by the watcher.
pub fn default_settle() -> StabilityCheck {
    StabilityCheck {
        interval: Duration::from_millis(500),
        max_rounds: 20,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn pipeline(server: &MockServer, dir: &Path) -> TransferPipeline {
        let client = ContentClient::with_base_url(&server.uri(), "secret").unwrap();
        TransferPipeline::new(client, TransferClient::new(), dir, "folder-1")
            .with_retry(RetryPolicy::none())
    }

    fn item(id: &str, title: &str, url: Option<String>) -> RemoteItem {
        serde_json::from_value(json!({
            "id": id,
            "title": title,
            "highRes": url,
            "folderParents": ["folder-1"],
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn download_is_idempotent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/media/1"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"pixels"))
            .expect(1)
            .mount(&server)
            .await;
        let dir = tempdir().unwrap();
        let pipeline = pipeline(&server, dir.path());
        let sunset = item("1", "Sunset Photo", Some(format!("{}/media/1", server.uri())));

        let first = pipeline.download(&sunset).await;
        let second = pipeline.download(&sunset).await;

        assert_eq!(
            first,
            DownloadOutcome::Written {
                name: "Sunset_Photo".into(),
                bytes: 6
            }
        );
        assert_eq!(
            second,
            DownloadOutcome::AlreadyPresent {
                name: "Sunset_Photo".into()
            }
        );
        assert_eq!(std::fs::read(dir.path().join("Sunset_Photo")).unwrap(), b"pixels");
    }

    #[tokio::test]
    async fn concurrent_downloads_of_one_item_write_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/media/1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"pixels")
                    .set_delay(Duration::from_millis(100)),
            )
            .expect(1)
            .mount(&server)
            .await;
        let dir = tempdir().unwrap();
        let pipeline = pipeline(&server, dir.path());
        let sunset = item("1", "Sunset Photo", Some(format!("{}/media/1", server.uri())));

        let (a, b, c) = tokio::join!(
            pipeline.download(&sunset),
            pipeline.download(&sunset),
            pipeline.download(&sunset)
        );
        let written = [a, b, c]
            .iter()
            .filter(|o| matches!(o, DownloadOutcome::Written { .. }))
            .count();
        assert!(written >= 1);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn item_without_content_is_skipped() {
        let server = MockServer::start().await;
        let dir = tempdir().unwrap();
        let pipeline = pipeline(&server, dir.path());

        let outcome = pipeline.download(&item("2", "Draft", None)).await;
        assert_eq!(
            outcome,
            DownloadOutcome::SkippedNoSource {
                name: "Draft".into()
            }
        );
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn colliding_titles_get_distinct_files() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/media/a"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"a"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/media/b"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"b"))
            .mount(&server)
            .await;
        let dir = tempdir().unwrap();
        let pipeline = pipeline(&server, dir.path());

        let first = pipeline
            .download(&item("aaaa1111", "cover.png", Some(format!("{}/media/a", server.uri()))))
            .await;
        let second = pipeline
            .download(&item("bbbb2222zz", "cover.png", Some(format!("{}/media/b", server.uri()))))
            .await;

        assert_eq!(first.name(), "cover.png");
        assert_eq!(second.name(), "cover_bbbb2222.png");
        assert_eq!(std::fs::read(dir.path().join("cover_bbbb2222.png")).unwrap(), b"b");
    }

    #[tokio::test]
    async fn failed_downloads_feed_dead_letters() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/media/9"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let dir = tempdir().unwrap();
        let pipeline = pipeline(&server, dir.path());
        let broken = item("9", "broken.jpg", Some(format!("{}/media/9", server.uri())));

        for _ in 0..3 {
            let outcome = pipeline.download(&broken).await;
            assert!(matches!(
                outcome,
                DownloadOutcome::Failed {
                    kind: ErrorKind::Network,
                    ..
                }
            ));
        }
        let letters = pipeline.dead_letters().list();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].item_id, "9");
        assert!(!dir.path().join("broken.jpg").exists());
    }

    #[tokio::test]
    async fn joined_download_failure_counts_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/media/7"))
            .respond_with(ResponseTemplate::new(503).set_delay(Duration::from_millis(100)))
            .expect(1)
            .mount(&server)
            .await;
        let dir = tempdir().unwrap();
        let pipeline = pipeline(&server, dir.path()).with_shared_state(Coordination {
            dead_letters: Arc::new(DeadLetters::new(2)),
            ..Coordination::default()
        });
        let flaky = item("7", "flaky.jpg", Some(format!("{}/media/7", server.uri())));

        let (a, b, c) = tokio::join!(
            pipeline.download(&flaky),
            pipeline.download(&flaky),
            pipeline.download(&flaky)
        );

        for outcome in [a, b, c] {
            assert!(matches!(outcome, DownloadOutcome::Failed { .. }));
        }
        assert!(!pipeline.dead_letters().is_dead("7"));
        assert!(pipeline.dead_letters().list().is_empty());
    }

    #[tokio::test]
    async fn unwritable_directory_is_a_filesystem_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/media/3"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"x"))
            .mount(&server)
            .await;
        let dir = tempdir().unwrap();
        let blocked = dir.path().join("not-a-dir");
        std::fs::write(&blocked, b"file").unwrap();
        let pipeline = pipeline(&server, &blocked);

        let outcome = pipeline
            .download(&item("3", "a.png", Some(format!("{}/media/3", server.uri()))))
            .await;

        match outcome {
            DownloadOutcome::Failed { kind, name, .. } => {
                assert_eq!(kind, ErrorKind::Filesystem);
                assert_eq!(name, "a.png");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn shared_state_carries_locks_across_pipelines() {
        let server = MockServer::start().await;
        let dir = tempdir().unwrap();
        let old = pipeline(&server, dir.path());
        let new = pipeline(&server, dir.path()).with_shared_state(old.shared_state().clone());

        let guard = old.locks().acquire("clip.mov").await;
        assert!(new.locks().is_held("clip.mov"));
        drop(guard);
        assert!(!new.locks().is_held("clip.mov"));
        assert!(Arc::ptr_eq(old.gate(), new.gate()));

        let moved = pipeline(&server, dir.path())
            .with_shared_state(old.shared_state().for_new_folder());
        assert!(Arc::ptr_eq(old.gate(), moved.gate()));
        assert!(!Arc::ptr_eq(old.names(), moved.names()));
    }

    #[tokio::test]
    async fn upload_runs_all_five_steps() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/items"))
            .and(header("x-mimir-cognito-id-token", "Bearer secret"))
            .and(body_json(json!({
                "originalFileName": "notes.txt",
                "mediaSize": 5,
                "itemType": "document"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "new-1"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/items/new-1/upload/multipart"))
            .and(body_json(json!({"parts": 1, "fileName": "notes.txt"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "urls": [format!("{}/s3/part1", server.uri())],
                "uploadId": "up-1"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/s3/part1"))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"tag\""))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/items/new-1/upload/multipart/complete"))
            .and(body_json(json!({
                "uploadId": "up-1",
                "parts": [{"ETag": "\"tag\"", "PartNumber": 1}]
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/folders/folder-1/content"))
            .and(body_json(json!({"items": ["new-1"]})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let file = dir.path().join("notes.txt");
        std::fs::write(&file, b"hello").unwrap();
        let pipeline = pipeline(&server, dir.path());

        let outcome = pipeline.upload(&file).await;
        assert_eq!(
            outcome,
            UploadOutcome::Linked {
                name: "notes.txt".into(),
                item_id: "new-1".into()
            }
        );
        let claim = pipeline.names().get("notes.txt").unwrap();
        assert_eq!(claim.item_id.as_deref(), Some("new-1"));
    }

    #[tokio::test]
    async fn upload_reports_failing_step_and_stops() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/items"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "new-2"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/items/new-2/upload/multipart"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad parts"))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/folders/folder-1/content"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let file = dir.path().join("clip.mov");
        std::fs::write(&file, b"frames").unwrap();
        let pipeline = pipeline(&server, dir.path());

        match pipeline.upload(&file).await {
            UploadOutcome::Failed { step, reason, .. } => {
                assert_eq!(step, UploadStep::RequestTarget);
                assert!(reason.contains("bad parts"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn upload_of_missing_file_fails_before_remote_calls() {
        let server = MockServer::start().await;
        let dir = tempdir().unwrap();
        let pipeline = pipeline(&server, dir.path());

        let outcome = pipeline.upload(&dir.path().join("ghost.bin")).await;
        assert!(matches!(
            outcome,
            UploadOutcome::Failed {
                step: UploadStep::ReadFile,
                ..
            }
        ));
        assert!(server.received_requests().await.unwrap().is_empty());
        assert!(pipeline.names().get("ghost.bin").is_none());
    }
}
