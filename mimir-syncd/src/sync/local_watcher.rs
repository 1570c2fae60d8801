use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::names::{NameOrigin, NameRegistry};
use super::pipeline::{TransferPipeline, UploadOutcome};

const TRANSIENT_SUFFIXES: [&str; 5] = [".tmp", ".partial", ".part", ".crdownload", ".swp"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFileRecord {
    pub name: String,
    pub byte_size: u64,
    pub modified: Option<SystemTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalChange {
    Added(LocalFileRecord),
    Modified(LocalFileRecord),
    Deleted { name: String },
}

pub fn is_ignored(name: &str) -> bool {
    name.starts_with('.')
        || TRANSIENT_SUFFIXES
            .iter()
            .any(|suffix| name.to_ascii_lowercase().ends_with(suffix))
}

/// Regular, non-ignored files directly inside `dir`.
pub async fn list_regular_files(dir: &Path) -> io::Result<Vec<LocalFileRecord>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_ignored(&name) {
            continue;
        }
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };
        if metadata.is_file() {
            files.push(LocalFileRecord {
                name,
                byte_size: metadata.len(),
                modified: metadata.modified().ok(),
            });
        }
    }
    Ok(files)
}

#[derive(Debug, Default)]
pub struct DirectorySnapshot {
    root: PathBuf,
    records: HashMap<String, LocalFileRecord>,
}

impl DirectorySnapshot {
    pub async fn scan(root: &Path) -> io::Result<Self> {
        let records = list_regular_files(root)
            .await?
            .into_iter()
            .map(|record| (record.name.clone(), record))
            .collect();
        Ok(Self {
            root: root.to_path_buf(),
            records,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&LocalFileRecord> {
        self.records.get(name)
    }

    /// Re-reads `name` and folds the result into the snapshot.
    pub async fn observe(&mut self, name: &str) -> io::Result<Option<LocalChange>> {
        if is_ignored(name) {
            return Ok(None);
        }
        let current = match tokio::fs::metadata(self.root.join(name)).await {
            Ok(metadata) if metadata.is_file() => Some(LocalFileRecord {
                name: name.to_string(),
                byte_size: metadata.len(),
                modified: metadata.modified().ok(),
            }),
            Ok(_) => None,
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => return Err(err),
        };

        let known = self.records.get(name).cloned();
        let change = match (known, current) {
            (Some(_), None) => {
                self.records.remove(name);
                Some(LocalChange::Deleted {
                    name: name.to_string(),
                })
            }
            (None, Some(record)) => {
                self.records.insert(name.to_string(), record.clone());
                Some(LocalChange::Added(record))
            }
            (Some(known), Some(record)) if known != record => {
                self.records.insert(name.to_string(), record.clone());
                Some(LocalChange::Modified(record))
            }
            _ => None,
        };
        Ok(change)
    }
}

/// Forwards the names of files directly under `root` that notify reports on.
pub fn start_notify_watcher(
    root: &Path,
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<String>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let root = root.to_path_buf();
    let watch_root = root.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            for name in map_event(&watch_root, event) {
                let _ = tx.send(name);
            }
        }
        Err(err) => warn!(error = %err, "watch error"),
    })?;
    watcher.watch(root.as_path(), RecursiveMode::NonRecursive)?;
    Ok((watcher, rx))
}

fn map_event(root: &Path, event: Event) -> Vec<String> {
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => event
            .paths
            .iter()
            .filter_map(|path| file_name_under(root, path))
            .collect(),
        _ => Vec::new(),
    }
}

fn file_name_under(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut components = relative.components();
    let name = components.next()?.as_os_str().to_string_lossy().into_owned();
    components.next().is_none().then_some(name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StabilityCheck {
    pub interval: Duration,
    pub max_rounds: u32,
}

/// Samples size and modification time until two consecutive samples agree.
///
/// Returns `Ok(false)` if the file is still changing after `max_rounds` samples.
pub async fn wait_until_stable(path: &Path, check: StabilityCheck) -> io::Result<bool> {
    let sample = || async {
        let metadata = tokio::fs::metadata(path).await?;
        Ok::<_, io::Error>((metadata.len(), metadata.modified().ok()))
    };
    let mut previous = sample().await?;
    for _ in 0..check.max_rounds.max(1) {
        tokio::time::sleep(check.interval).await;
        let current = sample().await?;
        if current == previous {
            return Ok(true);
        }
        previous = current;
    }
    Ok(false)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchAction {
    Upload(String),
    Release(String),
    Ignore,
}

/// What the watcher does about one classified change.
pub fn plan(change: &LocalChange, names: &NameRegistry) -> WatchAction {
    match change {
        LocalChange::Added(record) => match names.get(&record.name) {
            Some(claim) if claim.origin == NameOrigin::Remote => WatchAction::Ignore,
            _ => WatchAction::Upload(record.name.clone()),
        },
        // Modifications are recorded, not re-uploaded.
        LocalChange::Modified(_) => WatchAction::Ignore,
        LocalChange::Deleted { name } => match names.get(name) {
            Some(claim) if matches!(claim.origin, NameOrigin::Local { .. }) => {
                WatchAction::Release(name.clone())
            }
            _ => WatchAction::Ignore,
        },
    }
}

/// Drives uploads from filesystem notifications until `cancel` fires.
pub async fn run_watcher(
    pipeline: Arc<TransferPipeline>,
    mut snapshot: DirectorySnapshot,
    mut names_rx: mpsc::UnboundedReceiver<String>,
    settle: StabilityCheck,
    cancel: CancellationToken,
) {
    info!(
        dir = %pipeline.download_dir().display(),
        files = snapshot.len(),
        "watching download directory"
    );
    loop {
        let name = tokio::select! {
            _ = cancel.cancelled() => break,
            name = names_rx.recv() => match name {
                Some(name) => name,
                None => break,
            },
        };
        let change = match snapshot.observe(&name).await {
            Ok(Some(change)) => change,
            Ok(None) => continue,
            Err(err) => {
                warn!(name = %name, error = %err, "failed to inspect local file");
                continue;
            }
        };
        debug!(?change, "local change");
        match plan(&change, pipeline.names()) {
            WatchAction::Upload(name) => {
                info!(name = %name, "new local file");
                let pipeline = Arc::clone(&pipeline);
                tokio::spawn(async move {
                    let path = pipeline.download_dir().join(&name);
                    if let UploadOutcome::Failed { step, reason, .. } =
                        pipeline.upload_when_settled(&path, settle).await
                    {
                        warn!(name = %name, step = %step, reason = %reason, "local file not uploaded");
                    }
                });
            }
            WatchAction::Release(name) => pipeline.names().release(&name),
            WatchAction::Ignore => {}
        }
    }
    debug!("watcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn ignores_hidden_and_transient_names() {
        assert!(is_ignored(".DS_Store"));
        assert!(is_ignored(".Sunset_Photo.partial"));
        assert!(is_ignored("video.mp4.crdownload"));
        assert!(is_ignored("draft.TMP"));
        assert!(!is_ignored("Sunset_Photo"));
        assert!(!is_ignored("report.pdf"));
    }

    #[test]
    fn maps_events_to_top_level_names() {
        let root = Path::new("/tmp/root");
        let event = Event {
            kind: EventKind::Create(notify::event::CreateKind::File),
            paths: vec![
                PathBuf::from("/tmp/root/a.png"),
                PathBuf::from("/tmp/root/sub/b.png"),
                PathBuf::from("/elsewhere/c.png"),
            ],
            attrs: Default::default(),
        };
        assert_eq!(map_event(root, event), vec!["a.png".to_string()]);

        let access = Event {
            kind: EventKind::Access(notify::event::AccessKind::Any),
            paths: vec![PathBuf::from("/tmp/root/a.png")],
            attrs: Default::default(),
        };
        assert!(map_event(root, access).is_empty());
    }

    #[tokio::test]
    async fn scan_skips_hidden_files_and_directories() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("keep.txt"), b"1").unwrap();
        std::fs::write(dir.path().join(".hidden"), b"1").unwrap();
        std::fs::write(dir.path().join("x.tmp"), b"1").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let snapshot = DirectorySnapshot::scan(dir.path()).await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get("keep.txt").unwrap().byte_size, 1);
    }

    #[tokio::test]
    async fn observe_classifies_add_modify_delete() {
        let dir = tempdir().unwrap();
        let mut snapshot = DirectorySnapshot::scan(dir.path()).await.unwrap();
        let path = dir.path().join("a.txt");

        std::fs::write(&path, b"1").unwrap();
        assert!(matches!(
            snapshot.observe("a.txt").await.unwrap(),
            Some(LocalChange::Added(_))
        ));
        assert_eq!(snapshot.observe("a.txt").await.unwrap(), None);

        std::fs::write(&path, b"12345").unwrap();
        match snapshot.observe("a.txt").await.unwrap() {
            Some(LocalChange::Modified(record)) => assert_eq!(record.byte_size, 5),
            other => panic!("expected modification, got {other:?}"),
        }

        std::fs::remove_file(&path).unwrap();
        assert_eq!(
            snapshot.observe("a.txt").await.unwrap(),
            Some(LocalChange::Deleted {
                name: "a.txt".into()
            })
        );
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.observe("a.txt").await.unwrap(), None);
    }

    #[tokio::test]
    async fn stable_file_settles_and_missing_file_errors() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("done.bin");
        std::fs::write(&path, b"data").unwrap();
        let check = StabilityCheck {
            interval: Duration::from_millis(10),
            max_rounds: 3,
        };

        assert!(wait_until_stable(&path, check).await.unwrap());
        assert!(wait_until_stable(&dir.path().join("nope"), check).await.is_err());
    }

    #[test]
    fn downloaded_files_are_not_uploaded() {
        let names = NameRegistry::new();
        names.claim_remote("Sunset_Photo", "1");
        let record = |name: &str| LocalFileRecord {
            name: name.to_string(),
            byte_size: 1,
            modified: None,
        };

        assert_eq!(
            plan(&LocalChange::Added(record("Sunset_Photo")), &names),
            WatchAction::Ignore
        );
        assert_eq!(
            plan(&LocalChange::Added(record("mine.png")), &names),
            WatchAction::Upload("mine.png".into())
        );
        assert_eq!(
            plan(&LocalChange::Modified(record("mine.png")), &names),
            WatchAction::Ignore
        );

        names.claim_local("mine.png");
        assert_eq!(
            plan(&LocalChange::Deleted { name: "mine.png".into() }, &names),
            WatchAction::Release("mine.png".into())
        );
        assert_eq!(
            plan(&LocalChange::Deleted { name: "Sunset_Photo".into() }, &names),
            WatchAction::Ignore
        );
    }
}
