//! Polling file watcher.
//!
//! Each poll walks the watch roots and records `(modified, len)` for every
//! file. Any difference from the previous snapshot counts as a change. The
//! walk runs on the blocking pool.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, warn};

use crate::descriptor::WatchSpec;

/// Always skipped, whatever `ignore_watch` says.
const ALWAYS_IGNORED: &[&str] = &[".git", "node_modules", "__pycache__"];

type Snapshot = BTreeMap<PathBuf, (Option<SystemTime>, u64)>;

#[derive(Debug)]
struct WatchScope {
    roots: Vec<PathBuf>,
    ignore: Vec<String>,
}

impl WatchScope {
    fn is_ignored(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };

        if ALWAYS_IGNORED.contains(&name) {
            return true;
        }

        self.ignore.iter().any(|pattern| {
            if Path::new(pattern).is_absolute() {
                path.starts_with(pattern)
            } else if let Some(suffix) = pattern.strip_prefix('*') {
                name.ends_with(suffix)
            } else {
                name == pattern
            }
        })
    }

    fn snapshot(&self) -> Snapshot {
        let mut snapshot = Snapshot::new();
        for root in &self.roots {
            self.walk(root, &mut snapshot);
        }
        snapshot
    }

    fn walk(&self, path: &Path, snapshot: &mut Snapshot) {
        if self.is_ignored(path) {
            return;
        }

        // Missing roots are legal; they may appear later.
        let Ok(metadata) = path.symlink_metadata() else {
            return;
        };

        if metadata.is_dir() {
            let Ok(entries) = std::fs::read_dir(path) else {
                return;
            };
            for entry in entries.flatten() {
                self.walk(&entry.path(), snapshot);
            }
        } else {
            snapshot.insert(path.to_path_buf(), (metadata.modified().ok(), metadata.len()));
        }
    }
}

/// Detects file changes under a process's watch roots.
#[derive(Debug)]
pub struct FileWatcher {
    scope: Arc<WatchScope>,
    baseline: Snapshot,
}

impl FileWatcher {
    /// Create a watcher and take the baseline snapshot.
    pub async fn new(spec: &WatchSpec) -> Self {
        let scope = Arc::new(WatchScope {
            roots: spec.roots.clone(),
            ignore: spec.ignore.clone(),
        });
        let baseline = take_snapshot(&scope).await.unwrap_or_default();
        debug!("Watching {} files under {:?}", baseline.len(), scope.roots);
        Self { scope, baseline }
    }

    /// Compare the tree with the previous snapshot.
    ///
    /// Returns one changed path (created, modified or deleted) and makes the
    /// new snapshot the baseline.
    pub async fn poll(&mut self) -> Option<PathBuf> {
        let current = take_snapshot(&self.scope).await?;
        let changed = first_difference(&self.baseline, &current);
        self.baseline = current;
        changed
    }
}

async fn take_snapshot(scope: &Arc<WatchScope>) -> Option<Snapshot> {
    let scope = Arc::clone(scope);
    match tokio::task::spawn_blocking(move || scope.snapshot()).await {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            warn!("File watcher snapshot failed: {}", e);
            None
        }
    }
}

fn first_difference(before: &Snapshot, after: &Snapshot) -> Option<PathBuf> {
    after
        .iter()
        .find(|(path, meta)| before.get(*path) != Some(*meta))
        .map(|(path, _)| path.clone())
        .or_else(|| {
            before
                .keys()
                .find(|path| !after.contains_key(*path))
                .cloned()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spec(root: &Path, ignore: &[&str]) -> WatchSpec {
        WatchSpec {
            roots: vec![root.to_path_buf()],
            ignore: ignore.iter().map(|s| s.to_string()).collect(),
            delay: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_detects_created_modified_and_deleted_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.py"), "print('v1')").unwrap();

        let mut watcher = FileWatcher::new(&spec(dir.path(), &[])).await;
        assert_eq!(watcher.poll().await, None);

        std::fs::write(dir.path().join("app.py"), "print('version 2')").unwrap();
        assert_eq!(watcher.poll().await, Some(dir.path().join("app.py")));
        assert_eq!(watcher.poll().await, None);

        std::fs::create_dir(dir.path().join("pages")).unwrap();
        std::fs::write(dir.path().join("pages/home.py"), "").unwrap();
        assert_eq!(watcher.poll().await, Some(dir.path().join("pages/home.py")));

        std::fs::remove_file(dir.path().join("app.py")).unwrap();
        assert_eq!(watcher.poll().await, Some(dir.path().join("app.py")));
    }

    #[tokio::test]
    async fn test_ignored_paths() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("out.log");
        let mut watcher = FileWatcher::new(&spec(
            dir.path(),
            &["tmp", "*.pyc", log.to_str().unwrap()],
        ))
        .await;

        for sub in ["tmp", ".git", "node_modules", "__pycache__"] {
            std::fs::create_dir(dir.path().join(sub)).unwrap();
            std::fs::write(dir.path().join(sub).join("file"), "x").unwrap();
        }
        std::fs::write(dir.path().join("module.pyc"), "x").unwrap();
        std::fs::write(&log, "line\n").unwrap();

        assert_eq!(watcher.poll().await, None);
    }

    #[tokio::test]
    async fn test_missing_root_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("later");
        let mut watcher = FileWatcher::new(&spec(&root, &[])).await;
        assert_eq!(watcher.poll().await, None);

        std::fs::create_dir(&root).unwrap();
        std::fs::write(root.join("config.toml"), "").unwrap();
        assert_eq!(watcher.poll().await, Some(root.join("config.toml")));
    }
}
