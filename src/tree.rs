//! Registration of directory trees with a [`NotificationSource`].
//!
//! Each directory is one job: register it, then list its subdirectories and
//! queue them one level deeper. Jobs run on the blocking pool, at most
//! `max_parallel` at a time across every caller sharing the builder.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashSet;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::error::RegistrationError;
use crate::registry::TargetRegistry;
use crate::source::NotificationSource;

/// Directories currently registered. Only ever grows.
#[derive(Debug, Default)]
pub struct WatchSet {
    dirs: DashSet<PathBuf>,
}

impl WatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the directory was not already present.
    pub fn insert(&self, dir: PathBuf) -> bool {
        self.dirs.insert(dir)
    }

    fn forget(&self, dir: &Path) {
        self.dirs.remove(dir);
    }

    pub fn contains(&self, dir: &Path) -> bool {
        self.dirs.contains(dir)
    }

    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }

    /// Sorted copy of the current contents.
    pub fn snapshot(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = self.dirs.iter().map(|d| d.key().clone()).collect();
        dirs.sort();
        dirs
    }
}

/// How a pass treats directories already in the [`WatchSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    /// Register only directories not yet in the set.
    Initial,
    /// Hand every directory to the source again. The OS drops its watch when
    /// a directory is removed, so a path that reappears must be re-added.
    Refresh,
}

#[derive(Debug, Default)]
struct ScanOutcome {
    registered: bool,
    children: Vec<PathBuf>,
}

#[derive(Clone)]
pub struct TreeBuilder {
    source: Arc<dyn NotificationSource>,
    watched: Arc<WatchSet>,
    permits: Arc<Semaphore>,
    max_parallel: usize,
}

impl std::fmt::Debug for TreeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeBuilder")
            .field("watched", &self.watched.len())
            .field("max_parallel", &self.max_parallel)
            .finish()
    }
}

impl TreeBuilder {
    pub fn new(source: Arc<dyn NotificationSource>, max_parallel: usize) -> Self {
        let max_parallel = max_parallel.max(1);
        Self {
            source,
            watched: Arc::new(WatchSet::new()),
            permits: Arc::new(Semaphore::new(max_parallel)),
            max_parallel,
        }
    }

    pub fn watch_set(&self) -> &Arc<WatchSet> {
        &self.watched
    }

    /// Register `root` and every subdirectory whose depth is within
    /// `max_depth` (negative for no limit). `root` itself sits at `depth`.
    ///
    /// Completes once the whole subtree has been processed. Directories that
    /// cannot be registered are logged and their branch is dropped; siblings
    /// carry on. Returns how many directories were newly registered.
    pub async fn register_subtree(&self, root: PathBuf, depth: i64, max_depth: i64) -> usize {
        self.walk(root, depth, max_depth, Pass::Initial).await
    }

    /// Like [`register_subtree`](Self::register_subtree), but re-adds
    /// directories that are already in the watch set. Used for directories
    /// created while monitoring, whose path may have been watched before.
    pub async fn refresh_subtree(&self, root: PathBuf, depth: i64, max_depth: i64) -> usize {
        self.walk(root, depth, max_depth, Pass::Refresh).await
    }

    async fn walk(&self, root: PathBuf, depth: i64, max_depth: i64, pass: Pass) -> usize {
        let in_range = |depth: i64| max_depth < 0 || depth <= max_depth;

        let mut queue = VecDeque::from([(root, depth)]);
        let mut jobs: JoinSet<(i64, ScanOutcome)> = JoinSet::new();
        let mut registered = 0;

        loop {
            while jobs.len() < self.max_parallel {
                let Some((dir, depth)) = queue.pop_front() else {
                    break;
                };
                if !in_range(depth) {
                    continue;
                }
                let builder = self.clone();
                let list_children = in_range(depth + 1);
                jobs.spawn(async move { (depth, builder.scan(dir, list_children, pass).await) });
            }

            match jobs.join_next().await {
                Some(Ok((depth, outcome))) => {
                    if outcome.registered {
                        registered += 1;
                    }
                    queue.extend(outcome.children.into_iter().map(|child| (child, depth + 1)));
                }
                Some(Err(err)) => warn!("directory registration task failed: {}", err),
                None => break,
            }
        }

        registered
    }

    /// Fire-and-forget variant of [`refresh_subtree`](Self::refresh_subtree).
    pub fn spawn_subtree(&self, root: PathBuf, depth: i64, max_depth: i64) -> JoinHandle<usize> {
        let builder = self.clone();
        tokio::spawn(async move { builder.refresh_subtree(root, depth, max_depth).await })
    }

    /// Register `dir` again even if it is already in the watch set.
    pub fn spawn_reregister(&self, dir: PathBuf) -> JoinHandle<()> {
        let source = Arc::clone(&self.source);
        let watched = Arc::clone(&self.watched);
        tokio::task::spawn_blocking(move || match source.watch_dir(&dir) {
            Ok(()) => {
                watched.insert(dir);
            }
            Err(err) => warn!(error = %err, "failed to re-register directory"),
        })
    }

    /// Register every target's tree, starting from each target's parent
    /// directory at depth 0. Returns once all of them are done.
    pub async fn register_targets(&self, registry: &TargetRegistry) -> usize {
        let mut builds = JoinSet::new();
        for target in registry.targets() {
            debug!(target = %target.path.display(), depth = target.depth, "registering target tree");
            let builder = self.clone();
            let root = target.watch_root();
            let max_depth = target.depth;
            builds.spawn(async move { builder.register_subtree(root, 0, max_depth).await });
        }

        let mut registered = 0;
        while let Some(result) = builds.join_next().await {
            match result {
                Ok(count) => registered += count,
                Err(err) => warn!("target registration task failed: {}", err),
            }
        }

        info!(
            targets = registry.len(),
            directories = self.watched.len(),
            "watch tree ready"
        );
        registered
    }

    async fn scan(&self, dir: PathBuf, list_children: bool, pass: Pass) -> ScanOutcome {
        let Ok(_permit) = self.permits.clone().acquire_owned().await else {
            return ScanOutcome::default();
        };

        let source = Arc::clone(&self.source);
        let watched = Arc::clone(&self.watched);
        let task_dir = dir.clone();
        let result = tokio::task::spawn_blocking(move || {
            scan_dir(source.as_ref(), &watched, &task_dir, list_children, pass)
        })
        .await;

        match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                warn!(path = %err.path().display(), error = %err, "skipping directory");
                ScanOutcome::default()
            }
            Err(err) => {
                warn!(path = %dir.display(), "directory scan panicked: {}", err);
                ScanOutcome::default()
            }
        }
    }
}

fn scan_dir(
    source: &dyn NotificationSource,
    watched: &WatchSet,
    dir: &Path,
    list_children: bool,
    pass: Pass,
) -> Result<ScanOutcome, RegistrationError> {
    if !dir.is_dir() {
        match pass {
            Pass::Initial => warn!(path = %dir.display(), "not a directory; not registering"),
            // Created files land here too.
            Pass::Refresh => debug!(path = %dir.display(), "not a directory; not registering"),
        }
        return Ok(ScanOutcome::default());
    }

    let registered = watched.insert(dir.to_path_buf());
    if registered || pass == Pass::Refresh {
        if let Err(err) = source.watch_dir(dir) {
            watched.forget(dir);
            return Err(err);
        }
        debug!(path = %dir.display(), "registered directory");
    }

    let mut children = Vec::new();
    if list_children {
        let entries = std::fs::read_dir(dir).map_err(|source| RegistrationError::ReadDir {
            path: dir.to_path_buf(),
            source,
        })?;
        for entry in entries.flatten() {
            // Symlinks are not followed.
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                children.push(entry.path());
            }
        }
    }

    Ok(ScanOutcome {
        registered,
        children,
    })
}
