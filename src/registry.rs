//! Configured watch targets and ancestor matching.
//!
//! The notification layer only reports on directories that were registered
//! one by one, so a changed path carries no information about which target
//! it belongs to. [`TargetRegistry::lookup`] recovers that by walking up the
//! path until it reaches a configured target; the number of steps taken is
//! then checked against the target's depth bound.

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};

use crate::error::ConfigError;
use crate::events::{EventKind, EventMask};

/// One configuration entry as read from the config file, values unparsed.
pub type RawRecord = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub path: PathBuf,
    /// Levels below `path` that still belong to this target. Negative means
    /// unbounded.
    pub depth: i64,
    pub events: EventMask,
}

impl Target {
    pub fn new(path: impl AsRef<Path>, depth: i64, events: EventMask) -> Self {
        Self {
            path: clean_path(path.as_ref()),
            depth,
            events,
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.depth < 0
    }

    /// Whether a path `hops` levels below this target is still in range.
    pub fn allows_hops(&self, hops: usize) -> bool {
        self.is_unbounded() || (hops as i64) <= self.depth
    }

    /// Directory where registration for this target starts.
    ///
    /// A target may be a plain file, so registration always begins at its
    /// parent; changes to the target itself are reported by that directory.
    pub fn watch_root(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => self.path.clone(),
        }
    }
}

/// Result of an ancestor walk: the nearest configured target and how many
/// levels above the changed path it was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetMatch<'a> {
    pub target: &'a Target,
    pub hops: usize,
}

impl TargetMatch<'_> {
    pub fn in_range(&self) -> bool {
        self.target.allows_hops(self.hops)
    }

    pub fn accepts(&self, kind: EventKind) -> bool {
        self.in_range() && self.target.events.contains_kind(kind)
    }
}

/// Immutable index from cleaned target path to its target.
///
/// Built once at startup and then only read, so it is shared behind an `Arc`
/// without locking.
#[derive(Debug, Clone, Default)]
pub struct TargetRegistry {
    index: HashMap<PathBuf, Target>,
}

impl TargetRegistry {
    /// Resolve raw records, treating relative paths as relative to the
    /// current directory.
    pub fn resolve(records: &[RawRecord]) -> Result<Self, ConfigError> {
        let base = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::resolve_in(records, &base)
    }

    /// Resolve raw records against `base`.
    ///
    /// - `path` is required.
    /// - `depth` defaults to 0 and must be an integer.
    /// - `events` defaults to every kind; otherwise a `|` separated list.
    ///
    /// A later record for the same path replaces an earlier one.
    pub fn resolve_in(records: &[RawRecord], base: &Path) -> Result<Self, ConfigError> {
        let mut registry = Self::default();

        for (i, record) in records.iter().enumerate() {
            let index = i + 1;

            let path = match record.get("path").map(|p| p.trim()) {
                Some(p) if !p.is_empty() => base.join(p),
                _ => return Err(ConfigError::MissingPath { index }),
            };

            let depth = match record.get("depth") {
                Some(value) => value
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| ConfigError::InvalidDepth {
                        index,
                        value: value.clone(),
                    })?,
                None => 0,
            };

            let events = match record.get("events") {
                Some(value) => EventMask::parse(value).map_err(|err| match err {
                    ConfigError::UnknownEventKind(token) => ConfigError::InvalidEvents {
                        index,
                        token,
                        value: value.clone(),
                    },
                    other => other,
                })?,
                None => EventMask::all(),
            };

            registry.insert(Target::new(path, depth, events));
        }

        Ok(registry)
    }

    pub fn from_targets(targets: impl IntoIterator<Item = Target>) -> Self {
        let mut registry = Self::default();
        for target in targets {
            registry.insert(target);
        }
        registry
    }

    fn insert(&mut self, target: Target) {
        if let Some(previous) = self.index.insert(target.path.clone(), target) {
            tracing::debug!(path = %previous.path.display(), "target redefined; later entry wins");
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn get(&self, path: &Path) -> Option<&Target> {
        self.index.get(path)
    }

    /// Targets ordered by path.
    pub fn targets(&self) -> Vec<&Target> {
        let mut targets: Vec<&Target> = self.index.values().collect();
        targets.sort_by(|a, b| a.path.cmp(&b.path));
        targets
    }

    /// Walk from `path` up through its ancestors and return the first one that
    /// is a configured target.
    pub fn lookup(&self, path: &Path) -> Option<TargetMatch<'_>> {
        let mut current = path;
        let mut hops = 0;
        loop {
            if let Some(target) = self.index.get(current) {
                return Some(TargetMatch { target, hops });
            }
            current = current.parent()?;
            hops += 1;
        }
    }

    /// True if `path` belongs to a target within its depth bound and that
    /// target's mask includes `kind`.
    pub fn matches(&self, path: &Path, kind: EventKind) -> bool {
        self.lookup(path).is_some_and(|m| m.accepts(kind))
    }
}

/// Lexically clean a path: drop `.` segments and trailing separators and
/// fold `..` into its parent. Symlinks are not resolved.
pub fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(out.components().next_back(), Some(Component::Normal(_))) {
                    out.pop();
                } else if !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}
