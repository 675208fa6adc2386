use std::path::{Path, PathBuf};
use std::sync::Mutex;

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::{self, UnboundedReceiver};

use crate::error::{NotificationSourceError, RegistrationError};
use crate::events::RawEvent;

/// Something that can be told to watch a single directory.
///
/// Registration is never recursive: changes are only reported for the
/// directory's immediate entries. Calls may block and may come from several
/// threads at once.
pub trait NotificationSource: Send + Sync + 'static {
    fn watch_dir(&self, dir: &Path) -> Result<(), RegistrationError>;
}

/// Receiving ends of a notification source.
pub struct NotificationStreams {
    pub events: UnboundedReceiver<RawEvent>,
    pub errors: UnboundedReceiver<NotificationSourceError>,
}

/// Native watcher backed by `notify`.
pub struct NotifySource {
    watcher: Mutex<RecommendedWatcher>,
}

impl std::fmt::Debug for NotifySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifySource").finish()
    }
}

impl NotifySource {
    pub fn new() -> Result<(Self, NotificationStreams), NotificationSourceError> {
        let (event_tx, event_rx) = mpsc::unbounded_channel::<RawEvent>();
        let (error_tx, error_rx) = mpsc::unbounded_channel::<NotificationSourceError>();

        // Called synchronously on notify's own thread.
        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for raw in RawEvent::from_notify(&event) {
                    if event_tx.send(raw).is_err() {
                        return; // Receiver dropped
                    }
                }
            }
            Err(err) => {
                let _ = error_tx.send(err.into());
            }
        })?;

        Ok((
            Self {
                watcher: Mutex::new(watcher),
            },
            NotificationStreams {
                events: event_rx,
                errors: error_rx,
            },
        ))
    }
}

impl NotificationSource for NotifySource {
    fn watch_dir(&self, dir: &Path) -> Result<(), RegistrationError> {
        let mut watcher = self.watcher.lock().map_err(|_| RegistrationError::Watch {
            path: dir.to_path_buf(),
            source: notify::Error::generic("watcher mutex poisoned"),
        })?;

        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|source| RegistrationError::Watch {
                path: dir.to_path_buf(),
                source,
            })
    }
}

/// Source that only records what it was asked to watch.
///
/// Used by `--check` to show the directories a configuration would register.
#[derive(Debug, Default)]
pub struct DryRunSource {
    registered: Mutex<Vec<PathBuf>>,
}

impl DryRunSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded directories, sorted.
    pub fn registered(&self) -> Vec<PathBuf> {
        let mut dirs = match self.registered.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        dirs.sort();
        dirs
    }
}

impl NotificationSource for DryRunSource {
    fn watch_dir(&self, dir: &Path) -> Result<(), RegistrationError> {
        match self.registered.lock() {
            Ok(mut guard) => guard.push(dir.to_path_buf()),
            Err(poisoned) => poisoned.into_inner().push(dir.to_path_buf()),
        }
        Ok(())
    }
}
