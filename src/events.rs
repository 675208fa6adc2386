use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use bitflags::bitflags;
use chrono::{DateTime, TimeZone};
use notify::event::{ModifyKind, RenameMode};

use crate::error::ConfigError;

bitflags! {
    /// Set of event kinds. Used both for a target's configured filter and for
    /// the raw operation bits reported with a change.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventMask: u8 {
        const CREATE = 1 << 0;
        const REMOVE = 1 << 1;
        const RENAME = 1 << 2;
        const WRITE = 1 << 3;
        const PERMISSION = 1 << 4;
    }
}

impl Default for EventMask {
    fn default() -> Self {
        EventMask::all()
    }
}

impl EventMask {
    /// Parse a pipe-delimited list such as `create|write`.
    ///
    /// Empty tokens are ignored, so `""` yields an empty mask.
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        value
            .split('|')
            .filter(|token| !token.trim().is_empty())
            .try_fold(EventMask::empty(), |mask, token| {
                Ok(mask | token.parse::<EventKind>()?.flag())
            })
    }

    pub fn contains_kind(self, kind: EventKind) -> bool {
        self.contains(kind.flag())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Create,
    Remove,
    Rename,
    Write,
    PermissionChange,
}

impl EventKind {
    /// When a change carries several operation bits, the first kind in this
    /// order is the one reported.
    pub const PRIORITY: [EventKind; 5] = [
        EventKind::Write,
        EventKind::Create,
        EventKind::Remove,
        EventKind::Rename,
        EventKind::PermissionChange,
    ];

    pub fn flag(self) -> EventMask {
        match self {
            EventKind::Create => EventMask::CREATE,
            EventKind::Remove => EventMask::REMOVE,
            EventKind::Rename => EventMask::RENAME,
            EventKind::Write => EventMask::WRITE,
            EventKind::PermissionChange => EventMask::PERMISSION,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            EventKind::Create => "CREATE",
            EventKind::Remove => "DELETE",
            EventKind::Rename => "RENAME",
            EventKind::Write => "WRITE",
            EventKind::PermissionChange => "PERMISSION",
        }
    }

    pub fn classify(ops: EventMask) -> Option<EventKind> {
        Self::PRIORITY
            .into_iter()
            .find(|kind| ops.contains(kind.flag()))
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for EventKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "create" => Ok(EventKind::Create),
            "delete" | "remove" => Ok(EventKind::Remove),
            "rename" => Ok(EventKind::Rename),
            "write" => Ok(EventKind::Write),
            "permission" => Ok(EventKind::PermissionChange),
            _ => Err(ConfigError::UnknownEventKind(s.to_string())),
        }
    }
}

/// A change notification for a single path, before any target matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub path: PathBuf,
    pub ops: EventMask,
}

impl RawEvent {
    pub fn new(path: impl Into<PathBuf>, ops: EventMask) -> Self {
        Self {
            path: path.into(),
            ops,
        }
    }

    /// Split a `notify` event into one raw event per affected path.
    ///
    /// Renames follow the inotify convention: the old name is reported as a
    /// rename and the new name as a create. The paired `RenameMode::Both`
    /// event repeats the two halves and is dropped.
    pub fn from_notify(event: &notify::Event) -> Vec<RawEvent> {
        use notify::EventKind as Kind;

        let ops = match event.kind {
            Kind::Create(_) => EventMask::CREATE,
            Kind::Remove(_) => EventMask::REMOVE,
            Kind::Modify(ModifyKind::Name(RenameMode::To)) => EventMask::CREATE,
            Kind::Modify(ModifyKind::Name(RenameMode::Both)) => return Vec::new(),
            Kind::Modify(ModifyKind::Name(_)) => EventMask::RENAME,
            Kind::Modify(ModifyKind::Metadata(_)) => EventMask::PERMISSION,
            Kind::Modify(_) => EventMask::WRITE,
            Kind::Access(_) | Kind::Any | Kind::Other => EventMask::empty(),
        };

        if ops.is_empty() {
            return Vec::new();
        }

        event
            .paths
            .iter()
            .map(|path| RawEvent::new(path.clone(), ops))
            .collect()
    }
}

/// Render an output line: `YYYY/MM/DD HH:MM:SS KIND: path`.
pub fn format_line<Tz>(timestamp: &DateTime<Tz>, kind: EventKind, path: &Path) -> String
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    format!(
        "{} {}: {}",
        timestamp.format("%Y/%m/%d %H:%M:%S"),
        kind.label(),
        path.display()
    )
}
