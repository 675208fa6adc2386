pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod monitor;
pub mod registry;
pub mod sink;
pub mod source;
pub mod tree;

pub use config::{ErrorPolicy, MonitorConfig};
pub use error::{ConfigError, NotificationSourceError, OutputSinkError, RegistrationError};
pub use events::{EventKind, EventMask, RawEvent};
pub use monitor::{Monitor, StopReason};
pub use registry::{RawRecord, Target, TargetMatch, TargetRegistry};
pub use sink::{FileSink, LineSink, MemorySink, StdoutSink};
pub use source::{DryRunSource, NotificationSource, NotificationStreams, NotifySource};
pub use tree::{TreeBuilder, WatchSet};
