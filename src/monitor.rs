//! The monitor: owns the target registry, the watch tree and the dedup state,
//! and routes raw notifications to the output sink.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Local};
use tracing::{debug, error, info, warn};

use crate::config::{ErrorPolicy, MonitorConfig};
use crate::error::NotificationSourceError;
use crate::events::{format_line, EventKind, RawEvent};
use crate::registry::{clean_path, TargetRegistry};
use crate::sink::{sink_for, LineSink};
use crate::source::{NotificationStreams, NotifySource};
use crate::tree::TreeBuilder;

/// Why [`Monitor::run`] returned.
#[derive(Debug)]
pub enum StopReason {
    /// The notification source went away.
    EventsClosed,
    /// The notification source failed and the policy is to stop.
    SourceError(NotificationSourceError),
    /// The shutdown future completed.
    Shutdown,
}

pub struct Monitor {
    registry: Arc<TargetRegistry>,
    builder: TreeBuilder,
    sink: Box<dyn LineSink>,
    last_line: Option<String>,
    on_error: ErrorPolicy,
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("targets", &self.registry.len())
            .field("builder", &self.builder)
            .field("last_line", &self.last_line)
            .field("on_error", &self.on_error)
            .finish()
    }
}

impl Monitor {
    pub fn new(
        registry: TargetRegistry,
        builder: TreeBuilder,
        sink: Box<dyn LineSink>,
        on_error: ErrorPolicy,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            builder,
            sink,
            last_line: None,
            on_error,
        }
    }

    /// Build a monitor on top of the native watcher.
    pub fn with_notify(
        registry: TargetRegistry,
        config: &MonitorConfig,
    ) -> Result<(Self, NotificationStreams), NotificationSourceError> {
        let (source, streams) = NotifySource::new()?;
        let builder = TreeBuilder::new(Arc::new(source), config.max_parallel);
        let sink = sink_for(config.output.as_deref());
        Ok((Self::new(registry, builder, sink, config.on_error), streams))
    }

    pub fn registry(&self) -> &TargetRegistry {
        &self.registry
    }

    pub fn builder(&self) -> &TreeBuilder {
        &self.builder
    }

    /// Register every target's directory tree. Returns when all are done.
    pub async fn register_targets(&self) -> usize {
        self.builder.register_targets(&self.registry).await
    }

    /// Route one raw event. Returns the line if one was written.
    ///
    /// Must be called from within a tokio runtime: new directories are
    /// registered on a background task.
    pub fn handle_event(&mut self, event: RawEvent, now: DateTime<Local>) -> Option<String> {
        let kind = EventKind::classify(event.ops)?;
        let path = clean_path(&event.path);
        let found = self.registry.lookup(&path);

        if kind == EventKind::Create {
            if let Some(m) = found.filter(|m| m.in_range()) {
                // An entry `hops` below the target sits at depth `hops + 1`
                // counted from the target's parent. Whether it is a directory
                // is checked on the registration task.
                debug!(path = %path.display(), hops = m.hops, "created entry; extending watch tree");
                self.builder
                    .spawn_subtree(path.clone(), m.hops as i64 + 1, m.target.depth);
            }
        }

        if !found.is_some_and(|m| m.accepts(kind)) {
            return None;
        }

        let line = format_line(&now, kind, &path);
        self.emit(line)
    }

    fn emit(&mut self, line: String) -> Option<String> {
        if self.last_line.as_deref() == Some(line.as_str()) {
            return None;
        }
        if let Err(err) = self.sink.append(&line) {
            error!("{}", err);
            return None;
        }
        self.last_line = Some(line.clone());
        Some(line)
    }

    /// Consume notifications until the source closes, fails (under
    /// [`ErrorPolicy::Stop`]) or `shutdown` completes.
    pub async fn run<F>(mut self, mut streams: NotificationStreams, shutdown: F) -> StopReason
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(targets = self.registry.len(), "monitoring");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    return StopReason::Shutdown;
                }
                event = streams.events.recv() => match event {
                    Some(event) => {
                        debug!(path = %event.path.display(), ops = ?event.ops, "raw event");
                        self.handle_event(event, Local::now());
                    }
                    None => {
                        info!("notification stream closed");
                        return StopReason::EventsClosed;
                    }
                },
                Some(err) = streams.errors.recv() => {
                    error!("{}", err);
                    match self.on_error {
                        ErrorPolicy::Stop => return StopReason::SourceError(err),
                        ErrorPolicy::Continue => self.rewatch(err.paths),
                    }
                }
            }
        }
    }

    fn rewatch(&self, paths: Vec<PathBuf>) {
        for path in paths.into_iter().map(|p| clean_path(&p)) {
            if path.is_dir() {
                warn!(path = %path.display(), "re-registering directory after error");
                self.builder.spawn_reregister(path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OutputSinkError;
    use crate::events::EventMask;
    use crate::registry::Target;
    use crate::sink::MemorySink;
    use crate::source::DryRunSource;
    use chrono::TimeZone;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn monitor(targets: Vec<Target>, source: Arc<DryRunSource>) -> (Monitor, MemorySink) {
        let sink = MemorySink::new();
        let monitor = Monitor::new(
            TargetRegistry::from_targets(targets),
            TreeBuilder::new(source, 4),
            Box::new(sink.clone()),
            ErrorPolicy::Stop,
        );
        (monitor, sink)
    }

    fn at(secs: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 1, 2, 3, 4, secs).unwrap()
    }

    #[tokio::test]
    async fn test_consecutive_duplicates_are_suppressed() {
        let (mut monitor, sink) =
            monitor(vec![Target::new("/a", 1, EventMask::all())], Arc::new(DryRunSource::new()));

        monitor.handle_event(RawEvent::new("/a/x", EventMask::WRITE), at(5));
        monitor.handle_event(RawEvent::new("/a/x", EventMask::WRITE), at(5));

        assert_eq!(sink.lines(), vec!["2024/01/02 03:04:05 WRITE: /a/x".to_string()]);
    }

    #[tokio::test]
    async fn test_non_consecutive_duplicates_are_emitted() {
        let (mut monitor, sink) =
            monitor(vec![Target::new("/a", 1, EventMask::all())], Arc::new(DryRunSource::new()));

        monitor.handle_event(RawEvent::new("/a/x", EventMask::WRITE), at(5));
        monitor.handle_event(RawEvent::new("/a/y", EventMask::WRITE), at(5));
        monitor.handle_event(RawEvent::new("/a/x", EventMask::WRITE), at(5));

        assert_eq!(sink.lines().len(), 3);
    }

    #[tokio::test]
    async fn test_same_path_new_second_is_emitted() {
        let (mut monitor, sink) =
            monitor(vec![Target::new("/a", 0, EventMask::all())], Arc::new(DryRunSource::new()));

        assert!(monitor.handle_event(RawEvent::new("/a", EventMask::PERMISSION), at(1)).is_some());
        assert!(monitor.handle_event(RawEvent::new("/a", EventMask::PERMISSION), at(2)).is_some());
        assert_eq!(sink.lines()[1], "2024/01/02 03:04:02 PERMISSION: /a");
    }

    #[tokio::test]
    async fn test_filters_by_depth_and_mask() {
        let (mut monitor, sink) = monitor(
            vec![Target::new("/etc/passwd", 0, EventMask::WRITE | EventMask::REMOVE)],
            Arc::new(DryRunSource::new()),
        );

        assert!(monitor.handle_event(RawEvent::new("/etc/passwd", EventMask::CREATE), at(1)).is_none());
        assert!(monitor.handle_event(RawEvent::new("/etc/shadow", EventMask::WRITE), at(1)).is_none());
        assert!(monitor.handle_event(RawEvent::new("/etc/passwd/", EventMask::REMOVE), at(1)).is_some());
        assert!(monitor.handle_event(RawEvent::new("/etc/passwd", EventMask::empty()), at(1)).is_none());

        assert_eq!(sink.lines(), vec!["2024/01/02 03:04:01 DELETE: /etc/passwd".to_string()]);
    }

    #[tokio::test]
    async fn test_multi_bit_event_reports_highest_priority() {
        let (mut monitor, _sink) =
            monitor(vec![Target::new("/a", 1, EventMask::all())], Arc::new(DryRunSource::new()));

        let line = monitor
            .handle_event(RawEvent::new("/a/f", EventMask::CREATE | EventMask::WRITE), at(0))
            .unwrap();
        assert!(line.ends_with("WRITE: /a/f"));
    }

    async fn wait_for_registration(source: &DryRunSource, dir: &Path) -> bool {
        for _ in 0..50 {
            if source.registered().iter().any(|d| d == dir) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_created_directory_extends_watch_tree() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let target = temp_dir.path().join("t");
        let new_dir = target.join("sub");
        std::fs::create_dir_all(new_dir.join("deeper")).unwrap();

        let source = Arc::new(DryRunSource::new());
        let (mut monitor, _sink) = monitor(
            vec![Target::new(&target, 2, EventMask::WRITE)],
            source.clone(),
        );

        // Create is not in the mask, but the tree still grows.
        assert!(monitor.handle_event(RawEvent::new(&new_dir, EventMask::CREATE), at(0)).is_none());
        assert!(wait_for_registration(&source, &new_dir).await);
        // sub sits at depth 2 from the target's parent; its children would be 3.
        assert!(!wait_for_registration(&source, &new_dir.join("deeper")).await);
    }

    #[tokio::test]
    async fn test_created_directory_beyond_depth_is_not_registered() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let target = temp_dir.path().join("t");
        let new_dir = target.join("sub");
        std::fs::create_dir_all(&new_dir).unwrap();

        let source = Arc::new(DryRunSource::new());
        let (mut monitor, sink) = monitor(
            vec![Target::new(&target, 1, EventMask::all())],
            source.clone(),
        );

        assert!(monitor.handle_event(RawEvent::new(&new_dir, EventMask::CREATE), at(0)).is_some());
        assert!(!wait_for_registration(&source, &new_dir).await);
        assert_eq!(sink.lines().len(), 1);
    }

    #[tokio::test]
    async fn test_created_sibling_of_target_is_not_registered() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let target = temp_dir.path().join("t");
        let sibling = temp_dir.path().join("other");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::create_dir_all(&sibling).unwrap();

        let source = Arc::new(DryRunSource::new());
        let (mut monitor, sink) = monitor(
            vec![Target::new(&target, -1, EventMask::all())],
            source.clone(),
        );

        assert!(monitor.handle_event(RawEvent::new(&sibling, EventMask::CREATE), at(0)).is_none());
        assert!(!wait_for_registration(&source, &sibling).await);
        assert!(sink.lines().is_empty());
    }

    /// Fails the first append, then records like [`MemorySink`].
    struct FlakySink {
        failed: bool,
        inner: MemorySink,
    }

    impl LineSink for FlakySink {
        fn append(&mut self, line: &str) -> Result<(), OutputSinkError> {
            if !self.failed {
                self.failed = true;
                return Err(OutputSinkError::Stdout(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "broken pipe",
                )));
            }
            self.inner.append(line)
        }
    }

    fn flaky_monitor(targets: Vec<Target>) -> (Monitor, MemorySink) {
        let lines = MemorySink::new();
        let monitor = Monitor::new(
            TargetRegistry::from_targets(targets),
            TreeBuilder::new(Arc::new(DryRunSource::new()), 2),
            Box::new(FlakySink {
                failed: false,
                inner: lines.clone(),
            }),
            ErrorPolicy::Stop,
        );
        (monitor, lines)
    }

    #[tokio::test]
    async fn test_failed_write_does_not_count_for_dedup() {
        let (mut monitor, lines) = flaky_monitor(vec![Target::new("/a", 1, EventMask::all())]);

        assert!(monitor.handle_event(RawEvent::new("/a/x", EventMask::WRITE), at(5)).is_none());
        assert!(monitor.handle_event(RawEvent::new("/a/x", EventMask::WRITE), at(5)).is_some());
        assert_eq!(lines.lines(), vec!["2024/01/02 03:04:05 WRITE: /a/x".to_string()]);
    }

    #[tokio::test]
    async fn test_run_keeps_going_after_sink_error() {
        let (monitor, lines) = flaky_monitor(vec![Target::new("/a", 1, EventMask::all())]);
        let (event_tx, _error_tx, streams) = streams();

        event_tx.send(RawEvent::new("/a/x", EventMask::WRITE)).unwrap();
        event_tx.send(RawEvent::new("/a/y", EventMask::REMOVE)).unwrap();
        drop(event_tx);

        let reason = tokio::time::timeout(
            Duration::from_secs(2),
            monitor.run(streams, std::future::pending()),
        )
        .await
        .expect("monitor did not stop");
        assert!(matches!(reason, StopReason::EventsClosed));
        assert_eq!(lines.lines().len(), 1);
        assert!(lines.lines()[0].ends_with("DELETE: /a/y"));
    }

    fn streams() -> (
        mpsc::UnboundedSender<RawEvent>,
        mpsc::UnboundedSender<NotificationSourceError>,
        NotificationStreams,
    ) {
        let (event_tx, events) = mpsc::unbounded_channel();
        let (error_tx, errors) = mpsc::unbounded_channel();
        (event_tx, error_tx, NotificationStreams { events, errors })
    }

    fn source_error(path: &str) -> NotificationSourceError {
        NotificationSourceError {
            message: "queue overflow".to_string(),
            paths: vec![PathBuf::from(path)],
        }
    }

    #[tokio::test]
    async fn test_run_stops_on_source_error() {
        let (monitor, sink) =
            monitor(vec![Target::new("/a", 1, EventMask::all())], Arc::new(DryRunSource::new()));
        let (event_tx, error_tx, streams) = streams();

        event_tx.send(RawEvent::new("/a/x", EventMask::WRITE)).unwrap();
        let handle = tokio::spawn(monitor.run(streams, std::future::pending()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        error_tx.send(source_error("/a")).unwrap();

        let reason = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("monitor did not stop")
            .unwrap();
        assert!(matches!(reason, StopReason::SourceError(_)));
        assert_eq!(sink.lines().len(), 1);
    }

    #[tokio::test]
    async fn test_run_continues_after_error_when_configured() {
        let sink = MemorySink::new();
        let monitor = Monitor::new(
            TargetRegistry::from_targets([Target::new("/a", 1, EventMask::all())]),
            TreeBuilder::new(Arc::new(DryRunSource::new()), 2),
            Box::new(sink.clone()),
            ErrorPolicy::Continue,
        );
        let (event_tx, error_tx, streams) = streams();

        error_tx.send(source_error("/nonexistent-dir")).unwrap();
        let handle = tokio::spawn(monitor.run(streams, std::future::pending()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        event_tx.send(RawEvent::new("/a/x", EventMask::REMOVE)).unwrap();
        drop(event_tx);

        let reason = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("monitor did not stop")
            .unwrap();
        assert!(matches!(reason, StopReason::EventsClosed));
        assert_eq!(sink.lines().len(), 1);
        drop(error_tx);
    }

    #[tokio::test]
    async fn test_run_honours_shutdown() {
        let (monitor, _sink) =
            monitor(vec![Target::new("/a", 0, EventMask::all())], Arc::new(DryRunSource::new()));
        let (_event_tx, _error_tx, streams) = streams();

        let reason = tokio::time::timeout(
            Duration::from_secs(2),
            monitor.run(streams, tokio::time::sleep(Duration::from_millis(20))),
        )
        .await
        .expect("monitor did not stop");
        assert!(matches!(reason, StopReason::Shutdown));
    }
}
