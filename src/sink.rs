use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::OutputSinkError;

/// Destination for emitted event lines.
pub trait LineSink: Send {
    /// Append `line` followed by a newline.
    fn append(&mut self, line: &str) -> Result<(), OutputSinkError>;
}

#[derive(Debug, Default)]
pub struct StdoutSink;

impl LineSink for StdoutSink {
    fn append(&mut self, line: &str) -> Result<(), OutputSinkError> {
        let stdout = std::io::stdout();
        let mut handle = stdout.lock();
        writeln!(handle, "{}", line)
            .and_then(|_| handle.flush())
            .map_err(OutputSinkError::Stdout)
    }
}

/// Appends to a file, creating it if needed. The file is reopened for every
/// line so external rotation is picked up.
#[derive(Debug, Clone)]
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LineSink for FileSink {
    fn append(&mut self, line: &str) -> Result<(), OutputSinkError> {
        let to_err = |source| OutputSinkError::File {
            path: self.path.clone(),
            source,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(to_err)?;
        writeln!(file, "{}", line).map_err(to_err)
    }
}

/// Keeps lines in memory; clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        match self.lines.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl LineSink for MemorySink {
    fn append(&mut self, line: &str) -> Result<(), OutputSinkError> {
        match self.lines.lock() {
            Ok(mut guard) => guard.push(line.to_string()),
            Err(poisoned) => poisoned.into_inner().push(line.to_string()),
        }
        Ok(())
    }
}

/// Pick the sink for an optional output path.
pub fn sink_for(output: Option<&Path>) -> Box<dyn LineSink> {
    match output {
        Some(path) => Box::new(FileSink::new(path)),
        None => Box::new(StdoutSink),
    }
}
