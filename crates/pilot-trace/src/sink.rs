//! Durable sinks for the trace

use crate::error::TraceError;
use crate::event::TraceEvent;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Destination that must accept an event before it is committed
pub trait TraceSink: Send + Sync {
    /// Persist one event
    ///
    /// # Errors
    /// Any error aborts the append.
    fn write(&self, event: &TraceEvent) -> Result<(), TraceError>;
}

/// One JSON document per line, written and flushed per event
///
/// A record is written with a single buffer so a failed append never
/// leaves a line without its newline; the file is truncated back to its
/// previous length when the write fails part way.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlSink {
    /// Open (or create) a log file in append mode
    ///
    /// # Errors
    /// I/O errors from opening the file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TraceError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Backing file path
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TraceSink for JsonlSink {
    fn write(&self, event: &TraceEvent) -> Result<(), TraceError> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let mut file = self.file.lock();
        append_record(&mut file, &line)
    }
}

fn append_record(file: &mut File, line: &[u8]) -> Result<(), TraceError> {
    let len = file.metadata()?.len();
    match file.write_all(line).and_then(|()| file.flush()) {
        Ok(()) => Ok(()),
        Err(err) => {
            if let Err(truncate) = file.set_len(len) {
                tracing::warn!(error = %truncate, "could not roll back partial trace record");
            }
            Err(err.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{TraceDraft, TraceKind};
    use crate::recorder::TraceRecorder;

    #[test]
    fn jsonl_sink_writes_one_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.jsonl");
        let recorder = TraceRecorder::with_sink(Box::new(JsonlSink::open(&path).unwrap()));

        recorder
            .record(TraceDraft::new("DiscoveryAgent", TraceKind::Action).output("Identified 3 migration targets"))
            .unwrap();
        recorder
            .record(TraceDraft::new("PlanningAgent", TraceKind::Action))
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: TraceEvent = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(first.output, "Identified 3 migration targets");
    }

    #[test]
    fn every_record_ends_with_its_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.jsonl");
        let sink = JsonlSink::open(&path).unwrap();
        let recorder = TraceRecorder::with_sink(Box::new(sink));
        for i in 0..3 {
            recorder
                .record(TraceDraft::new("CodingAgent", TraceKind::Action).input(format!("step {i}")))
                .unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.ends_with('\n'));
        assert_eq!(contents.matches('\n').count(), 3);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn failed_append_is_not_committed() {
        let sink = JsonlSink::open("/dev/full").unwrap();
        let recorder = TraceRecorder::with_sink(Box::new(sink));

        let result = recorder.record(TraceDraft::new("x", TraceKind::Action));
        assert!(matches!(result, Err(TraceError::Io(_))));
        assert!(recorder.is_empty());
    }

    struct RejectingSink;

    impl TraceSink for RejectingSink {
        fn write(&self, _event: &TraceEvent) -> Result<(), TraceError> {
            Err(TraceError::Sink("read-only volume".to_string()))
        }
    }

    #[test]
    fn failed_sink_write_commits_nothing() {
        let recorder = TraceRecorder::with_sink(Box::new(RejectingSink));
        let result = recorder.record(TraceDraft::new("x", TraceKind::Action));
        assert!(matches!(result, Err(TraceError::Sink(_))));
        assert!(recorder.is_empty());
    }
}
