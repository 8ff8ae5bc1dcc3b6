//! Failure and output sinks (spec sections 2, 6, 7).
//!
//! The failure sink writes one line per FAILED task — the literal original
//! `args`, verbatim, in *completion* order, matching the streaming-pipeline
//! semantics spec section 5 calls out deliberately. This mirrors the
//! teacher's `AuditLogger`: a buffered writer behind a mutex, append-only.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to open sink target: {0}")]
    Open(#[from] io::Error),
}

enum Target {
    Stdout,
    Stderr,
    File(BufWriter<File>),
}

/// A single append-only line destination. Used for both the failure sink
/// (`-f/--failed`) and the output sink (`-o/--output`).
pub struct LineSink {
    target: Mutex<Target>,
}

impl LineSink {
    pub fn stdout() -> Self {
        Self { target: Mutex::new(Target::Stdout) }
    }

    pub fn stderr() -> Self {
        Self { target: Mutex::new(Target::Stderr) }
    }

    pub fn open_file(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { target: Mutex::new(Target::File(BufWriter::new(file))) })
    }

    /// Append `line` followed by a newline and flush immediately, so a
    /// reader tailing the file sees results as they complete.
    pub fn write_line(&self, line: &str) -> Result<(), SinkError> {
        let mut target = self.target.lock().expect("sink mutex poisoned");
        match &mut *target {
            Target::Stdout => {
                let mut out = io::stdout();
                writeln!(out, "{line}")?;
                out.flush()?;
            }
            Target::Stderr => {
                let mut err = io::stderr();
                writeln!(err, "{line}")?;
                err.flush()?;
            }
            Target::File(writer) => {
                writeln!(writer, "{line}")?;
                writer.flush()?;
            }
        }
        Ok(())
    }
}

/// An event handed to the sink writer task as a task completes (spec
/// section 5: "the failure sink writes failed command lines in completion
/// order, not submission order").
#[derive(Debug, Clone)]
pub enum SinkEvent {
    Failed { args: String },
    Output { task_id: u64, stdout: Vec<u8>, stderr: Vec<u8> },
}

/// The single sink-writer task consuming both the failure and output
/// channels (spec section 5).
pub async fn run_sink_writer(
    mut events: mpsc::Receiver<SinkEvent>,
    failure_sink: Option<LineSink>,
    output_sink: Option<LineSink>,
) {
    while let Some(event) = events.recv().await {
        match event {
            SinkEvent::Failed { args } => {
                if let Some(sink) = &failure_sink {
                    if let Err(e) = sink.write_line(&args) {
                        error!(error = %e, "failed to write failure sink line");
                    }
                }
            }
            SinkEvent::Output { task_id, stdout, stderr } => {
                if let Some(sink) = &output_sink {
                    let rendered = String::from_utf8_lossy(&stdout);
                    for line in rendered.lines() {
                        if let Err(e) = sink.write_line(line) {
                            error!(error = %e, "failed to write output sink line");
                        }
                    }
                    if !stderr.is_empty() {
                        info!(task_id, stderr_bytes = stderr.len(), "task captured stderr");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_one_line_per_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failed.txt");
        let sink = LineSink::open_file(&path).unwrap();
        sink.write_line("false").unwrap();
        sink.write_line("false").unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "false\nfalse\n");
    }

    #[tokio::test]
    async fn sink_writer_preserves_completion_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failed.txt");
        let sink = LineSink::open_file(&path).unwrap();
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(run_sink_writer(rx, Some(sink), None));

        tx.send(SinkEvent::Failed { args: "b".into() }).await.unwrap();
        tx.send(SinkEvent::Failed { args: "a".into() }).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "b\na\n");
    }
}
