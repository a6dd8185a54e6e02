//! Log event stream scanning
//!
//! The engine subscribes to the installer's syslog-tagged log stream for
//! the lifetime of a run and scans it for Python-style tracebacks emitted
//! by the external tool. When a run fails, the captured excerpt is
//! attached to the failure report so the diagnostic carries the tool's
//! own stack trace, not just our summary of it.

use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// One line from the log event source.
#[derive(Debug, Clone)]
pub struct LogEvent {
    /// Syslog identifier the line was tagged with.
    pub syslog_id: String,
    /// The log line itself.
    pub message: String,
}

/// Collects the first traceback seen on the log stream.
///
/// A traceback starts at the canonical
/// `Traceback (most recent call last):` marker and runs through the first
/// line that resumes at column zero (the exception line itself).
#[derive(Debug, Default)]
pub struct TracebackExtractor {
    traceback: Vec<String>,
    in_traceback: bool,
}

impl TracebackExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one log line to the scanner.
    pub fn feed(&mut self, line: &str) {
        let resumes_at_column_zero = line.chars().next().is_some_and(|c| !c.is_whitespace());

        if self.traceback.is_empty() && line.starts_with("Traceback (most recent call last):") {
            self.in_traceback = true;
        } else if self.in_traceback && resumes_at_column_zero {
            self.traceback.push(line.to_string());
            self.in_traceback = false;
        }
        if self.in_traceback {
            self.traceback.push(line.to_string());
        }
    }

    /// The captured traceback lines, empty if none was seen.
    pub fn traceback(&self) -> &[String] {
        &self.traceback
    }

    /// The captured traceback as one newline-joined excerpt.
    pub fn excerpt(&self) -> Option<String> {
        if self.traceback.is_empty() {
            None
        } else {
            Some(self.traceback.join("\n"))
        }
    }
}

/// Subscribe a traceback extractor to a log event stream.
///
/// Spawns a listener thread that feeds every line tagged with `syslog_id`
/// into the shared extractor until the sending side closes.
pub fn subscribe(
    events: Receiver<LogEvent>,
    syslog_id: String,
    extractor: Arc<Mutex<TracebackExtractor>>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        for event in events {
            if event.syslog_id != syslog_id {
                continue;
            }
            if let Ok(mut extractor) = extractor.lock() {
                extractor.feed(&event.message);
            }
        }
        tracing::debug!("log event stream closed");
    })
}
