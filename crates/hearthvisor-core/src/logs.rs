use crate::process::OutputStream;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use tokio_stream::StreamExt;

/// Which pipe a captured line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Stdout,
    Stderr,
}

impl std::fmt::Display for OutputKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputKind::Stdout => f.write_str("stdout"),
            OutputKind::Stderr => f.write_str("stderr"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    pub at: DateTime<Utc>,
    pub stream: OutputKind,
    pub text: String,
}

impl std::fmt::Display for LogLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.at.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            self.stream,
            self.text
        )
    }
}

/// Bounded buffer of the most recent output lines of one service
#[derive(Debug)]
pub struct LogBuffer {
    capacity: usize,
    lines: Mutex<VecDeque<LogLine>>,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            lines: Mutex::new(VecDeque::with_capacity(capacity.min(1_024))),
        }
    }

    pub fn push(&self, stream: OutputKind, text: impl Into<String>) {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(LogLine {
            at: Utc::now(),
            stream,
            text: text.into(),
        });
    }

    /// Up to `count` most recent lines, oldest first
    pub fn tail(&self, count: usize) -> Vec<LogLine> {
        let lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = lines.len().saturating_sub(count);
        lines.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Drain a child's output into `buffer` until the pipe closes
pub async fn capture(mut output: OutputStream, kind: OutputKind, service: String, buffer: &LogBuffer) {
    while let Some(line) = output.next().await {
        tracing::debug!(target: "hearthvisor::output", service = %service, stream = %kind, "{line}");
        buffer.push(kind, line);
    }
}
