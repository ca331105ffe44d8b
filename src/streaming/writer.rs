use std::sync::{Arc, Mutex, PoisonError};

use crate::model::{ErrorCategory, ExecutionOutput, OutputKind};
use crate::output::{classify, Admission, OutputQuota};
use crate::streaming::OutputSink;

/// A session-scoped replacement for a program's stdout or stderr.
pub trait ConsoleWriter: Send + Sync {
    fn write(&self, text: &str);

    fn write_line(&self, text: &str) {
        self.write(text);
        self.write("\n");
    }

    /// Emit whatever is still buffered.
    fn flush(&self);
}

#[derive(Debug, Clone, Copy)]
enum LineMode {
    /// Content sniffed per flush.
    Classified,
    Plain {
        kind: OutputKind,
        category: Option<ErrorCategory>,
    },
}

struct LineState {
    buffer: String,
    quota: Option<OutputQuota>,
}

/// Buffers characters and emits one entry per line, or per write in immediate mode.
pub struct LineWriter {
    sink: Arc<dyn OutputSink>,
    mode: LineMode,
    immediate: bool,
    state: Mutex<LineState>,
}

impl LineWriter {
    fn with(sink: Arc<dyn OutputSink>, mode: LineMode, immediate: bool, quota: Option<OutputQuota>) -> Self {
        Self {
            sink,
            mode,
            immediate,
            state: Mutex::new(LineState {
                buffer: String::new(),
                quota,
            }),
        }
    }

    /// Stdout of a batch execution: classified and held to `max_output_bytes`.
    pub fn batch(sink: Arc<dyn OutputSink>, max_output_bytes: usize) -> Self {
        Self::with(
            sink,
            LineMode::Classified,
            false,
            Some(OutputQuota::new(max_output_bytes)),
        )
    }

    /// Stdout of a streaming execution that does not need per-character echo.
    pub fn text(sink: Arc<dyn OutputSink>) -> Self {
        Self::with(
            sink,
            LineMode::Plain {
                kind: OutputKind::Text,
                category: None,
            },
            false,
            None,
        )
    }

    /// Stderr of any execution.
    pub fn errors(sink: Arc<dyn OutputSink>, immediate: bool) -> Self {
        Self::with(
            sink,
            LineMode::Plain {
                kind: OutputKind::RuntimeError,
                category: Some(ErrorCategory::RuntimeError),
            },
            immediate,
            None,
        )
    }

    /// Emit one entry. Classified content that grows when pretty-printed is
    /// charged to the quota, or recorded as written when it does not fit.
    fn emit(&self, content: &str, quota: Option<&mut OutputQuota>) {
        let output = match self.mode {
            LineMode::Classified => {
                let mut output = classify(content);
                let raw = content.trim_end();
                let extra = output.content.len().saturating_sub(raw.len());
                if extra > 0 && !quota.map_or(true, |q| q.charge(extra)) {
                    output.content = raw.to_string();
                }
                output
            }
            LineMode::Plain { kind, category } => {
                let content = content.trim_end();
                if kind.is_error() && content.is_empty() {
                    return;
                }
                match category {
                    Some(category) => ExecutionOutput::failure(kind, category, content),
                    None => ExecutionOutput::new(kind, content),
                }
            }
        };
        self.sink.emit(output);
    }
}

impl ConsoleWriter for LineWriter {
    fn write(&self, text: &str) {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let state = &mut *guard;

        let (admitted, truncated) = match state.quota.as_mut().map(|q| q.admit(text)) {
            None => (text, false),
            Some(Admission::Accepted(chunk)) => (chunk, false),
            Some(Admission::Truncated(chunk)) => (chunk, true),
            Some(Admission::Rejected) => return,
        };
        state.buffer.push_str(admitted);

        if !self.immediate {
            while let Some(pos) = state.buffer.find('\n') {
                let line: String = state.buffer.drain(..=pos).collect();
                self.emit(&line, state.quota.as_mut());
            }
        }
        if self.immediate || truncated {
            let pending = std::mem::take(&mut state.buffer);
            if !pending.is_empty() {
                self.emit(&pending, state.quota.as_mut());
            }
        }

        if truncated {
            if let Some(quota) = &state.quota {
                self.sink.emit(quota.notice());
            }
        }
    }

    fn flush(&self) {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let state = &mut *guard;
        let pending = std::mem::take(&mut state.buffer);
        if !pending.is_empty() {
            self.emit(&pending, state.quota.as_mut());
        }
    }
}

/// Emits one entry per character for the lowest-latency echo.
pub struct CharWriter {
    sink: Arc<dyn OutputSink>,
}

impl CharWriter {
    pub fn new(sink: Arc<dyn OutputSink>) -> Self {
        Self { sink }
    }
}

impl ConsoleWriter for CharWriter {
    fn write(&self, text: &str) {
        for c in text.chars() {
            self.sink.emit(ExecutionOutput::character(c));
        }
    }

    fn flush(&self) {}
}
