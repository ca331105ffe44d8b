use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, RunpadError};
use crate::model::ExecutionOutput;
use crate::streaming::OutputSink;

/// A session-scoped replacement for a program's stdin.
#[async_trait]
pub trait InputSource: Send + Sync {
    /// Read one line, without its terminator.
    async fn read_line(&self) -> Result<String>;

    /// Whether a live client can answer reads.
    fn is_interactive(&self) -> bool {
        true
    }
}

/// Stdin of a batch execution: there is nobody to ask.
pub struct BatchInput;

#[async_trait]
impl InputSource for BatchInput {
    async fn read_line(&self) -> Result<String> {
        Err(RunpadError::InteractiveModeRequired)
    }

    fn is_interactive(&self) -> bool {
        false
    }
}

/// Stdin of a streaming execution, fed through the session registry.
pub struct StreamingInput {
    session_id: String,
    receiver: Mutex<mpsc::Receiver<String>>,
    cancel: CancellationToken,
    sink: Arc<dyn OutputSink>,
    timeout: Option<Duration>,
}

impl StreamingInput {
    pub fn new(
        session_id: impl Into<String>,
        receiver: mpsc::Receiver<String>,
        cancel: CancellationToken,
        sink: Arc<dyn OutputSink>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            receiver: Mutex::new(receiver),
            cancel,
            sink,
            timeout: None,
        }
    }

    /// Give up on a read after `timeout`; `None` waits until the session is cancelled.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn cancelled(&self) -> RunpadError {
        RunpadError::InputCancelled {
            id: self.session_id.clone(),
        }
    }
}

#[async_trait]
impl InputSource for StreamingInput {
    async fn read_line(&self) -> Result<String> {
        self.sink.emit(ExecutionOutput::input_request());
        debug!(session = %self.session_id, "Waiting for input");

        let mut receiver = self.receiver.lock().await;
        let wait = async {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(self.cancelled()),
                line = receiver.recv() => line.ok_or_else(|| self.cancelled()),
            }
        };

        let line = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| RunpadError::InputTimeout {
                    seconds: limit.as_secs(),
                })??,
            None => wait.await?,
        };

        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}
