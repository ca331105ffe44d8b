use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;

use crate::model::{ExecutionOutput, ExecutionResult, OutputKind, META_PATH, META_SIZE};
use crate::storage::ArtifactSink;
use crate::streaming::{OutputSink, StreamEvent};

#[derive(Default)]
struct LogState {
    outputs: Vec<ExecutionOutput>,
    files: Vec<String>,
}

/// The "current result" of one execution: every output and artifact in order,
/// optionally mirrored live onto a session channel.
#[derive(Default)]
pub struct ResultLog {
    state: Mutex<LogState>,
    events: Option<broadcast::Sender<StreamEvent>>,
}

impl ResultLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn broadcasting(events: broadcast::Sender<StreamEvent>) -> Self {
        Self {
            state: Mutex::default(),
            events: Some(events),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn output_count(&self) -> usize {
        self.lock().outputs.len()
    }

    pub fn outputs(&self) -> Vec<ExecutionOutput> {
        self.lock().outputs.clone()
    }

    pub fn files(&self) -> Vec<String> {
        self.lock().files.clone()
    }

    /// Move everything recorded so far into `result`.
    pub fn drain_into(&self, result: &mut ExecutionResult) {
        let mut state = self.lock();
        result.outputs.append(&mut state.outputs);
        result.files.append(&mut state.files);
        result.metrics.output_count = result.outputs.len();
    }
}

impl OutputSink for ResultLog {
    fn emit(&self, output: ExecutionOutput) {
        self.lock().outputs.push(output.clone());
        if let Some(events) = &self.events {
            // No subscriber is not an error.
            let _ = events.send(StreamEvent::Output(output));
        }
    }
}

impl ArtifactSink for ResultLog {
    fn record(&self, path: &Path, size: u64) {
        let path = path.display().to_string();
        {
            let mut state = self.lock();
            if !state.files.contains(&path) {
                state.files.push(path.clone());
            }
        }
        self.emit(
            ExecutionOutput::new(OutputKind::BinaryFile, path.clone())
                .with_metadata(META_PATH, path)
                .with_metadata(META_SIZE, size.to_string()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_outputs_and_deduplicates_files() {
        let log = ResultLog::new();
        log.emit(ExecutionOutput::text("a"));
        log.record(Path::new("/sandbox/out_1.txt"), 3);
        log.record(Path::new("/sandbox/out_1.txt"), 5);

        assert_eq!(log.files(), vec!["/sandbox/out_1.txt".to_string()]);
        let outputs = log.outputs();
        assert_eq!(outputs.len(), 3);
        assert_eq!(outputs[2].kind, OutputKind::BinaryFile);
        assert_eq!(outputs[2].metadata[META_SIZE], "5");

        let mut result = ExecutionResult::default();
        log.drain_into(&mut result);
        assert_eq!(result.metrics.output_count, 3);
        assert_eq!(log.output_count(), 0);
    }

    #[tokio::test]
    async fn test_mirrors_onto_channel() {
        let (tx, mut rx) = broadcast::channel(8);
        let log = ResultLog::broadcasting(tx);
        log.emit(ExecutionOutput::text("live"));
        match rx.recv().await.unwrap() {
            StreamEvent::Output(o) => assert_eq!(o.content, "live"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(log.output_count(), 1);
    }
}
