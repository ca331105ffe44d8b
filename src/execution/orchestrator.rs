use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::analysis::SafetyAnalyzer;
use crate::config::loader::get_data_dir;
use crate::config::types::{ExecutionConfig, RunpadConfig};
use crate::error::{Result, RunpadError};
use crate::execution::backend::{
    BackendError, CompileRequest, ExecutionBackend, ExecutionOutcome, ProgramIo, ProgramKind,
};
use crate::execution::metrics::peak_memory_bytes;
use crate::execution::process::ProcessBackend;
use crate::execution::runtime::RuntimeTable;
use crate::model::{
    ErrorCategory, ExecutionMetrics, ExecutionOutput, ExecutionRequest, ExecutionResult,
    OutputKind, SafetyVerdict,
};
use crate::packages::{PackageResolver, RegistryResolver};
use crate::preprocess::{is_wrapped_program, rewrite_unsupported, strip_program_wrapper, PreprocessRules};
use crate::storage::SandboxedStorage;
use crate::streaming::{
    BatchInput, CharWriter, ConsoleWriter, InputDelivery, InputSource, LineWriter, OutputSink,
    ResultLog, SessionHub, SessionRegistry, StreamingInput, Subscription,
};

pub const NO_CODE_PROVIDED: &str = "No code provided.";
const HUB_CAPACITY: usize = 1024;

/// Where the sandbox lives when the config does not say.
pub fn storage_root(config: &RunpadConfig) -> PathBuf {
    config
        .storage
        .root
        .clone()
        .unwrap_or_else(|| get_data_dir().join("sandbox"))
}

/// The console of one execution.
struct Console {
    log: Arc<ResultLog>,
    stdout: Arc<dyn ConsoleWriter>,
    stderr: Arc<dyn ConsoleWriter>,
    stdin: Arc<dyn InputSource>,
    cancel: CancellationToken,
    streaming: bool,
}

/// Drives a submission from receipt to its result envelope.
pub struct Orchestrator {
    execution: ExecutionConfig,
    rules: PreprocessRules,
    analyzer: SafetyAnalyzer,
    storage: SandboxedStorage,
    backend: Arc<dyn ExecutionBackend>,
    packages: Arc<dyn PackageResolver>,
    runtimes: RuntimeTable,
    registry: Arc<SessionRegistry>,
    hub: Arc<SessionHub>,
    permits: Arc<Semaphore>,
}

impl Orchestrator {
    pub fn new(
        config: &RunpadConfig,
        storage: SandboxedStorage,
        backend: Arc<dyn ExecutionBackend>,
        packages: Arc<dyn PackageResolver>,
    ) -> Self {
        Self {
            execution: config.execution.clone(),
            rules: config.preprocess.clone(),
            analyzer: SafetyAnalyzer::new(config.safety.policy.clone()),
            storage,
            backend,
            packages,
            runtimes: RuntimeTable::new(&config.runtimes),
            registry: SessionRegistry::new(),
            hub: Arc::new(SessionHub::new(
                HUB_CAPACITY,
                Duration::from_secs(config.execution.result_retention_seconds),
            )),
            permits: Arc::new(Semaphore::new(config.execution.max_concurrent_executions.max(1))),
        }
    }

    /// Wire up the process backend and registry resolver described by `config`.
    pub fn from_config(config: &RunpadConfig) -> Result<Self> {
        let storage = SandboxedStorage::new(storage_root(config), config.storage.max_file_size)?;
        let backend = Arc::new(ProcessBackend::new(config.backend.clone(), storage.root())?);
        let packages = Arc::new(RegistryResolver::new(&config.packages)?);
        Ok(Self::new(config, storage, backend, packages))
    }

    pub fn storage(&self) -> &SandboxedStorage {
        &self.storage
    }

    pub fn runtimes(&self) -> &RuntimeTable {
        &self.runtimes
    }

    pub fn backend(&self) -> &Arc<dyn ExecutionBackend> {
        &self.backend
    }

    pub fn analyze(&self, code: &str) -> SafetyVerdict {
        self.analyzer.analyze(code)
    }

    /// Rewrite unsupported calls, optionally unwrapping a full program first.
    pub fn prepare(&self, code: &str, strip_wrapper: bool) -> String {
        let code = if strip_wrapper {
            strip_program_wrapper(code, &self.execution.entry_class, &self.execution.entry_method)
        } else {
            code.to_string()
        };
        rewrite_unsupported(&code, &self.rules)
    }

    /// Run a submission to completion and return its result envelope.
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let log = Arc::new(ResultLog::new());
        let console = Console {
            stdout: Arc::new(LineWriter::batch(log.clone(), self.execution.max_output_bytes)),
            stderr: Arc::new(LineWriter::errors(log.clone(), false)),
            stdin: Arc::new(BatchInput),
            log,
            cancel: CancellationToken::new(),
            streaming: false,
        };
        self.run(&request, console).await
    }

    /// Accept a streaming submission and run it in the background.
    ///
    /// Outputs and the final result are published on the session's channel.
    pub fn execute_streaming(self: &Arc<Self>, request: ExecutionRequest) -> Result<()> {
        let session_id = request
            .session_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .ok_or(RunpadError::SessionIdMissing)?;
        let (guard, receiver) = self.registry.register(&session_id)?;
        self.hub.forget(&session_id);

        let log = Arc::new(ResultLog::broadcasting(self.hub.open(&session_id)));
        let stdout: Arc<dyn ConsoleWriter> = if request.interactive {
            Arc::new(CharWriter::new(log.clone()))
        } else {
            Arc::new(LineWriter::text(log.clone()))
        };
        let input_timeout = match self.execution.input_timeout_seconds {
            0 => None,
            seconds => Some(Duration::from_secs(seconds)),
        };
        let stdin = StreamingInput::new(&session_id, receiver, guard.cancel_token(), log.clone())
            .with_timeout(input_timeout);
        let console = Console {
            stdout,
            stderr: Arc::new(LineWriter::errors(log.clone(), request.interactive)),
            stdin: Arc::new(stdin),
            log,
            cancel: guard.cancel_token(),
            streaming: true,
        };

        info!(session = %session_id, interactive = request.interactive, "Accepted streaming execution");
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let result = orchestrator.run(&request, console).await;
            info!(session = %session_id, success = result.success, "Streaming execution complete");
            // The channel is retired while the slot is still held, so a new
            // run under this id always starts on a fresh channel.
            orchestrator.hub.complete(&session_id, result);
            drop(guard);
        });
        Ok(())
    }

    /// Subscribe to a session's events, whether it has not started yet, is
    /// running, or finished within the retention window.
    pub fn watch(&self, session_id: &str) -> Subscription {
        self.hub.watch(session_id)
    }

    pub fn provide_input(&self, session_id: &str, text: &str) -> InputDelivery {
        let delivery = self.registry.provide_input(session_id, text);
        debug!(session = %session_id, ?delivery, "Input delivered");
        delivery
    }

    pub fn cancel(&self, session_id: &str) -> bool {
        self.registry.cancel(session_id)
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.registry.is_active(session_id)
    }

    fn timeout(&self) -> Option<Duration> {
        match self.execution.execution_timeout_seconds {
            0 => None,
            seconds => Some(Duration::from_secs(seconds)),
        }
    }

    async fn run(&self, request: &ExecutionRequest, console: Console) -> ExecutionResult {
        let started = Instant::now();
        let mut result = ExecutionResult::new(request.runtime.clone());

        let success = self.pipeline(request, &console, &mut result.metrics).await;

        console.stdout.flush();
        console.stderr.flush();
        console.log.drain_into(&mut result);
        result.success = success;
        result.metrics.execution_duration_ms = elapsed_ms(started);
        result.metrics.peak_memory_bytes = peak_memory_bytes();

        debug!(
            success,
            outputs = result.outputs.len(),
            files = result.files.len(),
            "Execution finished"
        );
        result
    }

    async fn pipeline(
        &self,
        request: &ExecutionRequest,
        console: &Console,
        metrics: &mut ExecutionMetrics,
    ) -> bool {
        if request.code.trim().is_empty() {
            console.log.emit(ExecutionOutput::failure(
                OutputKind::CompileError,
                ErrorCategory::Validation,
                NO_CODE_PROVIDED,
            ));
            return false;
        }

        let source = self.prepare(&request.code, console.streaming);

        if console.streaming || self.execution.gate_batch {
            let verdict = self.analyzer.analyze(&source);
            if !verdict.is_safe {
                warn!(warnings = verdict.warnings.len(), "Submission rejected by safety analysis");
                console.log.emit(ExecutionOutput::failure(
                    OutputKind::CompileError,
                    ErrorCategory::SafetyViolation,
                    verdict.warnings.join("\n"),
                ));
                return false;
            }
        }

        let Ok(_permit) = self.permits.clone().acquire_owned().await else {
            console.log.emit(ExecutionOutput::failure(
                OutputKind::RuntimeError,
                ErrorCategory::RuntimeError,
                "Execution service is shutting down",
            ));
            return false;
        };

        let mut references = self.execution.default_references.clone();
        match self.packages.resolve(&request.packages, &request.runtime).await {
            Ok(resolved) => references.extend(resolved),
            Err(e) => {
                self.report(BackendError::Internal(e), console);
                return false;
            }
        }

        let kind = if is_wrapped_program(&source, &self.execution.entry_class, &self.execution.entry_method) {
            ProgramKind::WrappedProgram {
                entry_class: self.execution.entry_class.clone(),
                entry_method: self.execution.entry_method.clone(),
            }
        } else {
            ProgramKind::Script
        };
        let compile_request = CompileRequest {
            source,
            kind,
            references,
            language_version: self.runtimes.language_version(&request.runtime),
        };
        info!(
            backend = self.backend.name(),
            kind = ?compile_request.kind,
            language_version = %compile_request.language_version,
            "Executing submission"
        );

        let work = self.compile_and_invoke(&compile_request, console, metrics);
        let guarded = async {
            tokio::select! {
                biased;
                _ = console.cancel.cancelled() => Err(BackendError::Cancelled),
                outcome = work => outcome,
            }
        };
        let outcome = match self.timeout() {
            Some(limit) => match tokio::time::timeout(limit, guarded).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    console.cancel.cancel();
                    Err(BackendError::Timeout)
                }
            },
            None => guarded.await,
        };

        match outcome {
            Ok(outcome) => {
                print_value(outcome, console.stdout.as_ref());
                true
            }
            Err(e) => {
                self.report(e, console);
                false
            }
        }
    }

    async fn compile_and_invoke(
        &self,
        request: &CompileRequest,
        console: &Console,
        metrics: &mut ExecutionMetrics,
    ) -> std::result::Result<ExecutionOutcome, BackendError> {
        let started = Instant::now();
        let artifact = self.backend.compile(request).await;
        metrics.compile_duration_ms = elapsed_ms(started);
        let artifact = artifact?;

        let io = ProgramIo {
            stdout: console.stdout.clone(),
            stderr: console.stderr.clone(),
            stdin: console.stdin.clone(),
            storage: self.storage.session(console.log.clone()),
            cancel: console.cancel.clone(),
        };
        self.backend.invoke(&artifact, &io).await
    }

    /// Turn a failed execution into its typed error output.
    fn report(&self, error: BackendError, console: &Console) {
        // Pending program output goes first.
        console.stdout.flush();
        console.stderr.flush();

        let output = match error {
            BackendError::Compile(diagnostics) => {
                let content = diagnostics
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("\n");
                ExecutionOutput::failure(OutputKind::CompileError, ErrorCategory::CompileError, content)
                    .with_metadata("error_count", diagnostics.len().to_string())
                    .with_metadata("severity", "error")
            }
            BackendError::Runtime(message) => {
                ExecutionOutput::failure(OutputKind::RuntimeError, ErrorCategory::RuntimeError, message)
            }
            BackendError::InteractiveRequired => ExecutionOutput::failure(
                OutputKind::RuntimeError,
                ErrorCategory::InteractiveRequired,
                RunpadError::InteractiveModeRequired.to_string(),
            ),
            BackendError::Cancelled => ExecutionOutput::failure(
                OutputKind::RuntimeError,
                ErrorCategory::Cancelled,
                "Execution cancelled",
            ),
            BackendError::Timeout => ExecutionOutput::failure(
                OutputKind::RuntimeError,
                ErrorCategory::Cancelled,
                RunpadError::ExecutionTimeout {
                    seconds: self.execution.execution_timeout_seconds,
                }
                .to_string(),
            ),
            BackendError::Internal(e) => {
                let category = match &e {
                    RunpadError::AccessDenied { .. } => ErrorCategory::SandboxViolation,
                    RunpadError::FileTooLarge { .. } | RunpadError::AppendTooLarge { .. } => {
                        ErrorCategory::QuotaExceeded
                    }
                    _ => ErrorCategory::RuntimeError,
                };
                ExecutionOutput::failure(OutputKind::RuntimeError, category, e.to_string())
            }
        };
        console.log.emit(output);
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Print a script's final value: objects and arrays as JSON, scalars as text, strings not at all.
fn print_value(outcome: ExecutionOutcome, stdout: &dyn ConsoleWriter) {
    match outcome.value {
        None | Some(serde_json::Value::Null) | Some(serde_json::Value::String(_)) => {}
        Some(value) => stdout.write_line(&value.to_string()),
    }
}
