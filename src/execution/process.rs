use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::config::types::BackendConfig;
use crate::error::{Result, RunpadError};
use crate::execution::backend::{
    Artifact, BackendError, CompileRequest, ExecutionBackend, ExecutionOutcome, ProgramIo,
    ProgramKind,
};
use crate::execution::stdin::{blocked_on_stdin, stdin_observable};
use crate::model::{Diagnostic, Severity};
use crate::streaming::{ConsoleWriter, InputSource};

/// Interval between checks for a child waiting on stdin.
const STDIN_POLL: Duration = Duration::from_millis(20);
/// Consecutive waiting observations before a read is forwarded.
const STDIN_SETTLE: u32 = 2;
/// How long a killed child's remaining stdout is drained.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Runs submissions through an external toolchain such as `dotnet-script`.
///
/// Each compile gets its own workspace under `workspace_root`, which is also
/// the child's working directory; files left there by the program are
/// recorded as artifacts through the sandboxed storage.
pub struct ProcessBackend {
    config: BackendConfig,
    workspace_root: PathBuf,
    diagnostics: Regex,
}

impl ProcessBackend {
    pub fn new(config: BackendConfig, workspace_root: impl Into<PathBuf>) -> Result<Self> {
        let diagnostics = Regex::new(&config.diagnostic_pattern).map_err(|e| {
            RunpadError::Config(format!("Invalid backend.diagnostic_pattern: {}", e))
        })?;
        Ok(Self {
            config,
            workspace_root: workspace_root.into(),
            diagnostics,
        })
    }

    fn source_path(&self, id: &str) -> PathBuf {
        self.workspace_root
            .join(format!("run_{}", id))
            .join(format!("submission.{}", self.config.source_extension))
    }

    /// The per-run folder holding `source`, never the workspace root itself.
    fn workspace_of(&self, source: &Path) -> std::result::Result<PathBuf, BackendError> {
        source
            .parent()
            .filter(|dir| dir.starts_with(&self.workspace_root) && *dir != self.workspace_root)
            .map(Path::to_path_buf)
            .ok_or_else(|| BackendError::Runtime("Artifact was not compiled by this backend".into()))
    }

    /// Build the argument list: references first, then the expanded template.
    fn arguments(&self, template: &[String], artifact: &Artifact, source: &Path) -> Vec<String> {
        let mut args = Vec::new();
        for reference in &artifact.references {
            args.push(self.config.reference_arg.clone());
            args.push(reference.display().to_string());
        }
        args.extend(template.iter().map(|arg| {
            arg.replace("{source}", &source.display().to_string())
                .replace("{language_version}", &artifact.language_version)
        }));
        args
    }

    fn command(&self, args: &[String], workdir: &Path) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(args)
            .current_dir(workdir)
            .kill_on_drop(true)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &self.config.env_vars {
            cmd.env(key, value);
        }
        cmd
    }

    fn spawn_error(&self, e: std::io::Error) -> BackendError {
        BackendError::Internal(RunpadError::BackendNotAvailable {
            backend: self.config.program.clone(),
            reason: e.to_string(),
        })
    }

    /// Parse one diagnostic line, if it is one.
    pub fn parse_diagnostic(&self, line: &str) -> Option<Diagnostic> {
        let caps = self.diagnostics.captures(line)?;
        let line_no = caps.name("line")?.as_str().parse().ok()?;
        let column = caps.name("col")?.as_str().parse().ok()?;
        let severity = match caps.name("severity").map(|m| m.as_str()) {
            Some("warning") => Severity::Warning,
            Some("info") => Severity::Info,
            _ => Severity::Error,
        };
        let mut diagnostic = Diagnostic::error(caps.name("message")?.as_str().trim(), line_no, column);
        diagnostic.severity = severity;
        diagnostic.code = caps.name("code").map(|m| m.as_str().to_string());
        Some(diagnostic)
    }

    pub fn parse_diagnostics(&self, text: &str) -> Vec<Diagnostic> {
        text.lines().filter_map(|line| self.parse_diagnostic(line)).collect()
    }

    /// Record files the program left in its workspace. Returns how many were kept.
    fn record_artifacts(&self, workspace: &Path, source: &Path, io: &ProgramIo) -> usize {
        let files = match io.storage.list_files(workspace, "*", true) {
            Ok(files) => files,
            Err(e) => {
                warn!(error = %e, workspace = %workspace.display(), "Could not scan workspace");
                return 0;
            }
        };
        let mut recorded = 0;
        for file in files.iter().filter(|f| f.as_path() != source) {
            match io.storage.record_existing(file) {
                Ok(_) => recorded += 1,
                Err(e) => warn!(error = %e, path = %file.display(), "Skipping produced file"),
            }
        }
        recorded
    }
}

/// A run's working directory, removed on drop unless it holds recorded artifacts.
struct Workspace {
    dir: PathBuf,
    keep: bool,
}

impl Workspace {
    fn new(dir: PathBuf) -> Self {
        Self { dir, keep: false }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            debug!(error = %e, workspace = %self.dir.display(), "Could not remove workspace");
        }
    }
}

/// Forward raw child output to a console writer without splitting UTF-8 sequences.
async fn pump_output<R: AsyncRead + Unpin>(
    mut reader: R,
    writer: Arc<dyn ConsoleWriter>,
) -> std::io::Result<()> {
    let mut buf = [0u8; 4096];
    let mut carry: Vec<u8> = Vec::new();
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        carry.extend_from_slice(&buf[..n]);
        let valid = match std::str::from_utf8(&carry) {
            Ok(text) => text.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => carry.len(),
        };
        if valid > 0 {
            writer.write(&String::from_utf8_lossy(&carry[..valid]));
            carry.drain(..valid);
        }
    }
    if !carry.is_empty() {
        writer.write(&String::from_utf8_lossy(&carry));
    }
    Ok(())
}

/// Feed session input to the child each time it blocks reading stdin.
///
/// A batch input source fails the first such read, which ends the run.
/// Where blocked reads cannot be observed, lines are forwarded as fast as
/// the source yields them and batch runs see end of input instead.
async fn pump_input(
    pid: Option<u32>,
    mut stdin: ChildStdin,
    input: Arc<dyn InputSource>,
) -> Result<()> {
    let watched = pid.filter(|_| stdin_observable());
    if watched.is_none() && !input.is_interactive() {
        return Ok(());
    }
    loop {
        if let Some(pid) = watched {
            wait_for_read(pid).await;
        }
        let line = input.read_line().await?;
        if stdin.write_all(format!("{}\n", line).as_bytes()).await.is_err() {
            return Ok(());
        }
        if stdin.flush().await.is_err() {
            return Ok(());
        }
    }
}

/// Return once `pid` has been seen blocked on stdin on consecutive polls.
async fn wait_for_read(pid: u32) {
    let mut waiting = 0;
    while waiting < STDIN_SETTLE {
        tokio::time::sleep(STDIN_POLL).await;
        if blocked_on_stdin(pid) {
            waiting += 1;
        } else {
            waiting = 0;
        }
    }
}

/// Aborts a helper task when the invocation ends, however it ends.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Resolve with the pump's error, or never if it ends cleanly.
async fn input_failure(pump: Option<JoinHandle<Result<()>>>) -> RunpadError {
    if let Some(pump) = pump {
        if let Ok(Err(e)) = pump.await {
            return e;
        }
    }
    std::future::pending().await
}

#[async_trait]
impl ExecutionBackend for ProcessBackend {
    fn name(&self) -> &str {
        "process"
    }

    async fn compile(&self, request: &CompileRequest) -> std::result::Result<Artifact, BackendError> {
        let mut artifact = Artifact::from_request(request);
        let source = self.source_path(&artifact.id);
        let workspace = self.workspace_of(&source)?;

        tokio::fs::create_dir_all(&workspace)
            .await
            .map_err(|e| BackendError::Internal(e.into()))?;
        let mut workspace = Workspace::new(workspace);
        tokio::fs::write(&source, &request.source)
            .await
            .map_err(|e| BackendError::Internal(e.into()))?;
        artifact.location = Some(source.clone());

        let Some(check_args) = &self.config.check_args else {
            workspace.keep = true;
            return Ok(artifact);
        };

        let args = self.arguments(check_args, &artifact, &source);
        debug!(program = %self.config.program, ?args, "Checking submission");
        let output = self
            .command(&args, &workspace.dir)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        if output.status.success() {
            workspace.keep = true;
            return Ok(artifact);
        }

        let text = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        let mut errors: Vec<Diagnostic> = self
            .parse_diagnostics(&text)
            .into_iter()
            .filter(|d| d.severity == Severity::Error)
            .collect();
        if errors.is_empty() {
            errors.push(Diagnostic::error(text.trim(), 1, 1));
        }
        Err(BackendError::Compile(errors))
    }

    async fn invoke(
        &self,
        artifact: &Artifact,
        io: &ProgramIo,
    ) -> std::result::Result<ExecutionOutcome, BackendError> {
        let source = artifact
            .location
            .clone()
            .ok_or_else(|| BackendError::Runtime("Artifact was not compiled by this backend".into()))?;
        let mut workspace = Workspace::new(self.workspace_of(&source)?);

        let template = match artifact.kind {
            ProgramKind::Script => &self.config.script_args,
            ProgramKind::WrappedProgram { .. } => &self.config.program_args,
        };
        let args = self.arguments(template, artifact, &source);
        info!(program = %self.config.program, artifact = %artifact.id, "Starting process");

        let mut child = self
            .command(&args, &workspace.dir)
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let stdout = child.stdout.take().map(|out| {
            tokio::spawn(pump_output(out, io.stdout.clone()))
        });
        let pid = child.id();
        let pump = child
            .stdin
            .take()
            .map(|stdin| tokio::spawn(pump_input(pid, stdin, io.stdin.clone())));
        let stop_pump = pump.as_ref().map(|pump| AbortOnDrop(pump.abort_handle()));

        let mut compile_errors = Vec::new();
        let stderr = child.stderr.take();
        let read_stderr = async {
            let Some(stderr) = stderr else {
                return;
            };
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match self.parse_diagnostic(&line) {
                    Some(d) if d.severity == Severity::Error => compile_errors.push(d),
                    Some(d) => debug!(diagnostic = %d, "Backend diagnostic"),
                    None => io.stderr.write_line(&line),
                }
            }
        };

        let finished = tokio::select! {
            (status, ()) = async { tokio::join!(child.wait(), read_stderr) } => Ok(status),
            e = input_failure(pump) => Err(BackendError::from(e)),
            _ = io.cancel.cancelled() => Err(BackendError::Cancelled),
        };
        drop(stop_pump);

        let status = match finished {
            Ok(status) => status.map_err(|e| BackendError::Internal(e.into()))?,
            Err(e) => {
                warn!(artifact = %artifact.id, reason = %e, "Killing process");
                let _ = child.kill().await;
                if let Some(stdout) = stdout {
                    let _ = tokio::time::timeout(DRAIN_TIMEOUT, stdout).await;
                }
                return Err(e);
            }
        };

        if let Some(stdout) = stdout {
            let _ = stdout.await;
        }

        if let Err(e) = tokio::fs::remove_file(&source).await {
            debug!(error = %e, "Could not remove submission source");
        }
        workspace.keep = self.record_artifacts(&workspace.dir, &source, io) > 0;

        debug!(status = %status, "Process finished");
        if status.success() {
            Ok(ExecutionOutcome::default())
        } else if !compile_errors.is_empty() {
            Err(BackendError::Compile(compile_errors))
        } else {
            Err(BackendError::Runtime(format!("Process exited with {}", status)))
        }
    }

    async fn health_check(&self) -> bool {
        match Command::new(&self.config.program).arg("--version").output().await {
            Ok(output) => output.status.success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::DEFAULT_DIAGNOSTIC_PATTERN;

    fn backend(root: &Path) -> ProcessBackend {
        ProcessBackend::new(BackendConfig::default(), root).unwrap()
    }

    #[test]
    fn test_parse_msbuild_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let text = "/tmp/x/submission.csx(3,14): error CS1002: ; expected\n\
                    /tmp/x/submission.csx(1,1): warning CS0168: unused\n\
                    plain output";
        let diags = backend.parse_diagnostics(text);
        assert_eq!(diags.len(), 2);
        assert_eq!(diags[0].to_string(), "(3,14): error CS1002: ; expected");
        assert_eq!(diags[1].severity, Severity::Warning);
        assert_eq!(BackendConfig::default().diagnostic_pattern, DEFAULT_DIAGNOSTIC_PATTERN);
    }

    #[test]
    fn test_arguments_expand_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BackendConfig::default();
        config.script_args = vec!["--lang".into(), "{language_version}".into(), "{source}".into()];
        let backend = ProcessBackend::new(config, dir.path()).unwrap();
        let request = CompileRequest {
            source: String::new(),
            kind: ProgramKind::Script,
            references: vec![PathBuf::from("/libs/a.dll")],
            language_version: "12".into(),
        };
        let artifact = Artifact::from_request(&request);
        let args = backend.arguments(&backend.config.script_args, &artifact, Path::new("/w/s.csx"));
        assert_eq!(args, vec!["-r", "/libs/a.dll", "--lang", "12", "/w/s.csx"]);
    }

    #[test]
    fn test_rejects_bad_pattern() {
        let mut config = BackendConfig::default();
        config.diagnostic_pattern = "(".into();
        assert!(ProcessBackend::new(config, "/tmp").is_err());
    }

    #[cfg(unix)]
    mod shell {
        use super::*;
        use crate::model::OutputKind;
        use crate::storage::SandboxedStorage;
        use crate::streaming::test_support::Captured;
        use crate::streaming::{BatchInput, LineWriter, ResultLog, SessionRegistry, StreamingInput};
        use tokio_util::sync::CancellationToken;

        fn sh_backend(storage: &SandboxedStorage, check_args: Option<Vec<String>>) -> ProcessBackend {
            let config = BackendConfig {
                program: "sh".into(),
                script_args: vec!["{source}".into()],
                check_args,
                source_extension: "sh".into(),
                ..BackendConfig::default()
            };
            ProcessBackend::new(config, storage.root()).unwrap()
        }

        fn script(source: &str) -> CompileRequest {
            CompileRequest {
                source: source.into(),
                kind: ProgramKind::Script,
                references: vec![],
                language_version: "default".into(),
            }
        }

        fn batch_io(storage: &SandboxedStorage, log: &Arc<ResultLog>) -> ProgramIo {
            ProgramIo {
                stdout: Arc::new(LineWriter::batch(log.clone(), 1024)),
                stderr: Arc::new(LineWriter::errors(log.clone(), false)),
                stdin: Arc::new(BatchInput),
                storage: storage.session(log.clone()),
                cancel: CancellationToken::new(),
            }
        }

        fn run_dirs(root: &Path) -> usize {
            std::fs::read_dir(root)
                .unwrap()
                .flatten()
                .filter(|e| e.file_name().to_string_lossy().starts_with("run_"))
                .count()
        }

        #[tokio::test]
        async fn test_runs_shell_script_and_records_files() {
            let dir = tempfile::tempdir().unwrap();
            let storage = SandboxedStorage::new(dir.path(), 1024).unwrap();
            let backend = sh_backend(&storage, None);

            let artifact = backend
                .compile(&script("echo hi\necho oops >&2\necho data > out.txt\n"))
                .await
                .unwrap();

            let log = Arc::new(ResultLog::new());
            let errors = Arc::new(Captured::default());
            let io = ProgramIo {
                stderr: Arc::new(LineWriter::errors(errors.clone(), false)),
                ..batch_io(&storage, &log)
            };
            backend.invoke(&artifact, &io).await.unwrap();
            io.stdout.flush();

            let outputs = log.outputs();
            assert_eq!(outputs[0].content, "hi");
            assert_eq!(errors.contents(), vec!["oops"]);
            let files = log.files();
            assert_eq!(files.len(), 1);
            assert!(files[0].ends_with("out.txt"));
            assert_eq!(run_dirs(storage.root()), 1);
        }

        #[tokio::test]
        async fn test_batch_read_fails_as_interactive_required() {
            if !stdin_observable() {
                return;
            }
            let dir = tempfile::tempdir().unwrap();
            let storage = SandboxedStorage::new(dir.path(), 1024).unwrap();
            let backend = sh_backend(&storage, None);

            let artifact = backend
                .compile(&script("read x\necho \"got:$x\"\n"))
                .await
                .unwrap();
            let log = Arc::new(ResultLog::new());
            let io = batch_io(&storage, &log);

            let err = tokio::time::timeout(Duration::from_secs(5), backend.invoke(&artifact, &io))
                .await
                .expect("blocked read is detected")
                .unwrap_err();
            assert!(matches!(err, BackendError::InteractiveRequired));
            io.stdout.flush();
            assert!(log.outputs().iter().all(|o| !o.content.starts_with("got:")));
            assert_eq!(run_dirs(storage.root()), 0);
        }

        #[tokio::test]
        async fn test_streaming_prompts_only_for_real_reads() {
            if !stdin_observable() {
                return;
            }
            let dir = tempfile::tempdir().unwrap();
            let storage = SandboxedStorage::new(dir.path(), 1024).unwrap();
            let backend = sh_backend(&storage, None);
            let registry = SessionRegistry::new();

            for (source, input) in [("echo hi\n", None), ("read x\necho \"got:$x\"\n", Some("42"))] {
                let (guard, receiver) = registry.register("s1").unwrap();
                if let Some(line) = input {
                    registry.provide_input("s1", line);
                }
                let log = Arc::new(ResultLog::new());
                let io = ProgramIo {
                    stdout: Arc::new(LineWriter::text(log.clone())),
                    stdin: Arc::new(StreamingInput::new("s1", receiver, guard.cancel_token(), log.clone())),
                    ..batch_io(&storage, &log)
                };
                let artifact = backend.compile(&script(source)).await.unwrap();
                tokio::time::timeout(Duration::from_secs(5), backend.invoke(&artifact, &io))
                    .await
                    .expect("script finishes")
                    .unwrap();
                io.stdout.flush();

                let kinds: Vec<_> = log
                    .outputs()
                    .into_iter()
                    .map(|o| (o.kind, o.content))
                    .collect();
                let expected = match input {
                    None => vec![(OutputKind::Text, "hi".to_string())],
                    Some(_) => vec![
                        (OutputKind::ConsoleInputRequest, String::new()),
                        (OutputKind::Text, "got:42".to_string()),
                    ],
                };
                assert_eq!(kinds, expected);
                drop(guard);
            }
        }

        #[tokio::test]
        async fn test_workspace_removed_without_artifacts() {
            let dir = tempfile::tempdir().unwrap();
            let storage = SandboxedStorage::new(dir.path(), 1024).unwrap();
            let log = Arc::new(ResultLog::new());

            // Finished run that wrote nothing.
            let backend = sh_backend(&storage, None);
            let artifact = backend.compile(&script("echo hi\n")).await.unwrap();
            backend.invoke(&artifact, &batch_io(&storage, &log)).await.unwrap();
            assert_eq!(run_dirs(storage.root()), 0);

            // Failed syntax check.
            let checked = sh_backend(&storage, Some(vec!["-n".into(), "{source}".into()]));
            let err = checked.compile(&script("if then\n")).await.unwrap_err();
            assert!(matches!(err, BackendError::Compile(_)));
            assert_eq!(run_dirs(storage.root()), 0);

            // Cancelled run.
            let artifact = backend.compile(&script("sleep 5\n")).await.unwrap();
            let io = batch_io(&storage, &log);
            let cancel = io.cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                cancel.cancel();
            });
            let err = backend.invoke(&artifact, &io).await.unwrap_err();
            assert!(matches!(err, BackendError::Cancelled));
            assert_eq!(run_dirs(storage.root()), 0);
        }
    }
}
