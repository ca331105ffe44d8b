//! Execution orchestration: preparing a submission, gating it, resolving its
//! references and running it on a backend with a session-scoped console.

pub mod backend;
pub mod metrics;
pub mod mock;
pub mod orchestrator;
pub mod process;
pub mod runtime;
pub mod stdin;

pub use backend::{
    Artifact, BackendError, CompileRequest, ExecutionBackend, ExecutionOutcome, ProgramIo,
    ProgramKind,
};
pub use mock::ScriptedBackend;
pub use orchestrator::{storage_root, Orchestrator, NO_CODE_PROVIDED};
pub use process::ProcessBackend;
pub use runtime::{RuntimeInfo, RuntimeTable};
