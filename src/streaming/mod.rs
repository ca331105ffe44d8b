//! The per-execution console.
//!
//! Program output goes through a [`ConsoleWriter`] into an [`OutputSink`]
//! (normally a [`ResultLog`], which also fans out to the session's broadcast
//! channel). Program input comes from an [`InputSource`]: batch executions get
//! one that always fails, streaming executions get one fed by the
//! [`SessionRegistry`].

pub mod hub;
pub mod log;
pub mod reader;
pub mod registry;
pub mod writer;

use crate::model::ExecutionOutput;

pub use hub::{SessionHub, StreamEvent, Subscription};
pub use log::ResultLog;
pub use reader::{BatchInput, InputSource, StreamingInput};
pub use registry::{InputDelivery, SessionGuard, SessionRegistry};
pub use writer::{CharWriter, ConsoleWriter, LineWriter};

/// Destination of every output entry an execution produces.
pub trait OutputSink: Send + Sync {
    fn emit(&self, output: ExecutionOutput);
}
