//! Content sniffing and the output quota governor of the batch writer.

pub mod classify;
pub mod quota;

pub use classify::classify;
pub use quota::{Admission, OutputQuota};
