pub mod analysis;
pub mod cli;
pub mod config;
pub mod error;
pub mod execution;
pub mod model;
pub mod output;
pub mod packages;
pub mod preprocess;
pub mod server;
pub mod storage;
pub mod streaming;

pub use error::{Result, RunpadError};
