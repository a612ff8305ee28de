pub mod engine;
pub mod error;
pub mod executor;
pub mod log_sanitize;
pub mod manifest;
pub mod probe;
pub mod process;
pub mod report;
pub mod resolve;
pub mod transport;

pub use error::{Error, Result};
