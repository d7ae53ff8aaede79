pub mod cli;
pub mod clients;
pub mod config;
pub mod models;
pub mod pipeline;
pub mod processing;
pub mod storage;

// Convenient re-exports for tests and external callers
pub use clients::*;
pub use config::*;
pub use models::*;
pub use pipeline::*;
pub use processing::*;
pub use storage::*;
