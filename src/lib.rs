//! QVMM - QEMU VM Manager Library
//!
//! Typed VM configurations, per-architecture defaults, QEMU command-line
//! compilation, bundle persistence and process supervision.

pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod utils;
pub mod vm;

// Re-export commonly used types
pub use cli::commands::Cli;
pub use config::schema::Configuration;
pub use config::settings::Settings;
pub use error::Error;
pub use vm::args::ArgumentCompiler;
pub use vm::manager::VmManager;
pub use vm::store::VmStore;
pub use vm::supervisor::Supervisor;

/// Library error type
pub type Result<T> = anyhow::Result<T>;
