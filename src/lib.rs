//! Remote operations engine.
//!
//! Opens and multiplexes interactive SSH sessions to managed hosts, runs
//! bounded one-off commands, discovers SSH hosts across address ranges and
//! moves files over SFTP.

pub mod config;
pub mod error;
pub mod logging;
pub mod scan;
pub mod sftp;
pub mod ssh;
pub mod state;

pub use error::{EngineError, EngineResult};
pub use state::Engine;
