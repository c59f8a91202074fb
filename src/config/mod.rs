pub mod hosts;
pub mod settings;

pub use hosts::*;
pub use settings::*;

use crate::error::EngineResult;
use std::path::PathBuf;

/// Get the opsrelay config directory
pub fn get_config_dir() -> EngineResult<PathBuf> {
    let config_dir = dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .ok_or_else(|| crate::error::EngineError::Config("Could not find config directory".into()))?
        .join("opsrelay");

    Ok(config_dir)
}
