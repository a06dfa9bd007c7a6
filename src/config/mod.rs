//! Layered configuration
//!
//! Four layers, merged in order:
//! 1. Built-in defaults
//! 2. Host config (~/.config/crossbuild/config.toml)
//! 3. Repo config (.crossbuild/pipeline.toml)
//! 4. CLI flags

mod defaults;
mod effective;
mod merge;
mod settings;

pub use defaults::{BuiltinDefaults, DEFAULT_OUTPUT_DIR, DEFAULT_WORK_ROOT};
pub use effective::{
    default_host_config_path, ConfigOrigin, ConfigSource, EffectiveConfig, EFFECTIVE_CONFIG_FILE,
    REPO_CONFIG_PATH,
};
pub use merge::{deep_merge, merge_layers};
pub use settings::PipelineSettings;

use crate::collect::CollectError;
use crate::matrix::MatrixError;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid matrix: {0}")]
    Matrix(#[from] MatrixError),

    #[error("Invalid artifact rule: {0}")]
    Artifact(#[from] CollectError),
}
