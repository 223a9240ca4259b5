//! Configuration loading, parsing, and validation.

mod loader;
mod types;
mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use types::*;
pub(crate) use types::humantime_serde;
pub use validation::validate_config;
