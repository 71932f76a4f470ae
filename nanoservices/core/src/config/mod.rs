pub mod loader;
pub mod types;

pub use loader::{from_env, from_lookup, load_file, parse_config, parse_duration, ConfigError};
pub use types::EltConfig;
