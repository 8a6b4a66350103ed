pub mod loader;
pub mod schema;

pub use loader::{ConfigError, deep_merge, load_config, parse_env_file, substitute_env};
pub use schema::Config;
