pub mod agent;
pub mod config;
pub mod logger;
pub mod settings_toml;

pub use agent::resolve_agent;
pub use config::*;
pub use logger::{colorize_status, setup_logging};
pub use settings_toml::{AppConfig, load_app_config};
