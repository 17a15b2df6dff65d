//! Agent id: env var → .env in the config dir → host name.

use log::debug;
use std::path::Path;

use super::config::PackagePaths;

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn try_env_then_dotenv(dir: &Path, key: &str) -> Option<String> {
    if let Some(s) = non_empty_env(key) {
        return Some(s);
    }
    let env_path = dir.join(".env");
    if env_path.is_file() {
        let _ = dotenvy::from_path(&env_path);
        return non_empty_env(key);
    }
    None
}

/// Id recorded on every task row this process writes. `CASEWATCH_AGENT` (from the
/// environment or `dir/.env`) wins; otherwise the host name.
pub fn resolve_agent(dir: &Path) -> String {
    let key = PackagePaths::get().agent_env_var();
    if let Some(s) = try_env_then_dotenv(dir, key) {
        debug!("agent id from {}", key);
        return s;
    }
    sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string())
}
