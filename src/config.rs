//! Environment-derived settings

use std::path::{Path, PathBuf};

/// Runtime settings resolved from environment variables
#[derive(Debug, Clone)]
pub struct Settings {
    /// Path to the SQLite database file, or `:memory:`
    pub database_path: String,
    /// Env fallback LLM endpoint (used by the startup migration)
    pub llm_endpoint: String,
    /// Env fallback LLM API key
    pub llm_api_key: String,
    /// Env fallback LLM model name
    pub llm_model: String,
    /// Directory holding user block manifests
    pub blocks_path: PathBuf,
    /// Directory holding system-level custom block manifests
    pub custom_blocks_path: PathBuf,
    /// Directory holding builtin pipeline templates
    pub builtin_templates_path: PathBuf,
    /// Directory holding user pipeline templates
    pub templates_path: PathBuf,
    /// Whether the extension file watcher is enabled
    pub hot_reload: bool,
    /// Debounce window for the file watcher, in milliseconds
    pub hot_reload_debounce_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: "data/datagenflow.db".to_string(),
            llm_endpoint: String::new(),
            llm_api_key: String::new(),
            llm_model: String::new(),
            blocks_path: PathBuf::from("user_blocks"),
            custom_blocks_path: PathBuf::from("custom_blocks"),
            builtin_templates_path: PathBuf::from("templates"),
            templates_path: PathBuf::from("user_templates"),
            hot_reload: true,
            hot_reload_debounce_ms: 500,
        }
    }
}

impl Settings {
    /// Build settings from the process environment
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_path: env_or("DATABASE_PATH", &defaults.database_path),
            llm_endpoint: env_or("LLM_ENDPOINT", ""),
            llm_api_key: env_or("LLM_API_KEY", ""),
            llm_model: env_or("LLM_MODEL", ""),
            blocks_path: PathBuf::from(env_or("DATAGENFLOW_BLOCKS_PATH", "user_blocks")),
            custom_blocks_path: PathBuf::from(env_or(
                "DATAGENFLOW_CUSTOM_BLOCKS_PATH",
                "custom_blocks",
            )),
            builtin_templates_path: PathBuf::from("templates"),
            templates_path: PathBuf::from(env_or("DATAGENFLOW_TEMPLATES_PATH", "user_templates")),
            hot_reload: env_or("DATAGENFLOW_HOT_RELOAD", "true").to_lowercase() == "true",
            hot_reload_debounce_ms: env_or("DATAGENFLOW_HOT_RELOAD_DEBOUNCE_MS", "500")
                .parse()
                .unwrap_or(500),
        }
    }

    /// Ensure the parent directory of the database file exists
    pub fn ensure_data_dir(&self) -> std::io::Result<()> {
        if self.database_path == ":memory:" {
            return Ok(());
        }
        if let Some(parent) = Path::new(&self.database_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Install the global tracing subscriber with `RUST_LOG`-style filtering.
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let settings = Settings::default();
        assert_eq!(settings.database_path, "data/datagenflow.db");
        assert!(settings.hot_reload);
        assert_eq!(settings.hot_reload_debounce_ms, 500);
    }

    #[test]
    fn memory_db_needs_no_data_dir() {
        let settings = Settings {
            database_path: ":memory:".to_string(),
            ..Settings::default()
        };
        assert!(settings.ensure_data_dir().is_ok());
    }
}
