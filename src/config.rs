use std::path::PathBuf;

use tracing_subscriber::EnvFilter;

/// Application-level constants
pub const APP_NAME: &str = "radextract";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// API key for the remote chat-completion backend.
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Override for the remote chat-completion base URL.
pub const API_BASE_ENV: &str = "RADEXTRACT_API_BASE";

/// Base URL of the completion server used by server-backed models.
pub const SERVER_URL_ENV: &str = "RADEXTRACT_SERVER_URL";

/// Override for the local model weights directory.
pub const MODELS_DIR_ENV: &str = "RADEXTRACT_MODELS_DIR";

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_SERVER_URL: &str = "http://localhost:8000/v1";

/// HTTP timeout for a single generation request (seconds).
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;

/// Default tracing filter when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    "radextract=info,warn"
}

/// Install the global tracing subscriber. Safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_log_filter())),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

/// Get the application data directory
/// ~/.radextract/ unless the home directory cannot be determined.
pub fn app_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".radextract")
}

/// Directory holding locally cached model weights, one sub-directory per model.
pub fn models_dir() -> PathBuf {
    match std::env::var_os(MODELS_DIR_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => app_data_dir().join("models"),
    }
}

/// Read a non-empty environment variable.
pub fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
