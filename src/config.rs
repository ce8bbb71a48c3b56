//! Daemon configuration: environment variables first, falling back to
//! hardcoded defaults, with no config-file parser pulled in for a
//! handful of scalar knobs.

use std::path::PathBuf;
use std::time::Duration;

/// Daemon-wide configuration. Every field has an environment-variable
/// override, read once at startup.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Path of the client-facing listening socket.
    pub socket_path: PathBuf,
    /// Maximum number of concurrently assigned workers.
    pub max_workers: usize,
    /// Execution timeout past which an assigned worker is reaped.
    pub worker_timeout: Duration,
    /// Where `DBDUMP`/`DBRESTORE` persist a snapshot, when the
    /// `persistence` feature is enabled.
    pub db_path: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/sid.sock"),
            max_workers: 8,
            worker_timeout: Duration::from_secs(30),
            db_path: PathBuf::from("/run/sid.db"),
        }
    }
}

impl DaemonConfig {
    /// Build a config from environment variables, falling back to
    /// [`Default::default`] for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            socket_path: std::env::var("SID_SOCKET_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.socket_path),
            max_workers: std::env::var("SID_MAX_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_workers),
            worker_timeout: std::env::var("SID_WORKER_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.worker_timeout),
            db_path: std::env::var("SID_DB_PATH").map(PathBuf::from).unwrap_or(defaults.db_path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = DaemonConfig::default();
        assert!(config.max_workers > 0);
        assert!(config.worker_timeout.as_secs() > 0);
    }

    #[test]
    fn env_override_takes_precedence() {
        std::env::set_var("SID_MAX_WORKERS", "16");
        let config = DaemonConfig::from_env();
        assert_eq!(config.max_workers, 16);
        std::env::remove_var("SID_MAX_WORKERS");
    }
}
