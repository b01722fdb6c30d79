//! Session configuration.
//!
//! Defaults suit an interactive editor. Every field can be overridden from
//! the environment via [`SessionConfig::from_env`].

use std::path::PathBuf;
use std::time::Duration;

use log::warn;

pub const DEFAULT_KERNEL_ENV: &str = "RUNT_DEFAULT_KERNEL";
pub const STARTUP_DELAY_ENV: &str = "RUNT_KERNEL_STARTUP_MS";
pub const KERNEL_INFO_TIMEOUT_ENV: &str = "RUNT_KERNEL_INFO_TIMEOUT_SECS";
pub const SHUTDOWN_TIMEOUT_ENV: &str = "RUNT_SHUTDOWN_TIMEOUT_SECS";
pub const RUNTIME_DIR_ENV: &str = "RUNT_RUNTIME_DIR";

/// Kernel name preferred when nothing is configured.
pub const FALLBACK_KERNEL: &str = "python3";

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Kernel spec to use when the caller does not name one.
    pub default_kernel: Option<String>,
    /// Pause after spawning a kernel before connecting its sockets.
    pub startup_delay: Duration,
    /// How long to wait for the `kernel_info_reply` handshake.
    pub kernel_info_timeout: Duration,
    /// How long to wait for a `shutdown_reply` before killing the process.
    pub shutdown_timeout: Duration,
    /// Directory for connection files (default: the Jupyter runtime dir).
    pub runtime_dir: Option<PathBuf>,
    /// Capacity of the inbound transport queue per session.
    pub inbound_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_kernel: None,
            startup_delay: Duration::from_millis(500),
            kernel_info_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(5),
            runtime_dir: None,
            inbound_capacity: 256,
        }
    }
}

impl SessionConfig {
    /// Build a configuration from defaults overridden by `RUNT_*` variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(name) = env_string(DEFAULT_KERNEL_ENV) {
            config.default_kernel = Some(name);
        }
        if let Some(ms) = env_number(STARTUP_DELAY_ENV) {
            config.startup_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = env_number(KERNEL_INFO_TIMEOUT_ENV) {
            config.kernel_info_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_number(SHUTDOWN_TIMEOUT_ENV) {
            config.shutdown_timeout = Duration::from_secs(secs);
        }
        if let Some(dir) = env_string(RUNTIME_DIR_ENV) {
            config.runtime_dir = Some(PathBuf::from(dir));
        }

        config
    }

    /// Directory where connection files are written.
    pub fn runtime_dir(&self) -> PathBuf {
        self.runtime_dir
            .clone()
            .unwrap_or_else(runtimelib::dirs::runtime_dir)
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_number(key: &str) -> Option<u64> {
    let raw = env_string(key)?;
    match raw.parse::<u64>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("[config] Ignoring {}={:?}: not a number", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            DEFAULT_KERNEL_ENV,
            STARTUP_DELAY_ENV,
            KERNEL_INFO_TIMEOUT_ENV,
            SHUTDOWN_TIMEOUT_ENV,
            RUNTIME_DIR_ENV,
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_from_env_without_overrides_matches_default() {
        clear_env();
        assert_eq!(SessionConfig::from_env(), SessionConfig::default());
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        clear_env();
        let tmp = tempfile::TempDir::new().unwrap();
        std::env::set_var(DEFAULT_KERNEL_ENV, "deno");
        std::env::set_var(STARTUP_DELAY_ENV, "10");
        std::env::set_var(SHUTDOWN_TIMEOUT_ENV, "1");
        std::env::set_var(RUNTIME_DIR_ENV, tmp.path());

        let config = SessionConfig::from_env();
        clear_env();

        assert_eq!(config.default_kernel.as_deref(), Some("deno"));
        assert_eq!(config.startup_delay, Duration::from_millis(10));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
        assert_eq!(config.kernel_info_timeout, Duration::from_secs(30));
        assert_eq!(config.runtime_dir(), tmp.path().to_path_buf());
    }

    #[test]
    #[serial]
    fn test_invalid_number_falls_back_to_default() {
        clear_env();
        std::env::set_var(KERNEL_INFO_TIMEOUT_ENV, "soon");
        std::env::set_var(DEFAULT_KERNEL_ENV, "   ");

        let config = SessionConfig::from_env();
        clear_env();

        assert_eq!(config.kernel_info_timeout, Duration::from_secs(30));
        assert!(config.default_kernel.is_none());
    }
}
