// src/config.rs

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Tunables for the supervisor's deadline/poll machinery. None of these gate
/// which features run; they are ambient knobs, loaded the way the host
/// library loads its own application configuration.
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone)]
pub struct SupervisorConfig {
    /// Grace period between `SIGTERM` and `SIGKILL` once a task's deadline
    /// has passed, in milliseconds.
    pub kill_timeout_ms: u64,

    /// Multiplex poll timeout used by the monitor loop, in milliseconds.
    pub poll_interval_ms: u64,

    /// Fraction (1–100) of a task's own timeout budgeted for sending it to
    /// a persistent child before the send itself is considered timed out.
    pub send_timeout_fraction_pct: u32,

    /// Assumed pipe atomic write size; frames at or under this size attempt
    /// a single non-blocking write before falling back to a poll loop.
    pub pipe_atomic_size: usize,

    /// Default per-task timeout, in milliseconds, used when a dequeued
    /// task carries none of its own.
    pub default_timeout_ms: u64,
}

impl SupervisorConfig {
    /// Loads configuration from compiled-in defaults, an optional
    /// `Settings.toml` / `Settings.<RUN_MODE>.toml` file pair, and an
    /// `APP__`-prefixed environment overlay.
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("kill_timeout_ms", 1000)?
            .set_default("poll_interval_ms", 100)?
            .set_default("send_timeout_fraction_pct", 50)?
            .set_default("pipe_atomic_size", 65536)?
            .set_default("default_timeout_ms", 30_000)?;

        let builder = builder.add_source(File::with_name("Settings").required(false));
        let builder =
            builder.add_source(File::with_name(&format!("Settings.{run_mode}")).required(false));
        let builder = builder.add_source(Environment::with_prefix("APP").separator("__"));

        builder.build()?.try_deserialize()
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.kill_timeout_ms == 0 {
            return Err("kill_timeout_ms must be greater than 0".into());
        }
        if self.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be greater than 0".into());
        }
        if self.send_timeout_fraction_pct == 0 || self.send_timeout_fraction_pct > 100 {
            return Err("send_timeout_fraction_pct must be in 1..=100".into());
        }
        if self.pipe_atomic_size == 0 {
            return Err("pipe_atomic_size must be greater than 0".into());
        }
        Ok(())
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// The slice of a task's own timeout budgeted for sending it to a
    /// persistent child.
    pub fn send_budget(&self, task_timeout: Duration) -> Duration {
        task_timeout * self.send_timeout_fraction_pct / 100
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig {
            kill_timeout_ms: 1000,
            poll_interval_ms: 100,
            send_timeout_fraction_pct: 50,
            pipe_atomic_size: 65536,
            default_timeout_ms: 30_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(SupervisorConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_kill_timeout_rejected() {
        let mut cfg = SupervisorConfig::default();
        cfg.kill_timeout_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn send_budget_is_half_by_default() {
        let cfg = SupervisorConfig::default();
        assert_eq!(
            cfg.send_budget(Duration::from_millis(1000)),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn settings_toml_overrides_compiled_in_defaults() {
        // Serialized: SupervisorConfig::new() reads the process-wide cwd
        // and RUN_MODE, both of which this test mutates.
        let _guard = CWD_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Settings.toml"), "kill_timeout_ms = 4242\n").unwrap();

        let original_cwd = env::current_dir().unwrap();
        env::set_current_dir(dir.path()).unwrap();
        let result = SupervisorConfig::new();
        env::set_current_dir(original_cwd).unwrap();

        let cfg = result.unwrap();
        assert_eq!(cfg.kill_timeout_ms, 4242);
    }

    static CWD_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
}
