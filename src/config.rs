// ABOUTME: Engine configuration loaded from an optional TOML file and environment overrides
// ABOUTME: Holds supervisor thresholds, batch sizing, tool paths and target-service credentials

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub output_warning_secs: u64,
    pub stuck_secs: u64,
    pub kill_secs: u64,
    pub max_runtime_secs: u64,
    pub monitor_interval_secs: u64,
    pub kill_grace_secs: u64,
    /// CPU usage below this percentage counts as idle.
    pub idle_cpu_percent: f64,

    pub batch_size: u64,
    pub min_batch_size: u64,
    pub low_memory_mb: u64,
    pub critical_memory_mb: u64,
    pub checkpoint_every: u64,
    pub progress_every: u64,
    pub shallow_revisions: u64,
    pub sync_lookback_revisions: u64,
    pub stale_lock_secs: u64,

    pub git_binary: String,
    pub svn_binary: String,
    pub database_path: PathBuf,
    pub target: TargetConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub api_url: Option<String>,
    pub token: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output_warning_secs: 300,
            stuck_secs: 900,
            kill_secs: 1800,
            max_runtime_secs: 2 * 60 * 60,
            monitor_interval_secs: 15,
            kill_grace_secs: 10,
            idle_cpu_percent: 1.0,
            batch_size: 100,
            min_batch_size: 1,
            low_memory_mb: 512,
            critical_memory_mb: 256,
            checkpoint_every: 50,
            progress_every: 5,
            shallow_revisions: 10,
            sync_lookback_revisions: 100,
            stale_lock_secs: 600,
            git_binary: "git".to_string(),
            svn_binary: "svn".to_string(),
            database_path: PathBuf::from("migrator.db"),
            target: TargetConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Loads the file if given, then applies `MIGRATOR_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                toml::from_str(&text)
                    .with_context(|| format!("Failed to parse config file {}", path.display()))?
            }
            None => EngineConfig::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        fn number(key: &str, value: String) -> Result<u64> {
            value
                .trim()
                .parse()
                .with_context(|| format!("{} must be a whole number, got '{}'", key, value))
        }

        if let Some(v) = lookup("MIGRATOR_OUTPUT_WARNING_SECS") {
            self.output_warning_secs = number("MIGRATOR_OUTPUT_WARNING_SECS", v)?;
        }
        if let Some(v) = lookup("MIGRATOR_STUCK_SECS") {
            self.stuck_secs = number("MIGRATOR_STUCK_SECS", v)?;
        }
        if let Some(v) = lookup("MIGRATOR_KILL_SECS") {
            self.kill_secs = number("MIGRATOR_KILL_SECS", v)?;
        }
        if let Some(v) = lookup("MIGRATOR_MAX_RUNTIME_SECS") {
            self.max_runtime_secs = number("MIGRATOR_MAX_RUNTIME_SECS", v)?;
        }
        if let Some(v) = lookup("MIGRATOR_BATCH_SIZE") {
            self.batch_size = number("MIGRATOR_BATCH_SIZE", v)?;
        }
        if let Some(v) = lookup("MIGRATOR_GIT") {
            self.git_binary = v;
        }
        if let Some(v) = lookup("MIGRATOR_SVN") {
            self.svn_binary = v;
        }
        if let Some(v) = lookup("MIGRATOR_DATABASE") {
            self.database_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("MIGRATOR_TARGET_URL") {
            self.target.api_url = Some(v);
        }
        if let Some(v) = lookup("MIGRATOR_TARGET_TOKEN") {
            self.target.token = Some(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.output_warning_secs > self.stuck_secs || self.stuck_secs > self.kill_secs {
            bail!(
                "Output thresholds must satisfy warning <= stuck <= kill (got {} / {} / {})",
                self.output_warning_secs,
                self.stuck_secs,
                self.kill_secs
            );
        }
        if self.batch_size == 0 || self.min_batch_size == 0 {
            bail!("Batch sizes must be at least 1");
        }
        if self.min_batch_size > self.batch_size {
            bail!(
                "min_batch_size ({}) cannot exceed batch_size ({})",
                self.min_batch_size,
                self.batch_size
            );
        }
        if self.critical_memory_mb > self.low_memory_mb {
            bail!("critical_memory_mb cannot exceed low_memory_mb");
        }
        if self.monitor_interval_secs == 0 {
            bail!("monitor_interval_secs must be at least 1");
        }
        Ok(())
    }

    pub fn supervisor_limits(&self) -> SupervisorLimits {
        SupervisorLimits {
            monitor_interval: Duration::from_secs(self.monitor_interval_secs),
            warning_after: Duration::from_secs(self.output_warning_secs),
            stuck_after: Duration::from_secs(self.stuck_secs),
            kill_after: Duration::from_secs(self.kill_secs),
            max_runtime: Duration::from_secs(self.max_runtime_secs),
            kill_grace: Duration::from_secs(self.kill_grace_secs),
            idle_cpu_percent: self.idle_cpu_percent,
        }
    }
}

/// Timeouts enforced on every supervised child process.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorLimits {
    pub monitor_interval: Duration,
    pub warning_after: Duration,
    pub stuck_after: Duration,
    pub kill_after: Duration,
    pub max_runtime: Duration,
    pub kill_grace: Duration,
    pub idle_cpu_percent: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("MIGRATOR_BATCH_SIZE", "25"),
            ("MIGRATOR_STUCK_SECS", "600"),
            ("MIGRATOR_TARGET_TOKEN", "glpat-123"),
        ]
        .into_iter()
        .collect();

        let mut config = EngineConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.stuck_secs, 600);
        assert_eq!(config.target.token.as_deref(), Some("glpat-123"));
    }

    #[test]
    fn test_bad_override_is_rejected() {
        let mut config = EngineConfig::default();
        let result = config.apply_overrides(|key| {
            (key == "MIGRATOR_KILL_SECS").then(|| "soon".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_threshold_order_is_validated() {
        let config = EngineConfig {
            output_warning_secs: 1000,
            stuck_secs: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_partial_file() {
        let config: EngineConfig = toml::from_str(
            r#"
            batch_size = 40
            [target]
            api_url = "https://gitlab.example.com/api/v4"
            "#,
        )
        .unwrap();
        assert_eq!(config.batch_size, 40);
        assert_eq!(config.kill_secs, 1800);
        assert_eq!(
            config.target.api_url.as_deref(),
            Some("https://gitlab.example.com/api/v4")
        );
    }
}
