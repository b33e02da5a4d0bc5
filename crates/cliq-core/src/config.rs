//! Configuration resolution for cliq.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/cliq/settings.json)
//! 3. Project config (.cliq/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};

/// Complete cliq configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub session: SessionSettings,
}

/// Scheduler tunables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerSettings {
    pub max_concurrent_sessions: usize,
    /// Hard per-item timeout, enforced by the session host.
    pub item_timeout_secs: Option<u64>,
    /// Consecutive session spawn failures before the run is halted.
    pub max_consecutive_spawn_failures: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 2,
            item_timeout_secs: None,
            max_consecutive_spawn_failures: 3,
        }
    }
}

/// Terminal session defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionSettings {
    pub shell: String,
    /// Bytes of output retained per session for replay.
    pub scrollback_limit: usize,
    pub input_flush_interval_ms: u64,
    pub cols: u16,
    pub rows: u16,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            shell: std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string()),
            scrollback_limit: 256 * 1024,
            input_flush_interval_ms: 30,
            cols: 120,
            rows: 32,
        }
    }
}

impl Config {
    /// Collect every problem with this config. Empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.scheduler.max_concurrent_sessions < 1 {
            errors.push("scheduler.max_concurrent_sessions must be at least 1".to_string());
        }
        if self.scheduler.max_consecutive_spawn_failures < 1 {
            errors.push("scheduler.max_consecutive_spawn_failures must be at least 1".to_string());
        }
        if self.scheduler.item_timeout_secs == Some(0) {
            errors.push("scheduler.item_timeout_secs must be positive when set".to_string());
        }
        if self.session.shell.trim().is_empty() {
            errors.push("session.shell must not be empty".to_string());
        }
        if self.session.scrollback_limit == 0 {
            errors.push("session.scrollback_limit must be positive".to_string());
        }
        if self.session.cols == 0 || self.session.rows == 0 {
            errors.push("session.cols and session.rows must be positive".to_string());
        }
        errors
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        config = load_config_file(&global_path)?;
        debug!(path = %global_path.display(), "Loaded global config");
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".cliq").join("settings.json");
        if project_path.exists() {
            let project = load_overlay_file(&project_path)?;
            merge_config(&mut config, &project);
            debug!(path = %project_path.display(), "Merged project config");
        }
    }

    apply_env_overrides(&mut config);

    let errors = config.validate();
    if !errors.is_empty() {
        return Err(Error::Config(errors.join("; ")));
    }
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("cliq").join("settings.json"))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = read_file(path)?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn load_overlay_file(path: &Path) -> Result<serde_json::Value> {
    let content = read_file(path)?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })
}

/// Overlay only the keys present in `overlay`, so a project file that sets a
/// single field does not reset the global file's other fields to defaults.
fn merge_config(base: &mut Config, overlay: &serde_json::Value) {
    let Ok(mut merged) = serde_json::to_value(&*base) else {
        return;
    };
    merge_values(&mut merged, overlay);
    if let Ok(config) = serde_json::from_value(merged) {
        *base = config;
    }
}

fn merge_values(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("CLIQ_MAX_CONCURRENT_SESSIONS")
        && let Ok(n) = val.parse()
    {
        config.scheduler.max_concurrent_sessions = n;
    }
    if let Ok(val) = std::env::var("CLIQ_ITEM_TIMEOUT_SECS")
        && let Ok(n) = val.parse()
    {
        config.scheduler.item_timeout_secs = Some(n);
    }
    if let Ok(val) = std::env::var("CLIQ_SHELL") {
        config.session.shell = val;
    }
    if let Ok(val) = std::env::var("CLIQ_SCROLLBACK_LIMIT")
        && let Ok(n) = val.parse()
    {
        config.session.scrollback_limit = n;
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_empty());
        assert_eq!(config.session.input_flush_interval_ms, 30);
        assert_eq!(config.scheduler.max_concurrent_sessions, 2);
    }

    #[test]
    fn validate_reports_every_problem() {
        let mut config = Config::default();
        config.scheduler.max_concurrent_sessions = 0;
        config.session.scrollback_limit = 0;
        let errors = config.validate();
        assert_eq!(errors.len(), 2, "{errors:?}");
        assert!(errors[0].contains("max_concurrent_sessions"));
    }

    #[test]
    fn partial_file_fills_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"scheduler":{"max_concurrent_sessions":4}}"#).unwrap();
        assert_eq!(config.scheduler.max_concurrent_sessions, 4);
        assert_eq!(config.scheduler.max_consecutive_spawn_failures, 3);
        assert_eq!(config.session.cols, 120);
    }

    #[test]
    fn project_overlay_keeps_unset_fields() {
        let mut base = Config::default();
        base.scheduler.max_concurrent_sessions = 6;
        base.session.cols = 200;

        let overlay = serde_json::json!({ "session": { "rows": 50 } });
        merge_config(&mut base, &overlay);

        assert_eq!(base.scheduler.max_concurrent_sessions, 6);
        assert_eq!(base.session.cols, 200);
        assert_eq!(base.session.rows, 50);
    }

    #[test]
    fn project_file_is_read() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".cliq")).unwrap();
        std::fs::write(
            dir.path().join(".cliq").join("settings.json"),
            r#"{"scheduler":{"max_consecutive_spawn_failures":7}}"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path())).unwrap();
        assert_eq!(config.scheduler.max_consecutive_spawn_failures, 7);
    }

    #[test]
    fn invalid_project_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".cliq")).unwrap();
        std::fs::write(dir.path().join(".cliq").join("settings.json"), "{not json").unwrap();

        let err = load_config(Some(dir.path())).unwrap_err().to_string();
        assert!(err.contains("Failed to parse"), "{err}");
    }
}
