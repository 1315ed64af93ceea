//! Configuration loading
//!
//! Settings come from an optional TOML file merged over defaults. The
//! binary looks for `wiretap.toml` in the working directory, then under
//! the platform config directory, unless an explicit path is given.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const CONFIG_FILE: &str = "wiretap.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WiretapConfig {
    /// Directories scanned for plugin manifests.
    pub plugin_dirs: Vec<PathBuf>,
    /// Where the bundled JSONL store writes records.
    pub store_path: PathBuf,
    /// Session identifier stamped into event metadata. Generated per run
    /// when empty.
    pub session_id: String,
    /// Records per persistence batch.
    pub batch_size: usize,
    /// Period of the queue's time trigger.
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
    /// Bound on concurrent persistence flushes.
    pub max_concurrent_flushes: Option<usize>,
    /// Additional attempts for a failing batch.
    pub retry_attempts: u32,
    /// Backoff base between attempts.
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Event-bus replay buffer size; disabled when absent.
    pub replay_buffer: Option<usize>,
}

impl Default for WiretapConfig {
    fn default() -> Self {
        Self {
            plugin_dirs: default_plugin_dirs(),
            store_path: PathBuf::from("wiretap-records.jsonl"),
            session_id: String::new(),
            batch_size: 100,
            flush_interval: Duration::from_secs(5),
            max_concurrent_flushes: None,
            retry_attempts: 3,
            retry_delay: Duration::from_millis(100),
            replay_buffer: None,
        }
    }
}

impl WiretapConfig {
    /// Load configuration from `path`, or from the default search
    /// locations when `path` is `None`. Missing files yield defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let candidate = match path {
            Some(path) => Some(path.to_path_buf()),
            None => default_config_paths().into_iter().find(|p| p.exists()),
        };

        match candidate {
            Some(path) if path.exists() => {
                debug!(path = %path.display(), "loading configuration");
                let content = std::fs::read_to_string(&path)?;
                Ok(toml::from_str(&content)?)
            }
            Some(path) => Err(crate::error::Error::Config(format!(
                "configuration file {} does not exist",
                path.display()
            ))),
            None => {
                debug!("no configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }
}

fn default_plugin_dirs() -> Vec<PathBuf> {
    let mut dirs = vec![PathBuf::from(".wiretap/plugins")];
    if let Some(home) = dirs::home_dir() {
        dirs.push(home.join(".wiretap/plugins"));
    }
    dirs
}

fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(CONFIG_FILE)];
    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("wiretap").join("config.toml"));
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_a_file() {
        let config = WiretapConfig::default();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.flush_interval, Duration::from_secs(5));
        assert_eq!(config.retry_attempts, 3);
        assert!(config.max_concurrent_flushes.is_none());
    }

    #[test]
    fn partial_file_merges_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            "batch_size = 10\nflush_interval = \"250ms\"\nreplay_buffer = 64\n",
        )
        .unwrap();

        let config = WiretapConfig::load(Some(&path)).unwrap();
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.flush_interval, Duration::from_millis(250));
        assert_eq!(config.replay_buffer, Some(64));
        // Untouched fields keep their defaults.
        assert_eq!(config.retry_attempts, 3);
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let result = WiretapConfig::load(Some(Path::new("/nonexistent/wiretap.toml")));
        assert!(result.is_err());
    }
}
