use crate::constants::{DEFAULT_CHUNK_SIZE, DEFAULT_LOCK_INTERVAL_MS, DEFAULT_LOCK_RETRIES};
use crate::error::{PipelineError, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding one sub-directory per project kind
    pub projects_root: PathBuf,
    /// Rows per batch when streaming tables
    pub chunk_size: usize,
    pub lock: LockConfig,
    pub sample: SampleConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub retries: u32,
    pub retry_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SampleConfig {
    pub size: usize,
    pub seed: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: PathBuf,
    pub file_name: String,
    pub filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            projects_root: PathBuf::from("data/projects"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            lock: LockConfig::default(),
            sample: SampleConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            retries: DEFAULT_LOCK_RETRIES,
            retry_interval_ms: DEFAULT_LOCK_INTERVAL_MS,
        }
    }
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self { size: 1000, seed: 0 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            file_name: "mergeflow.log".to_string(),
            filter: "mergeflow=info".to_string(),
        }
    }
}

impl LockConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

impl Config {
    /// Load `mergeflow.toml` from the working directory if present, then apply
    /// environment overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("mergeflow.toml"))
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        let mut config = if config_path.exists() {
            let config_content = fs::read_to_string(config_path).map_err(|e| {
                PipelineError::Config(format!(
                    "Failed to read config file '{}': {}",
                    config_path.display(),
                    e
                ))
            })?;
            toml::from_str(&config_content)?
        } else {
            Config::default()
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(root) = std::env::var("MERGEFLOW_PROJECTS_ROOT") {
            self.projects_root = PathBuf::from(root);
        }
        if let Ok(dir) = std::env::var("MERGEFLOW_LOG_DIR") {
            self.logging.dir = PathBuf::from(dir);
        }
        if let Some(v) = env_number("MERGEFLOW_LOCK_RETRIES")? {
            self.lock.retries = v as u32;
        }
        if let Some(v) = env_number("MERGEFLOW_LOCK_INTERVAL_MS")? {
            self.lock.retry_interval_ms = v;
        }
        if let Some(v) = env_number("MERGEFLOW_CHUNK_SIZE")? {
            self.chunk_size = v as usize;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(PipelineError::Config("chunk_size must be positive".into()));
        }
        Ok(())
    }
}

fn env_number(key: &str) -> Result<Option<u64>> {
    match std::env::var(key) {
        Ok(v) => v
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| PipelineError::Config(format!("{}='{}': {}", key, v, e))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            projects_root = "/tmp/projects"
            [lock]
            retries = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.projects_root, PathBuf::from("/tmp/projects"));
        assert_eq!(config.lock.retries, 3);
        assert_eq!(config.lock.retry_interval_ms, DEFAULT_LOCK_INTERVAL_MS);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.logging.filter, "mergeflow=info");
    }

    #[test]
    fn test_zero_chunk_size_is_rejected() {
        let config = Config {
            chunk_size: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
