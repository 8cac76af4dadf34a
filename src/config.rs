use crate::parallel::ThreadingBackend;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

pub const THREADING_ENV: &str = "WHISPER_CPU_THREADING";
pub const NUM_THREADS_ENV: &str = "WHISPER_CPU_NUM_THREADS";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value {1:?} for {0}")]
    InvalidValue(&'static str, String),
    #[error("Worker count must be positive")]
    ZeroWorkers,
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

/// Process-wide execution settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub threading: ThreadingBackend,
    /// `None` sizes pools to the available hardware concurrency.
    pub num_threads: Option<usize>,
}

impl RuntimeConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Applies `WHISPER_CPU_*` overrides looked up through `lookup`.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(value) = lookup(THREADING_ENV) {
            self.threading = ThreadingBackend::from_str(value.trim())
                .map_err(|_| ConfigError::InvalidValue(THREADING_ENV, value.clone()))?;
        }
        if let Some(value) = lookup(NUM_THREADS_ENV) {
            let n = value
                .trim()
                .parse::<usize>()
                .map_err(|_| ConfigError::InvalidValue(NUM_THREADS_ENV, value.clone()))?;
            self.num_threads = Some(n);
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.num_threads == Some(0) {
            return Err(ConfigError::ZeroWorkers);
        }
        Ok(())
    }
}
