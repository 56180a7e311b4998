// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
    #[error("Error accessing {0}: {1}")]
    IO(String, #[source] std::io::Error),
    #[error("Error (de)serializing {0}: {1}")]
    Yaml(String, #[source] serde_yaml::Error),
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BlockExecutorConfig {
    /// Number of workers executing a block. 1 executes the block sequentially.
    pub concurrency_level: usize,
    /// Upper bound on a single wait for address ownership or for a commit turn. A wait that
    /// exceeds it fails the block. Waits are unbounded when unset.
    pub wait_timeout_ms: Option<u64>,
}

impl Default for BlockExecutorConfig {
    fn default() -> Self {
        Self {
            concurrency_level: num_cpus::get(),
            wait_timeout_ms: None,
        }
    }
}

impl BlockExecutorConfig {
    pub fn new(concurrency_level: usize) -> Self {
        Self {
            concurrency_level,
            ..Default::default()
        }
    }

    pub fn with_wait_timeout_ms(mut self, wait_timeout_ms: u64) -> Self {
        self.wait_timeout_ms = Some(wait_timeout_ms);
        self
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_ms.map(Duration::from_millis)
    }

    pub fn sanitize(&self) -> Result<(), ConfigError> {
        if self.concurrency_level == 0 {
            return Err(ConfigError::InvariantViolation(
                "concurrency_level must be greater than 0".to_string(),
            ));
        }
        if self.wait_timeout_ms == Some(0) {
            return Err(ConfigError::InvariantViolation(
                "wait_timeout_ms must be greater than 0 when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Loads and sanitizes the config from a YAML file.
    pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_string = path.as_ref().display().to_string();
        let contents =
            fs::read_to_string(&path).map_err(|error| ConfigError::IO(path_string, error))?;
        Self::parse_serialized_config(&contents)
    }

    pub fn parse_serialized_config(serialized_config: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(serialized_config)
            .map_err(|error| ConfigError::Yaml("block executor config".to_string(), error))?;
        config.sanitize()?;
        Ok(config)
    }
}
