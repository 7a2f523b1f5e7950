//! Settings from the optional config file, overridden by the command line.

use core::time::Duration;
use std::{fs, path::Path};

use covmap::{executors::ExecutorConfig, Error};
use serde::{Deserialize, Serialize};

/// Used when neither the config file nor the command line sets a timeout
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// The contents of a `--config` file.
///
/// ```toml
/// timeout_ms = 500
///
/// [executor]
/// isolate_env = true
/// env = { ASAN_OPTIONS = "abort_on_error=1" }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    /// Deadline per run in milliseconds, `0` disables it
    pub timeout_ms: Option<u64>,
    /// Passed to the executor as is, apart from what the flags override
    pub executor: ExecutorConfig,
}

impl FileConfig {
    /// Parse a config file
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text).map_err(|err| {
            Error::serialize(format!("Invalid config file {}: {err}", path.display()))
        })
    }

    fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}

/// What one run actually uses, after layering
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub executor: ExecutorConfig,
    pub timeout: Option<Duration>,
}

impl Settings {
    /// Layer the command line over `file`. `quiet` decides whether the target's output is shown.
    #[must_use]
    pub fn layer(file: FileConfig, timeout_ms: Option<u64>, quiet: bool) -> Self {
        let mut executor = file.executor;
        executor.debug_child = !quiet;

        let timeout = match timeout_ms.or(file.timeout_ms).unwrap_or(DEFAULT_TIMEOUT_MS) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        Self { executor, timeout }
    }
}
