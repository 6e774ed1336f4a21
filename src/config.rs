use crate::error::ExecutorError;
use serde::{Deserialize, Serialize};
use std::{
    fs::{read_to_string, write},
    path::PathBuf,
    time::Duration,
};

/// Default file name for [`TomlConfigProvider`] when none is given on the command line.
pub const CONFIG_FILE_NAME: &str = "kexec.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Directory that document paths in requests are relative to.
    pub root_dir: PathBuf,
    /// SQLite identity store location. `None` disables rename tracking entirely.
    pub db_path: Option<PathBuf>,
    /// Debounce window for writing execution output back into documents.
    pub write_debounce_ms: u64,
    /// Batching window of the filesystem watcher.
    pub watch_debounce_ms: u64,
    /// Interpreter command for process kernels. The code is appended as the last argument.
    pub kernel_argv: Vec<String>,
    pub bind: String,
    pub port: u16,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            root_dir: PathBuf::from("."),
            db_path: None,
            write_debounce_ms: 300,
            watch_debounce_ms: 100,
            kernel_argv: vec!["python3".to_string(), "-u".to_string(), "-c".to_string()],
            bind: "127.0.0.1".to_string(),
            port: 8888,
        }
    }
}

impl ExecutorConfig {
    pub fn write_debounce(&self) -> Duration {
        Duration::from_millis(self.write_debounce_ms)
    }

    pub fn watch_debounce(&self) -> Duration {
        Duration::from_millis(self.watch_debounce_ms)
    }

    pub fn file_ids_enabled(&self) -> bool {
        self.db_path.is_some()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TomlConfigProvider {
    path: PathBuf,
}

impl TomlConfigProvider {
    pub fn new(path: PathBuf) -> Self {
        TomlConfigProvider { path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn load(&self) -> Result<ExecutorConfig, ExecutorError> {
        tracing::debug!("Attempting to read executor config from: {:?}", &self.path);
        if !self.path.exists() {
            tracing::debug!("Config file not found, using defaults.");
            return Ok(ExecutorConfig::default());
        }
        let content = read_to_string(&self.path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn store(&self, config: &ExecutorConfig) -> Result<(), ExecutorError> {
        tracing::debug!("Attempting to write executor config to: {:?}", &self.path);
        let toml_string = toml::to_string(config)?;
        write(&self.path, toml_string)?;
        Ok(())
    }
}
