//! Manager configuration (`luathread.toml`).

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ThreadError;

/// Which runtime capability a worker is built with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    /// Scripts get the `thread` table (shared store, refs, flush, log).
    #[default]
    ThreadAware,
    /// Bare interpreter with captured `print` only.
    Default,
}

/// Settings for one manager/worker pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Worker name; a random one is generated when absent.
    pub name: Option<String>,
    /// Deliver each output flush to the sink as it arrives.
    pub print_immediate: bool,
    /// Restart drops all interpreter state.
    pub reset_on_restart: bool,
    /// Dropping the manager lets in-flight work finish instead of
    /// interrupting it.
    pub clean_close: bool,
    pub runtime: RuntimeKind,
    /// Code run whenever a fresh interpreter state is created (start, and
    /// restarts with `reset_on_restart`).
    pub init_script: Option<String>,
    /// Instructions between checks for abrupt cancellation.
    pub interrupt_interval: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            name: None,
            print_immediate: false,
            reset_on_restart: false,
            clean_close: false,
            runtime: RuntimeKind::default(),
            init_script: None,
            interrupt_interval: default_interrupt_interval(),
        }
    }
}

fn default_interrupt_interval() -> u32 {
    1000
}

impl ManagerConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ThreadError> {
        let config: ManagerConfig =
            toml::from_str(source).map_err(|e| ThreadError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ThreadError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| ThreadError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<(), ThreadError> {
        if self.interrupt_interval == 0 {
            return Err(ThreadError::Config(
                "interrupt_interval must be greater than zero".to_string(),
            ));
        }
        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err(ThreadError::Config("name must not be empty".to_string()));
            }
        }
        Ok(())
    }
}
