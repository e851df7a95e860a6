//! Tool configuration (`stax.toml`).
//!
//! An optional manifest in the working directory supplies defaults for
//! the output path and the interpreter's limits; command-line flags win
//! over it.

use serde::Deserialize;
use std::path::Path;

use crate::vm;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuildConfig {
    /// Default output path for `asm` when `-o` is not given.
    pub output: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Size of the flat memory region in bytes.
    #[serde(default = "default_memory_size")]
    pub memory_size: usize,
    /// Operand stack capacity in bytes.
    #[serde(default = "default_stack_size")]
    pub stack_size: usize,
}

fn default_memory_size() -> usize {
    vm::DEFAULT_MEMORY_SIZE
}

fn default_stack_size() -> usize {
    vm::DEFAULT_STACK_SIZE
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            memory_size: default_memory_size(),
            stack_size: default_stack_size(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            build: BuildConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

impl Config {
    /// Load `stax.toml` from `dir`; a missing file yields the defaults.
    pub fn load(dir: &Path) -> Result<Self, String> {
        let path = dir.join("stax.toml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|e| format!("failed to read stax.toml: {}", e))?;
        toml::from_str(&content).map_err(|e| format!("failed to parse stax.toml: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_manifest_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.runtime.memory_size, vm::DEFAULT_MEMORY_SIZE);
        assert_eq!(config.runtime.stack_size, vm::DEFAULT_STACK_SIZE);
        assert!(config.build.output.is_none());
    }

    #[test]
    fn test_partial_manifest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("stax.toml"),
            "[build]\noutput = \"out.bin\"\n\n[runtime]\nmemory_size = 8192\n",
        )
        .unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.build.output.as_deref(), Some("out.bin"));
        assert_eq!(config.runtime.memory_size, 8192);
        assert_eq!(config.runtime.stack_size, vm::DEFAULT_STACK_SIZE);
    }

    #[test]
    fn test_malformed_manifest_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stax.toml"), "not toml [").unwrap();
        assert!(Config::load(dir.path()).is_err());
    }
}
