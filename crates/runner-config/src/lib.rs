#![warn(missing_docs)]

//! # runner-config
//!
//! Configuration loading for the automation script runner.
//!
//! Settings come from an optional TOML file with `${ENV_VAR}` expansion,
//! then a fixed set of environment variables override individual values.
//!
//! ## Example
//!
//! ```toml
//! [server]
//! port = 3000
//! host = "0.0.0.0"
//!
//! [sandbox]
//! timeout_ms = 30000
//! init_timeout_ms = 5000
//! max_heap_mb = 128
//!
//! [api]
//! base_url = "${API_BASE_URL}"
//!
//! [toolchain]
//! npm = "npm"
//! sourcemap = false
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "RUNNER_CONFIG";

/// File looked up in the working directory when no explicit path is given.
pub const DEFAULT_CONFIG_FILE: &str = "runner.toml";

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level service configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    /// HTTP listener settings.
    #[serde(default)]
    pub server: ServerSection,

    /// Sandbox execution limits.
    #[serde(default)]
    pub sandbox: SandboxSection,

    /// Workspace API settings.
    #[serde(default)]
    pub api: ApiSection,

    /// External build toolchain settings.
    #[serde(default)]
    pub toolchain: ToolchainSection,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    /// TCP port.
    pub port: u16,
    /// Bind address.
    pub host: String,
    /// Maximum request body size in megabytes.
    pub body_limit_mb: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: 3000,
            host: "0.0.0.0".into(),
            body_limit_mb: 10,
        }
    }
}

/// Sandbox execution limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SandboxSection {
    /// Deadline for the entry point, in milliseconds.
    pub timeout_ms: u64,
    /// Deadline for bootstrap and the bundle's top-level code, in milliseconds.
    pub init_timeout_ms: u64,
    /// V8 heap ceiling in megabytes.
    pub max_heap_mb: usize,
    /// Maximum isolates alive at once.
    pub max_concurrent: usize,
    /// Maximum `fetch` calls per execution.
    pub max_fetch_calls: usize,
    /// Maximum serialized result size in megabytes.
    pub max_output_mb: usize,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            init_timeout_ms: 5_000,
            max_heap_mb: 128,
            max_concurrent: 8,
            max_fetch_calls: 50,
            max_output_mb: 10,
        }
    }
}

/// Workspace API settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApiSection {
    /// Base URL the API capability talks to.
    pub base_url: String,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".into(),
        }
    }
}

/// External build toolchain settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolchainSection {
    /// Program used for `install` and `run build`.
    pub npm: String,
    /// Program used to fetch and run the TypeScript compiler.
    pub npx: String,
    /// Emit `dist/bundle.js.map` next to the bundle.
    pub sourcemap: bool,
    /// Kill a toolchain step after this many seconds.
    pub step_timeout_secs: Option<u64>,
    /// Run `tsc --noEmit` as part of `/validate`.
    pub typecheck_on_validate: bool,
}

impl Default for ToolchainSection {
    fn default() -> Self {
        Self {
            npm: "npm".into(),
            npx: "npx".into(),
            sourcemap: false,
            step_timeout_secs: None,
            typecheck_on_validate: false,
        }
    }
}

impl ServiceConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: ServiceConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(toml_str);
        Self::from_toml(&expanded)
    }

    /// Load config from a file path, expanding environment variables.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_with_env(&content)
    }

    /// Load the effective configuration for the running process.
    ///
    /// Reads the file named by `RUNNER_CONFIG` (which must exist), or
    /// `./runner.toml` when present, or falls back to defaults. Environment
    /// overrides are applied last and the result is validated again.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match find_config_file() {
            Some(path) => {
                tracing::info!(path = %path.display(), "loading config file");
                Self::from_file_with_env(&path)?
            }
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply the environment overrides through `lookup`.
    ///
    /// Recognized keys: `PORT`, `EXECUTION_TIMEOUT_MS`, `INIT_TIMEOUT_MS`,
    /// `MEMORY_LIMIT_MB`, `API_BASE_URL`. Empty values are ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("PORT") {
            self.server.port = parse_env("PORT", &v)?;
        }
        if let Some(v) = get("EXECUTION_TIMEOUT_MS") {
            self.sandbox.timeout_ms = parse_env("EXECUTION_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("INIT_TIMEOUT_MS") {
            self.sandbox.init_timeout_ms = parse_env("INIT_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("MEMORY_LIMIT_MB") {
            self.sandbox.max_heap_mb = parse_env("MEMORY_LIMIT_MB", &v)?;
        }
        if let Some(v) = get("API_BASE_URL") {
            self.api.base_url = v;
        }
        Ok(())
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.sandbox;
        if s.timeout_ms == 0 {
            return Err(ConfigError::Invalid("sandbox.timeout_ms must be > 0".into()));
        }
        if s.init_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "sandbox.init_timeout_ms must be > 0".into(),
            ));
        }
        if s.init_timeout_ms >= s.timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "sandbox.init_timeout_ms ({}) must be less than sandbox.timeout_ms ({})",
                s.init_timeout_ms, s.timeout_ms
            )));
        }
        if s.max_heap_mb == 0 {
            return Err(ConfigError::Invalid("sandbox.max_heap_mb must be > 0".into()));
        }
        if s.max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "sandbox.max_concurrent must be > 0".into(),
            ));
        }
        if s.max_output_mb == 0 {
            return Err(ConfigError::Invalid("sandbox.max_output_mb must be > 0".into()));
        }
        if self.server.body_limit_mb == 0 {
            return Err(ConfigError::Invalid(
                "server.body_limit_mb must be > 0".into(),
            ));
        }
        if !(self.api.base_url.starts_with("http://") || self.api.base_url.starts_with("https://"))
        {
            return Err(ConfigError::Invalid(format!(
                "api.base_url must be an http(s) URL, got '{}'",
                self.api.base_url
            )));
        }
        if self.toolchain.npm.trim().is_empty() || self.toolchain.npx.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "toolchain.npm and toolchain.npx must not be empty".into(),
            ));
        }
        if self.toolchain.step_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "toolchain.step_timeout_secs must be > 0 when set".into(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{key}: cannot parse '{value}'")))
}

/// Locate the config file: `$RUNNER_CONFIG` first, then `./runner.toml`.
pub fn find_config_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    let local = PathBuf::from(DEFAULT_CONFIG_FILE);
    local.is_file().then_some(local)
}

/// Expand `${ENV_VAR}` patterns in a string using environment variables.
///
/// Unknown variables are left in place.
pub fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(value) => result.push_str(&value),
                    Err(_) => {
                        result.push_str("${");
                        result.push_str(name);
                        result.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                // unterminated, keep as-is
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    result.push_str(rest);
    result
}
