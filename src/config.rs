//! Configuration value objects supplied by the settings collaborator.
//!
//! Everything here is validated at construction and never mutated by the
//! orchestrator.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Inclusive bounds for the server context window.
pub const CONTEXT_SIZE_MIN: u32 = 256;
pub const CONTEXT_SIZE_MAX: u32 = 4096;

/// Inclusive bounds for the inference thread count.
pub const THREAD_COUNT_MIN: u32 = 1;
pub const THREAD_COUNT_MAX: u32 = 256;

/// Default completion prompt template (llama instruct format).
pub const DEFAULT_PROMPT_TEMPLATE: &str = "[INST] {prompt} [/INST]";

/// Default infill template (CodeLlama fill-in-the-middle format).
pub const DEFAULT_INFILL_PROMPT_TEMPLATE: &str = "<PRE> {prefix} <SUF>{suffix} <MID>";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
    #[error("port must be non-zero")]
    InvalidPort,
}

/// Launch parameters for the inference server.
///
/// Supplied by the settings layer; the orchestrator only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Explicit model file path. `None` means "resolve from the catalog
    /// descriptor via the model store", which is how the orchestrator is
    /// normally driven.
    pub model_path: Option<PathBuf>,
    /// Context window size in tokens (256–4096)
    pub context_size: u32,
    /// Inference threads (1–256)
    pub thread_count: u32,
    /// Port the server listens on
    pub port: u16,
    /// Extra arguments appended to the server command line, in order
    pub extra_server_args: Vec<String>,
    /// Extra arguments appended to the build command line, in order
    pub extra_build_args: Vec<String>,
    /// Environment overlay for the build; wins over the process environment
    /// on key collision
    pub extra_env_vars: HashMap<String, String>,
    /// Completion prompt template
    pub prompt_template: String,
    /// Fill-in-the-middle prompt template
    pub infill_prompt_template: String,
}

impl ServerConfig {
    /// Create a validated configuration with default templates and no extras.
    pub fn new(context_size: u32, thread_count: u32, port: u16) -> Result<Self, ConfigError> {
        check_range(
            "contextSize",
            context_size,
            CONTEXT_SIZE_MIN,
            CONTEXT_SIZE_MAX,
        )?;
        check_range(
            "threadCount",
            thread_count,
            THREAD_COUNT_MIN,
            THREAD_COUNT_MAX,
        )?;
        if port == 0 {
            return Err(ConfigError::InvalidPort);
        }

        Ok(Self {
            model_path: None,
            context_size,
            thread_count,
            port,
            extra_server_args: Vec::new(),
            extra_build_args: Vec::new(),
            extra_env_vars: HashMap::new(),
            prompt_template: DEFAULT_PROMPT_TEMPLATE.to_string(),
            infill_prompt_template: DEFAULT_INFILL_PROMPT_TEMPLATE.to_string(),
        })
    }

    pub fn with_model_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.model_path = Some(path.into());
        self
    }

    pub fn with_server_args(mut self, args: Vec<String>) -> Self {
        self.extra_server_args = args;
        self
    }

    pub fn with_build_args(mut self, args: Vec<String>) -> Self {
        self.extra_build_args = args;
        self
    }

    pub fn with_env_vars(mut self, vars: HashMap<String, String>) -> Self {
        self.extra_env_vars = vars;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        // Bounds are compile-time constants; the defaults are inside them.
        Self::new(2048, 8, 8080).expect("default configuration is valid")
    }
}

fn check_range(field: &'static str, value: u32, min: u32, max: u32) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}

/// Knobs for the engine build and server process supervision.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// llama.cpp checkout; also the working directory for build and server
    pub engine_dir: PathBuf,
    /// Build command, `make` by default
    pub build_program: PathBuf,
    /// Compiled server binary, `<engine_dir>/server` by default
    pub server_binary: PathBuf,
    /// Build even when the server binary already exists
    pub rebuild: bool,
    /// Upper bound on waiting for the server to accept connections
    pub ready_timeout: Duration,
    /// Interval between readiness probes
    pub poll_interval: Duration,
    /// Wait after a graceful termination signal before force-killing
    pub grace_period: Duration,
}

impl EngineSettings {
    pub fn new(engine_dir: impl Into<PathBuf>) -> Self {
        let engine_dir = engine_dir.into();
        let server_binary = engine_dir.join("server");
        Self {
            engine_dir,
            build_program: PathBuf::from("make"),
            server_binary,
            rebuild: false,
            ready_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(250),
            grace_period: Duration::from_secs(2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_values_within_bounds() {
        let test_cases = vec![
            ("typical", 2048, 8, 8080),
            ("lower bounds", CONTEXT_SIZE_MIN, THREAD_COUNT_MIN, 1),
            ("upper bounds", CONTEXT_SIZE_MAX, THREAD_COUNT_MAX, u16::MAX),
        ];

        for (description, context, threads, port) in test_cases {
            let config = ServerConfig::new(context, threads, port);
            assert!(config.is_ok(), "{}: should be accepted", description);
        }
    }

    #[test]
    fn rejects_values_out_of_bounds() {
        let test_cases = vec![
            ("context too small", 255, 8, 8080),
            ("context too large", 4097, 8, 8080),
            ("zero threads", 2048, 0, 8080),
            ("too many threads", 2048, 257, 8080),
        ];

        for (description, context, threads, port) in test_cases {
            let config = ServerConfig::new(context, threads, port);
            assert!(
                matches!(config, Err(ConfigError::OutOfRange { .. })),
                "{}: should be rejected",
                description
            );
        }

        assert_eq!(
            ServerConfig::new(2048, 8, 0),
            Err(ConfigError::InvalidPort),
            "zero port should be rejected"
        );
    }

    #[test]
    fn default_config_is_valid_and_camel_case() {
        let config = ServerConfig::default();
        assert_eq!(config.context_size, 2048);
        assert_eq!(config.prompt_template, DEFAULT_PROMPT_TEMPLATE);

        let json = serde_json::to_value(&config).unwrap();
        assert!(json.get("contextSize").is_some());
        assert!(json.get("extraServerArgs").is_some());
        assert!(json.get("infillPromptTemplate").is_some());
    }

    #[test]
    fn engine_settings_defaults() {
        let engine = EngineSettings::new("/opt/llama.cpp");
        assert_eq!(engine.build_program, PathBuf::from("make"));
        assert_eq!(engine.server_binary, PathBuf::from("/opt/llama.cpp/server"));
        assert!(!engine.rebuild);
    }
}
