//! Logging setup
//!
//! Console and/or file output through `tracing-subscriber`. `RUST_LOG`
//! overrides the configured level when set.

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::layer::Layered;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

/// Path of the active log file, set by the first successful init.
static LOG_FILE_PATH: OnceCell<PathBuf> = OnceCell::new();

type BoxedLayer = Box<dyn Layer<Layered<EnvFilter, Registry>> + Send + Sync>;

/// Logging configuration, the `[logging]` table of the agent config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log to stderr
    #[serde(default = "default_true")]
    pub console_enabled: bool,

    /// Log to `file_path`
    #[serde(default)]
    pub file_enabled: bool,

    #[serde(default = "default_log_path")]
    pub file_path: String,

    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include file/line info
    #[serde(default)]
    pub file_info: bool,

    #[serde(default = "default_true")]
    pub show_target: bool,

    #[serde(default = "default_true")]
    pub ansi_colors: bool,

    #[serde(default = "default_level")]
    pub level: String,
}

fn default_true() -> bool {
    true
}

fn default_log_path() -> String {
    "hands-agent.log".to_string()
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console_enabled: true,
            file_enabled: false,
            file_path: default_log_path(),
            timestamps: true,
            file_info: false,
            show_target: true,
            ansi_colors: true,
            level: default_level(),
        }
    }
}

impl LogConfig {
    pub fn debug() -> Self {
        Self {
            level: "debug".to_string(),
            file_info: true,
            ..Default::default()
        }
    }

    /// File-only logging for an injected agent, which has no usable console.
    pub fn agent(path: impl Into<String>) -> Self {
        Self {
            console_enabled: false,
            file_enabled: true,
            file_path: path.into(),
            ansi_colors: false,
            ..Default::default()
        }
    }

    pub fn with_file(mut self, path: &str) -> Self {
        self.file_enabled = true;
        self.file_path = path.to_string();
        self
    }

    pub fn with_level(mut self, level: &str) -> Self {
        self.level = level.to_string();
        self
    }

    pub fn get_level(&self) -> Level {
        match self.level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" | "warning" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.get_level().as_str().to_lowercase()))
    }
}

/// Install the global subscriber described by `config`.
///
/// Only the first call in a process takes effect; later calls are no-ops.
/// A log file that cannot be opened is skipped rather than failing init.
pub fn init_logging(config: &LogConfig) {
    let mut layers: Vec<BoxedLayer> = Vec::new();

    if config.console_enabled {
        let layer = fmt::layer()
            .with_ansi(config.ansi_colors)
            .with_target(config.show_target)
            .with_file(config.file_info)
            .with_line_number(config.file_info)
            .with_writer(std::io::stderr);
        if config.timestamps {
            layers.push(layer.boxed());
        } else {
            layers.push(layer.without_time().boxed());
        }
    }

    let mut opened = None;
    if config.file_enabled && !config.file_path.is_empty() {
        if let Ok(file) = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.file_path)
        {
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(config.show_target)
                .with_file(config.file_info)
                .with_line_number(config.file_info)
                .with_writer(Arc::new(file));
            if config.timestamps {
                layers.push(layer.boxed());
            } else {
                layers.push(layer.without_time().boxed());
            }
            opened = Some(PathBuf::from(&config.file_path));
        }
    }

    let installed = tracing_subscriber::registry()
        .with(config.env_filter())
        .with(layers)
        .try_init()
        .is_ok();

    if installed {
        if let Some(path) = opened {
            let _ = LOG_FILE_PATH.set(path);
        }
    }
}

/// Agent logging: `hands-agent-<pid>.log` in the working directory.
pub fn init_agent_logging() {
    let mut path = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    path.push(agent_log_file_name(std::process::id()));
    init_logging(&LogConfig::agent(path.to_string_lossy()));
}

/// Console logging with default settings.
pub fn init_host_logging() {
    init_logging(&LogConfig::default());
}

pub fn agent_log_file_name(pid: u32) -> String {
    format!("hands-agent-{}.log", pid)
}

/// Path of the log file, if file logging is active.
pub fn log_file_path() -> Option<PathBuf> {
    LOG_FILE_PATH.get().cloned()
}
