//! Log level selection and subscriber installation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt as fmt_layer, prelude::*, EnvFilter};

use crate::error::TransportError;

/// Verbosity requested through configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    /// Install nothing.
    None,
}

impl LogLevel {
    /// `EnvFilter` directive for this level, `None` when logging is off.
    pub fn directive(&self) -> Option<&'static str> {
        match self {
            LogLevel::Debug => Some("debug"),
            LogLevel::Info => Some("info"),
            LogLevel::Warn => Some("warn"),
            LogLevel::Error => Some("error"),
            LogLevel::None => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        self.directive().unwrap_or("none")
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "none" => Ok(LogLevel::None),
            other => Err(TransportError::Config(format!("unknown log level: {}", other))),
        }
    }
}

/// Installs a global fmt subscriber filtered at `level`. `RUST_LOG` overrides
/// the level when set. Returns false if nothing was installed, either because
/// the level is `None` or because a global subscriber already exists.
pub fn init_logging(level: LogLevel) -> bool {
    let Some(directive) = level.directive() else {
        return false;
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    tracing_subscriber::registry()
        .with(fmt_layer::layer())
        .with(filter)
        .try_init()
        .is_ok()
}
