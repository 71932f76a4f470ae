use std::io::Error as IoError;
use std::time::Duration;

use arrow::error::ArrowError;
use rusqlite::Error as SqliteError;
use serde_json::Error as JsonError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Connector Error ({connector}): {message}")]
    Connector { connector: String, message: String },

    #[error("Sensor Timeout: `{sensor}` not satisfied after {waited:?}")]
    SensorTimeout { sensor: String, waited: Duration },

    #[error("Load Error ({destination}): {message}")]
    Load { destination: String, message: String },

    #[error("Transform Error: `{selector}` exited with status {status}: {stderr}")]
    Transform {
        selector: String,
        status: i32,
        stderr: String,
    },

    #[error("Task Timeout: attempt exceeded {0:?}")]
    TaskTimeout(Duration),

    #[error("Task Error: {0}")]
    Task(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Config Error: {0}")]
    Config(String),

    #[error("Arrow Error: {0}")]
    ArrowError(#[from] ArrowError),

    #[error("Io Error: {0}")]
    IoError(#[from] IoError),

    #[error("Json Error: {0}")]
    JsonError(#[from] JsonError),

    #[error("Sqlite Error: {0}")]
    SqliteError(#[from] SqliteError),
}

impl Error {
    pub fn connector(connector: impl Into<String>, message: impl ToString) -> Self {
        Error::Connector {
            connector: connector.into(),
            message: message.to_string(),
        }
    }

    pub fn load(destination: impl Into<String>, message: impl ToString) -> Self {
        Error::Load {
            destination: destination.into(),
            message: message.to_string(),
        }
    }

    pub fn task(message: impl ToString) -> Self {
        Error::Task(message.to_string())
    }

    /// Whether the executor may re-invoke the failed node under its retry policy.
    ///
    /// A sensor timeout has already spent its polling budget, a cancelled run must
    /// not start new attempts, and an external transform run is never replayed
    /// automatically.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::SensorTimeout { .. } | Error::Cancelled | Error::Transform { .. }
        )
    }

    /// Short, stable label for the error class. Used in run reports and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Connector { .. } => "connector",
            Error::SensorTimeout { .. } => "sensor_timeout",
            Error::Load { .. } => "load",
            Error::Transform { .. } => "transform",
            Error::TaskTimeout(_) => "timeout",
            Error::Task(_) => "task",
            Error::Cancelled => "cancelled",
            Error::Config(_) => "config",
            Error::ArrowError(_) => "arrow",
            Error::IoError(_) => "io",
            Error::JsonError(_) => "json",
            Error::SqliteError(_) => "sqlite",
        }
    }
}
