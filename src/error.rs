//! Error types for the dashboard core.

use std::fmt;

use thiserror::Error;

/// The cascade level a fetch belongs to. Errors are reported per level so a
/// failure in one section leaves the others usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Directions,
    Models,
    Students,
    Subjects,
    Charts,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Directions => "directions",
            Level::Models => "models",
            Level::Students => "students",
            Level::Subjects => "subjects",
            Level::Charts => "charts",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure talking to the prediction backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("request to {endpoint} failed: {message}")]
    Transport { endpoint: String, message: String },

    #[error("{endpoint} answered with status {status}")]
    Status { endpoint: String, status: u16 },

    #[error("could not decode response from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },
}

impl BackendError {
    pub fn transport(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    pub fn decode(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DashboardError {
    /// A required selection or input is missing. No request was issued.
    #[error("{0}")]
    Validation(String),

    /// A cascade fetch failed. Data at that level is stale or empty.
    #[error("failed to load {level}: {message}")]
    Fetch { level: Level, message: String },

    #[error("chart '{chart_id}' is already on the dashboard")]
    DuplicateChart { chart_id: String },

    /// Charts were cleared while this chart was loading.
    #[error("chart '{chart_id}' was dropped: the selection changed while it loaded")]
    Superseded { chart_id: String },

    /// A batch operation failed after cleanup ran.
    #[error("prediction failed: {0}")]
    Workflow(String),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl DashboardError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn fetch(level: Level, source: impl fmt::Display) -> Self {
        Self::Fetch {
            level,
            message: source.to_string(),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::DuplicateChart { .. })
    }
}

pub type Result<T> = std::result::Result<T, DashboardError>;
