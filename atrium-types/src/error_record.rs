//! Immutable records of plugin failures.

use crate::ErrorId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a plugin failure. Drives the recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Unhandled failure raised by plugin code.
    Runtime,
    /// Pool exhaustion or a sandbox limit breach.
    Resource,
    /// Operation exceeded its deadline.
    Timeout,
    /// Policy violation, e.g. use of a capability that was not granted.
    Security,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Runtime => write!(f, "runtime"),
            Self::Resource => write!(f, "resource"),
            Self::Timeout => write!(f, "timeout"),
            Self::Security => write!(f, "security"),
        }
    }
}

/// A recorded plugin failure. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginError {
    pub id: ErrorId,
    pub plugin_id: String,
    pub kind: ErrorKind,
    pub message: String,
    pub stack: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub recoverable: bool,
}

impl PluginError {
    /// Creates a record stamped with the current time.
    pub fn new(
        plugin_id: impl Into<String>,
        kind: ErrorKind,
        message: impl Into<String>,
        recoverable: bool,
    ) -> Self {
        Self {
            id: ErrorId::new(),
            plugin_id: plugin_id.into(),
            kind,
            message: message.into(),
            stack: None,
            timestamp: Utc::now(),
            recoverable,
        }
    }

    #[must_use]
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl fmt::Display for PluginError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.kind, self.plugin_id, self.message)
    }
}
