//! Failure-class recovery policy.

use crate::config::RecoveryConfig;
use atrium_types::ErrorKind;
use serde::Serialize;
use std::fmt;

/// What the manager does to an instance after a recorded failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Pause every instance of the plugin; resumed manually.
    PauseAll,
    Restart,
    Unload,
    /// Unload every instance of the plugin.
    UnloadAll,
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PauseAll => write!(f, "pause_all"),
            Self::Restart => write!(f, "restart"),
            Self::Unload => write!(f, "unload"),
            Self::UnloadAll => write!(f, "unload_all"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryPolicy {
    config: RecoveryConfig,
}

impl RecoveryPolicy {
    pub fn new(config: RecoveryConfig) -> Self {
        Self { config }
    }

    /// Picks the action for a failure of `kind`. Counts are the instance's
    /// values after the failure was counted.
    pub fn decide(
        &self,
        kind: ErrorKind,
        recoverable: bool,
        error_count: u32,
        restart_count: u32,
    ) -> RecoveryAction {
        match kind {
            ErrorKind::Resource => RecoveryAction::PauseAll,
            ErrorKind::Security => RecoveryAction::UnloadAll,
            ErrorKind::Timeout => {
                if recoverable && restart_count < self.config.max_timeout_restarts {
                    RecoveryAction::Restart
                } else {
                    RecoveryAction::Unload
                }
            }
            ErrorKind::Runtime => {
                if error_count < self.config.max_errors && restart_count < self.config.max_restarts
                {
                    RecoveryAction::Restart
                } else {
                    RecoveryAction::Unload
                }
            }
        }
    }
}
