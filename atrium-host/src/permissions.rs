//! Capability checks for plugin sandboxes.
//!
//! A sandbox holds the permissions its manifest declares, minus anything
//! the runtime configuration denies outright. Denials always win.

use atrium_types::Permission;
use serde::Serialize;
use std::collections::HashSet;

/// Why a permission check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denial {
    /// The manifest never asked for it.
    NotGranted,
    /// Blocked by `[security] denied_permissions`.
    DeniedByPolicy,
}

/// Set of permissions granted to a sandbox.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PermissionSet {
    granted: HashSet<Permission>,
    /// Permissions blocked by policy (never granted, even if declared).
    denied: HashSet<Permission>,
}

impl PermissionSet {
    /// Builds the effective set from a manifest's declaration and the
    /// policy's deny list.
    pub fn new(declared: &HashSet<Permission>, denied_by_policy: &HashSet<Permission>) -> Self {
        Self {
            granted: declared.difference(denied_by_policy).copied().collect(),
            denied: denied_by_policy.clone(),
        }
    }

    pub fn check(&self, permission: Permission) -> Result<(), Denial> {
        if self.denied.contains(&permission) {
            Err(Denial::DeniedByPolicy)
        } else if self.granted.contains(&permission) {
            Ok(())
        } else {
            Err(Denial::NotGranted)
        }
    }

    pub fn granted_permissions(&self) -> &HashSet<Permission> {
        &self.granted
    }
}
