//! Error types for the Hyper-V orchestration crate.

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error kinds for Hyper-V operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HyperVErrorKind {
    /// The host rejected the command with an authorization failure.
    PermissionDenied,
    /// A PowerShell command exited non-zero for any other reason.
    CommandFailed,
    /// A VM, adapter or checkpoint reference could not be resolved.
    NotFound,
    /// The caller cancelled the operation.
    Cancelled,
    /// The user declined the elevation prompt.
    ElevationDeclined,
    /// An argument was rejected before reaching the host.
    InvalidArgument,
    /// The export destination does not have enough free space.
    InsufficientDiskSpace,
    /// JSON output could not be decoded.
    ParseError,
    /// The PowerShell process could not be spawned or awaited.
    ProcessError,
    /// The Hyper-V PowerShell module is not installed or available.
    ModuleNotAvailable,
}

/// Hyper-V management error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HyperVError {
    pub kind: HyperVErrorKind,
    pub message: String,
    #[serde(default)]
    pub details: Option<String>,
}

impl fmt::Display for HyperVError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)?;
        if let Some(ref d) = self.details {
            write!(f, ": {}", d)?;
        }
        Ok(())
    }
}

impl std::error::Error for HyperVError {}

impl HyperVError {
    pub fn new(kind: HyperVErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(
        kind: HyperVErrorKind,
        message: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            details: Some(details.into()),
        }
    }

    pub fn permission_denied(diagnostic: impl Into<String>) -> Self {
        Self::with_details(
            HyperVErrorKind::PermissionDenied,
            "Hyper-V denied the operation. Run HyperTool elevated or add the user to the 'Hyper-V Administrators' group.",
            diagnostic,
        )
    }

    pub fn command_failed(diagnostic: impl Into<String>) -> Self {
        Self::new(HyperVErrorKind::CommandFailed, diagnostic)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(HyperVErrorKind::NotFound, message)
    }

    pub fn checkpoint_not_found(vm_name: &str, checkpoint: &str) -> Self {
        Self::not_found(format!(
            "Checkpoint '{}' not found on VM '{}'",
            checkpoint, vm_name
        ))
    }

    pub fn cancelled() -> Self {
        Self::new(HyperVErrorKind::Cancelled, "Operation was cancelled")
    }

    pub fn elevation_declined() -> Self {
        Self::new(
            HyperVErrorKind::ElevationDeclined,
            "The elevation prompt was declined",
        )
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(HyperVErrorKind::InvalidArgument, message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(HyperVErrorKind::ParseError, message)
    }

    pub fn process(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self::with_details(HyperVErrorKind::ProcessError, message, details)
    }

    pub fn module_not_available() -> Self {
        Self::new(
            HyperVErrorKind::ModuleNotAvailable,
            "Hyper-V PowerShell module is not available. Ensure the Hyper-V role and management tools are installed.",
        )
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == HyperVErrorKind::Cancelled
    }

    /// Text used for signature matching: message plus details.
    pub fn diagnostic_text(&self) -> String {
        match self.details {
            Some(ref d) => format!("{} {}", self.message, d),
            None => self.message.clone(),
        }
    }

    /// Prefix the message with operation context, keeping the kind.
    pub fn with_context(mut self, context: impl AsRef<str>) -> Self {
        self.message = format!("{}: {}", context.as_ref(), self.message);
        self
    }

    /// Log this error at the level its kind calls for.
    pub fn log(&self, operation: &str) {
        match self.kind {
            HyperVErrorKind::Cancelled => info!("{} cancelled", operation),
            HyperVErrorKind::PermissionDenied
            | HyperVErrorKind::ElevationDeclined
            | HyperVErrorKind::NotFound
            | HyperVErrorKind::InvalidArgument
            | HyperVErrorKind::InsufficientDiskSpace => {
                warn!("{} failed: {}", operation, self)
            }
            HyperVErrorKind::CommandFailed
            | HyperVErrorKind::ParseError
            | HyperVErrorKind::ProcessError
            | HyperVErrorKind::ModuleNotAvailable => error!("{} failed: {}", operation, self),
        }
    }
}

/// Convert a `HyperVError` into a plain `String` for front-end returns.
impl From<HyperVError> for String {
    fn from(e: HyperVError) -> String {
        e.to_string()
    }
}

/// Convenience alias.
pub type HyperVResult<T> = Result<T, HyperVError>;

/// Reject blank names before anything reaches the host.
pub fn require_name(value: &str, what: &str) -> HyperVResult<()> {
    if value.trim().is_empty() {
        return Err(HyperVError::invalid_argument(format!(
            "{} must not be empty",
            what
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_details() {
        let err = HyperVError::permission_denied("Access is denied.");
        let s = err.to_string();
        assert!(s.contains("PermissionDenied"));
        assert!(s.contains("Hyper-V Administrators"));
        assert!(s.contains("Access is denied."));
    }

    #[test]
    fn checkpoint_not_found_names_vm_and_checkpoint() {
        let err = HyperVError::checkpoint_not_found("VM1", "before-update");
        assert_eq!(err.kind, HyperVErrorKind::NotFound);
        assert_eq!(err.message, "Checkpoint 'before-update' not found on VM 'VM1'");
    }

    #[test]
    fn context_keeps_kind() {
        let err = HyperVError::command_failed("disk full").with_context("Export of 'VM1'");
        assert_eq!(err.kind, HyperVErrorKind::CommandFailed);
        assert_eq!(err.message, "Export of 'VM1': disk full");
    }

    #[test]
    fn require_name_rejects_whitespace() {
        assert!(require_name("  ", "VM name").is_err());
        assert!(require_name("VM1", "VM name").is_ok());
        let err = require_name("", "Switch name").unwrap_err();
        assert_eq!(err.kind, HyperVErrorKind::InvalidArgument);
        assert!(err.message.contains("Switch name"));
    }

    #[test]
    fn serializes_kind_camel_case() {
        let json = serde_json::to_string(&HyperVError::elevation_declined()).unwrap();
        assert!(json.contains("\"elevationDeclined\""));
    }
}
