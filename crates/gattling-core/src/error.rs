//! Classified error model for host-stack operations
//!
//! Every fallible bus operation returns a [`BusResult`], carrying a
//! [`BusError`] whose [`ErrorKind`] is drawn from a closed set. Raw transport
//! errors are classified once, at the bus boundary, and never cross into the
//! orchestration logic.

use thiserror::Error;

// ----------------------------------------------------------------------------
// Error Kinds
// ----------------------------------------------------------------------------

/// Classification of a failed host-stack operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    PermissionDenied,
    NotReady,
    NotSupported,
    InProgress,
    Failed,
    Timeout,
    InvalidArgs,
    AlreadyExists,
    NotFound,
    ConnectionFailed,
    Unknown,
}

impl ErrorKind {
    /// All kinds, in declaration order. Handy for exhaustive table tests.
    pub const ALL: [ErrorKind; 11] = [
        ErrorKind::PermissionDenied,
        ErrorKind::NotReady,
        ErrorKind::NotSupported,
        ErrorKind::InProgress,
        ErrorKind::Failed,
        ErrorKind::Timeout,
        ErrorKind::InvalidArgs,
        ErrorKind::AlreadyExists,
        ErrorKind::NotFound,
        ErrorKind::ConnectionFailed,
        ErrorKind::Unknown,
    ];

    /// Whether an operation failing with this kind is worth re-attempting.
    ///
    /// This is the single retryability predicate in the codebase; every
    /// retry scheduler consults it. `Failed` counts as retryable on purpose:
    /// the host stack overuses that generic code for transient conditions,
    /// so we trade a few wasted retries for resilience.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::InProgress | ErrorKind::NotReady | ErrorKind::Timeout | ErrorKind::Failed
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ErrorKind::PermissionDenied => {
                "permission denied - check polkit rules or run with elevated privileges"
            }
            ErrorKind::NotReady => "service not ready - check bluetoothd status",
            ErrorKind::NotSupported => "operation not supported by the host stack or hardware",
            ErrorKind::InProgress => "operation already in progress",
            ErrorKind::Failed => "operation failed",
            ErrorKind::Timeout => "operation timed out",
            ErrorKind::InvalidArgs => "invalid arguments provided",
            ErrorKind::AlreadyExists => "resource already exists",
            ErrorKind::NotFound => "resource not found",
            ErrorKind::ConnectionFailed => "connection failed",
            ErrorKind::Unknown => "unknown error",
        };
        f.write_str(text)
    }
}

// ----------------------------------------------------------------------------
// Error Type
// ----------------------------------------------------------------------------

/// A classified host-stack failure with its original message.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind}: {message}")]
pub struct BusError {
    pub kind: ErrorKind,
    pub message: String,
}

impl BusError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_ready(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotReady, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotSupported, message)
    }

    pub fn in_progress(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InProgress, message)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Failed, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConnectionFailed, message)
    }

    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgs, message)
    }

    /// Classify a raw D-Bus error into a [`BusError`], keeping the message.
    pub fn from_dbus(name: Option<&str>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(classify_error_name(name, &message), message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Result type for host-stack operations.
pub type BusResult<T> = Result<T, BusError>;

// ----------------------------------------------------------------------------
// Classification
// ----------------------------------------------------------------------------

/// Map a transport error (D-Bus error name plus message) onto the closed
/// [`ErrorKind`] set.
///
/// The error name (e.g. `org.bluez.Error.NotReady`,
/// `org.freedesktop.DBus.Error.AccessDenied`) is matched first; when no name
/// is available the message text is used as a fallback. This is the only
/// classifier in the codebase.
pub fn classify_error_name(name: Option<&str>, message: &str) -> ErrorKind {
    if let Some(name) = name {
        if let Some(kind) = classify_text(name) {
            return kind;
        }
    }

    classify_text(message).unwrap_or(ErrorKind::Unknown)
}

fn classify_text(text: &str) -> Option<ErrorKind> {
    if text.contains("PermissionDenied") || text.contains("AccessDenied") {
        return Some(ErrorKind::PermissionDenied);
    }
    if text.contains("NotReady") {
        return Some(ErrorKind::NotReady);
    }
    if text.contains("NotSupported") || text.contains("NotImplemented") {
        return Some(ErrorKind::NotSupported);
    }
    if text.contains("InProgress") {
        return Some(ErrorKind::InProgress);
    }
    if text.contains("InvalidArguments") || text.contains("InvalidArgs") {
        return Some(ErrorKind::InvalidArgs);
    }
    if text.contains("AlreadyExists") {
        return Some(ErrorKind::AlreadyExists);
    }
    if text.contains("DoesNotExist") || text.contains("NotFound") || text.contains("ServiceUnknown")
    {
        return Some(ErrorKind::NotFound);
    }
    if text.contains("Timeout") || text.contains("NoReply") {
        return Some(ErrorKind::Timeout);
    }
    if text.contains("Disconnected") {
        return Some(ErrorKind::ConnectionFailed);
    }
    if text.contains("Failed") {
        return Some(ErrorKind::Failed);
    }
    None
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_table_matches_policy() {
        let retryable = [
            ErrorKind::InProgress,
            ErrorKind::NotReady,
            ErrorKind::Timeout,
            ErrorKind::Failed,
        ];
        for kind in ErrorKind::ALL {
            assert_eq!(
                kind.is_retryable(),
                retryable.contains(&kind),
                "unexpected retryability for {kind:?}"
            );
        }
    }

    #[test]
    fn classifies_bluez_error_names() {
        assert_eq!(
            classify_error_name(Some("org.bluez.Error.NotReady"), ""),
            ErrorKind::NotReady
        );
        assert_eq!(
            classify_error_name(Some("org.bluez.Error.AlreadyExists"), ""),
            ErrorKind::AlreadyExists
        );
        assert_eq!(
            classify_error_name(Some("org.bluez.Error.InProgress"), ""),
            ErrorKind::InProgress
        );
        assert_eq!(
            classify_error_name(Some("org.bluez.Error.NotSupported"), ""),
            ErrorKind::NotSupported
        );
        assert_eq!(
            classify_error_name(Some("org.freedesktop.DBus.Error.AccessDenied"), ""),
            ErrorKind::PermissionDenied
        );
        assert_eq!(
            classify_error_name(Some("org.freedesktop.DBus.Error.InvalidArgs"), ""),
            ErrorKind::InvalidArgs
        );
    }

    #[test]
    fn name_takes_precedence_over_message() {
        assert_eq!(
            classify_error_name(Some("org.bluez.Error.NotReady"), "Failed to do the thing"),
            ErrorKind::NotReady
        );
    }

    #[test]
    fn falls_back_to_message_then_unknown() {
        assert_eq!(
            classify_error_name(None, "Failed to register advertisement"),
            ErrorKind::Failed
        );
        assert_eq!(
            classify_error_name(None, "something inscrutable"),
            ErrorKind::Unknown
        );
    }

    #[test]
    fn error_display_includes_kind_and_message() {
        let err = BusError::not_found("No adapters available");
        let text = err.to_string();
        assert!(text.contains("resource not found"));
        assert!(text.contains("No adapters available"));
    }
}
