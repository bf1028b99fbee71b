//! Error types for the bridge.
//!
//! Three layers of failure are distinguished here:
//!
//! - [`BusError`]: statuses reported by the wire layer and the transport. Some
//!   of these (`NoMore`, `Timeout`, `Interrupted`) are normal control outcomes
//!   rather than failures.
//! - [`ScriptError`]: errors surfaced to script code. They abort the current
//!   call or callback and never terminate the message loop.
//! - [`BridgeError`]: the crate-level error that wraps both, plus configuration
//!   and I/O failures.

use serde::{Deserialize, Serialize};

/// Status codes returned by the wire layer and the bus transport
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    /// No more arguments in the message or the current container
    #[error("no more arguments")]
    NoMore,

    /// Value does not match the expected type signature
    #[error("signature mismatch: {0}")]
    Signature(String),

    /// Malformed wire data or an invalid request
    #[error("invalid: {0}")]
    Invalid(String),

    /// Allocation or buffer space exhausted
    #[error("resources exhausted")]
    Resources,

    /// Secure member accessed over an unencrypted channel
    #[error("security violation: {0}")]
    Security(String),

    /// A handler did not recognise the message
    #[error("no match")]
    NoMatch,

    /// Blocking receive timed out
    #[error("timeout")]
    Timeout,

    /// Blocking receive was interrupted
    #[error("interrupted")]
    Interrupted,

    /// Transport read failure
    #[error("read error")]
    Read,

    /// Transport write failure
    #[error("write error")]
    Write,

    /// Restart of the bus attachment requested
    #[error("restart requested")]
    Restart,

    /// Restart of the application requested
    #[error("application restart requested")]
    RestartApp,

    /// Request was rejected by the peer or the bus
    #[error("rejected: {0}")]
    Rejected(String),
}

impl BusError {
    /// Create a signature mismatch error
    pub fn signature(detail: impl Into<String>) -> Self {
        BusError::Signature(detail.into())
    }

    /// Create an invalid data error
    pub fn invalid(detail: impl Into<String>) -> Self {
        BusError::Invalid(detail.into())
    }

    /// Statuses that terminate the message loop
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BusError::Read | BusError::Write | BusError::Restart | BusError::RestartApp
        )
    }

    /// Statuses that mean "nothing arrived" rather than failure
    pub fn is_idle(&self) -> bool {
        matches!(self, BusError::Timeout | BusError::Interrupted)
    }

    /// Short status name, used in log output and script error messages
    pub fn status_text(&self) -> &'static str {
        match self {
            BusError::NoMore => "AJ_ERR_NO_MORE",
            BusError::Signature(_) => "AJ_ERR_SIGNATURE",
            BusError::Invalid(_) => "AJ_ERR_INVALID",
            BusError::Resources => "AJ_ERR_RESOURCES",
            BusError::Security(_) => "AJ_ERR_SECURITY",
            BusError::NoMatch => "AJ_ERR_NO_MATCH",
            BusError::Timeout => "AJ_ERR_TIMEOUT",
            BusError::Interrupted => "AJ_ERR_INTERRUPTED",
            BusError::Read => "AJ_ERR_READ",
            BusError::Write => "AJ_ERR_WRITE",
            BusError::Restart => "AJ_ERR_RESTART",
            BusError::RestartApp => "AJ_ERR_RESTART_APP",
            BusError::Rejected(_) => "AJ_ERR_REJECTED",
        }
    }
}

/// Error codes for script-visible errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Wrong value type passed to a native
    TypeError,
    /// Value out of range or operation not allowed in the current state
    RangeError,
    /// Secure member accessed over an unencrypted channel
    SecurityViolation,
    /// Allocation failure while building a value or message
    ResourceExhausted,
    /// Arguments do not match the member signature
    SignatureMismatch,
    /// Bus operation attempted while not attached
    NotAttached,
    /// Script source failed to compile
    SyntaxError,
    /// Internal bridge or engine error
    InternalError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::TypeError => write!(f, "TYPE_ERROR"),
            ErrorCode::RangeError => write!(f, "RANGE_ERROR"),
            ErrorCode::SecurityViolation => write!(f, "SECURITY_VIOLATION"),
            ErrorCode::ResourceExhausted => write!(f, "RESOURCE_EXHAUSTED"),
            ErrorCode::SignatureMismatch => write!(f, "SIGNATURE_MISMATCH"),
            ErrorCode::NotAttached => write!(f, "NOT_ATTACHED"),
            ErrorCode::SyntaxError => write!(f, "SYNTAX_ERROR"),
            ErrorCode::InternalError => write!(f, "INTERNAL_ERROR"),
        }
    }
}

/// Error raised into script code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptError {
    /// Error code
    pub code: ErrorCode,

    /// Human-readable message
    pub message: String,

    /// Script stack trace, when the engine provides one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ScriptError {
    /// Create a new script error
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            stack: None,
        }
    }

    /// Create a type error
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::TypeError, message)
    }

    /// Create a range error
    pub fn range_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RangeError, message)
    }

    /// Create an internal error
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// Error for a second reply to the same method call
    pub fn reply_already_sent() -> Self {
        Self::range_error("reply already sent")
    }

    /// Error for bus operations attempted while detached
    pub fn not_attached(operation: &str) -> Self {
        Self::new(
            ErrorCode::NotAttached,
            format!("{}: not attached to AllJoyn", operation),
        )
    }

    /// Convert a bus status raised by `operation` into a script error
    pub fn from_bus(operation: &str, err: &BusError) -> Self {
        let code = match err {
            BusError::Security(_) => ErrorCode::SecurityViolation,
            BusError::Resources => ErrorCode::ResourceExhausted,
            BusError::Signature(_) => ErrorCode::SignatureMismatch,
            _ => ErrorCode::TypeError,
        };
        Self::new(code, format!("{}: {}", operation, err.status_text()))
    }

    /// Add a stack trace
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Console status code for this error
    pub fn eval_status(&self) -> i32 {
        match self.code {
            ErrorCode::SyntaxError => eval_status::SYNTAX_ERROR,
            ErrorCode::TypeError | ErrorCode::RangeError | ErrorCode::SignatureMismatch => {
                eval_status::TYPE_ERROR
            }
            ErrorCode::ResourceExhausted => eval_status::RESOURCE_ERROR,
            ErrorCode::SecurityViolation | ErrorCode::NotAttached | ErrorCode::InternalError => {
                eval_status::INTERNAL_ERROR
            }
        }
    }
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ScriptError {}

/// Main error type for the bridge
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Wire or transport status
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    /// Script-level error
    #[error("script error: {0}")]
    Script(#[from] ScriptError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid state
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl BridgeError {
    /// Convert to a ScriptError for raising into script code
    pub fn to_script_error(&self) -> ScriptError {
        match self {
            BridgeError::Bus(e) => ScriptError::from_bus("bus", e),
            BridgeError::Script(e) => e.clone(),
            BridgeError::Config(e) => ScriptError::type_error(e.to_string()),
            BridgeError::Io(e) => ScriptError::internal_error(e.to_string()),
            BridgeError::Serialization(msg) => ScriptError::type_error(msg.clone()),
            BridgeError::InvalidState(msg) => ScriptError::internal_error(msg.clone()),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for BridgeError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        BridgeError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for BridgeError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        BridgeError::Serialization(e.to_string())
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Result type alias for wire and transport operations
pub type BusResult<T> = std::result::Result<T, BusError>;

/// Console status codes returned by `Eval`
pub mod eval_status {
    /// Script compiled and ran
    pub const OK: i32 = 0;
    /// Syntax error
    pub const SYNTAX_ERROR: i32 = 1;
    /// Type or range error
    pub const TYPE_ERROR: i32 = 2;
    /// Resource error
    pub const RESOURCE_ERROR: i32 = 3;
    /// Internal engine error
    pub const INTERNAL_ERROR: i32 = 5;
    /// The console call itself failed
    pub const CALL_FAILED: i32 = -1;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_display() {
        assert_eq!(ErrorCode::TypeError.to_string(), "TYPE_ERROR");
        assert_eq!(
            ErrorCode::SecurityViolation.to_string(),
            "SECURITY_VIOLATION"
        );
    }

    #[test]
    fn test_fatal_statuses() {
        assert!(BusError::Read.is_fatal());
        assert!(BusError::Write.is_fatal());
        assert!(BusError::Restart.is_fatal());
        assert!(BusError::RestartApp.is_fatal());
        assert!(!BusError::signature("x").is_fatal());
        assert!(!BusError::Security("p".into()).is_fatal());
        assert!(BusError::Timeout.is_idle());
        assert!(BusError::Interrupted.is_idle());
    }

    #[test]
    fn test_from_bus_keeps_kind() {
        let sec = ScriptError::from_bus("reply", &BusError::Security("Prop".into()));
        assert_eq!(sec.code, ErrorCode::SecurityViolation);

        let res = ScriptError::from_bus("reply", &BusError::Resources);
        assert_eq!(res.code, ErrorCode::ResourceExhausted);

        let sig = ScriptError::from_bus("method.call", &BusError::signature("i"));
        assert_eq!(sig.code, ErrorCode::SignatureMismatch);
        assert_eq!(sig.message, "method.call: AJ_ERR_SIGNATURE");
    }

    #[test]
    fn test_eval_status_mapping() {
        assert_eq!(
            ScriptError::new(ErrorCode::SyntaxError, "x").eval_status(),
            eval_status::SYNTAX_ERROR
        );
        assert_eq!(
            ScriptError::range_error("x").eval_status(),
            eval_status::TYPE_ERROR
        );
        assert_eq!(
            ScriptError::new(ErrorCode::ResourceExhausted, "x").eval_status(),
            eval_status::RESOURCE_ERROR
        );
        assert_eq!(
            ScriptError::internal_error("x").eval_status(),
            eval_status::INTERNAL_ERROR
        );
    }

    #[test]
    fn test_script_error_serialization() {
        let err = ScriptError::reply_already_sent();
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("RANGE_ERROR"));
        assert!(json.contains("reply already sent"));
    }

    #[test]
    fn test_bridge_error_conversion() {
        let err = BridgeError::from(ScriptError::reply_already_sent());
        assert_eq!(err.to_script_error().code, ErrorCode::RangeError);

        let err = BridgeError::from(BusError::Resources);
        assert_eq!(err.to_script_error().code, ErrorCode::ResourceExhausted);
    }
}
