use thiserror::Error;

/// Failure reported by the control-system client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DbError {
    /// The control system rejected the call (Tango `DevFailed`).
    #[error("DevFailed: {reason}: {desc}")]
    DevFailed { reason: String, desc: String },

    /// The call did not complete within the client's request timeout.
    #[error("Timed out after {timeout_ms}ms during {op}")]
    Timeout { op: String, timeout_ms: u64 },

    /// A value could not be converted to or from the attribute's data type.
    #[error("Invalid value: {msg}")]
    InvalidValue { msg: String },
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl DbError {
    pub fn dev_failed(reason: impl Into<String>, desc: impl Into<String>) -> Self {
        DbError::DevFailed {
            reason: reason.into(),
            desc: desc.into(),
        }
    }

    pub fn invalid_value(msg: impl Into<String>) -> Self {
        DbError::InvalidValue { msg: msg.into() }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, DbError::Timeout { .. })
    }
}
