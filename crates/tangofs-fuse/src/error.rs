use tangofs_db::DbError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TangoFsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No such entity: {path}")]
    NotFound { path: String },

    #[error("Not a directory: {path}")]
    NotNavigable { path: String },

    #[error("Control system failure: {0}")]
    Remote(#[from] DbError),

    #[error("Operation {op} not permitted on {path}")]
    InvalidOperation { op: String, path: String },

    #[error("Stale pending operation on {path}")]
    StaleOverlayEntry { path: String },

    /// The add half of an add-then-delete rename succeeded, the delete did not:
    /// both names are now visible.
    #[error("Renamed {from} to {to} but could not remove the old entry: {source}")]
    PartialRename {
        from: String,
        to: String,
        source: DbError,
    },

    #[error("Invalid argument: {msg}")]
    InvalidArgument { msg: String },
}

pub type Result<T> = std::result::Result<T, TangoFsError>;

impl TangoFsError {
    pub fn not_found(path: impl Into<String>) -> Self {
        TangoFsError::NotFound { path: path.into() }
    }

    pub fn invalid_operation(op: &str, path: impl Into<String>) -> Self {
        TangoFsError::InvalidOperation {
            op: op.to_string(),
            path: path.into(),
        }
    }

    pub fn to_errno(&self) -> i32 {
        use libc::*;
        match self {
            TangoFsError::Io(e) => e.raw_os_error().unwrap_or(EIO),
            TangoFsError::NotFound { .. } => ENOENT,
            TangoFsError::NotNavigable { .. } => ENOTDIR,
            TangoFsError::Remote(DbError::Timeout { .. }) => ETIMEDOUT,
            TangoFsError::Remote(DbError::InvalidValue { .. }) => EINVAL,
            TangoFsError::Remote(_) => EIO,
            TangoFsError::InvalidOperation { .. } => EPERM,
            TangoFsError::StaleOverlayEntry { .. } => ENOENT,
            TangoFsError::PartialRename { .. } => EIO,
            TangoFsError::InvalidArgument { .. } => EINVAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_errno() {
        let err = TangoFsError::not_found("servers/nope");
        assert_eq!(err.to_errno(), libc::ENOENT);
    }

    #[test]
    fn test_not_navigable_errno() {
        let err = TangoFsError::NotNavigable {
            path: "a/b".to_string(),
        };
        assert_eq!(err.to_errno(), libc::ENOTDIR);
    }

    #[test]
    fn test_remote_failure_is_io_error() {
        let err = TangoFsError::from(DbError::dev_failed("API_DeviceNotExported", "down"));
        assert_eq!(err.to_errno(), libc::EIO);
    }

    #[test]
    fn test_timeout_is_distinct_from_failure() {
        let err = TangoFsError::from(DbError::Timeout {
            op: "get_property".to_string(),
            timeout_ms: 3000,
        });
        assert_eq!(err.to_errno(), libc::ETIMEDOUT);
    }

    #[test]
    fn test_invalid_operation_errno() {
        let err = TangoFsError::invalid_operation("rename", "devices/sys");
        assert_eq!(err.to_errno(), libc::EPERM);
    }

    #[test]
    fn test_stale_overlay_fails_toward_not_found() {
        let err = TangoFsError::StaleOverlayEntry {
            path: "x".to_string(),
        };
        assert_eq!(err.to_errno(), libc::ENOENT);
    }

    #[test]
    fn test_partial_rename_errno() {
        let err = TangoFsError::PartialRename {
            from: "a".to_string(),
            to: "b".to_string(),
            source: DbError::dev_failed("x", "y"),
        };
        assert_eq!(err.to_errno(), libc::EIO);
        assert!(err.to_string().contains("could not remove"));
    }

    #[test]
    fn test_io_error_keeps_raw_errno() {
        let io_err = std::io::Error::from_raw_os_error(libc::ENOSPC);
        let err = TangoFsError::Io(io_err);
        assert_eq!(err.to_errno(), libc::ENOSPC);
    }

    #[test]
    fn test_display_messages_non_empty() {
        let errors = [
            TangoFsError::not_found("p"),
            TangoFsError::NotNavigable {
                path: "p".to_string(),
            },
            TangoFsError::invalid_operation("rmdir", "p"),
            TangoFsError::InvalidArgument {
                msg: "bad".to_string(),
            },
        ];
        for err in errors {
            assert!(!err.to_string().is_empty());
        }
    }
}
