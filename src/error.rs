//! Error kinds shared by the cache store, the codec, the filesystem adapter,
//! and the sync engine.
//!
//! Storage and transport failures funnel into [`GitmdfsError`]; the
//! filesystem adapter maps the kernel-visible subset to an errno via
//! [`GitmdfsError::to_errno`].

use std::time::SystemTime;

use thiserror::Error;

/// Errors produced anywhere in the cache store, codec, adapter, or engine.
#[derive(Debug, Error)]
pub enum GitmdfsError {
    /// The requested name or record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The filesystem operation is not permitted on this namespace.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A malformed name or request was supplied.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A write would grow a handle buffer past the 10 MiB bound.
    #[error("file too large")]
    FileTooLarge,

    /// The markdown buffer could not be parsed on flush.
    #[error("decode error: {0}")]
    DecodeError(String),

    /// The cache store failed to read or write durable state.
    #[error("store error: {0}")]
    StoreError(String),

    /// A call to the remote capability failed at the transport layer.
    #[error("remote transport error: {0}")]
    RemoteTransport(String),

    /// The remote throttled the call; retry after `reset_deadline`.
    #[error("remote rate limited until {reset_deadline:?}")]
    RemoteRateLimit {
        /// Wall-clock time after which the call may be retried.
        reset_deadline: SystemTime,
    },

    /// A dirty local record collided with a newer remote snapshot during
    /// reconcile. Resolved internally per the configured conflict policy;
    /// never surfaced past the sync engine.
    #[error("conflict on issue {0}")]
    Conflict(u64),
}

impl GitmdfsError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn permission_denied(what: impl Into<String>) -> Self {
        Self::PermissionDenied(what.into())
    }

    pub fn invalid_argument(what: impl Into<String>) -> Self {
        Self::InvalidArgument(what.into())
    }

    pub fn decode_error(what: impl Into<String>) -> Self {
        Self::DecodeError(what.into())
    }

    pub fn store_error(what: impl Into<String>) -> Self {
        Self::StoreError(what.into())
    }

    pub fn remote_transport(what: impl Into<String>) -> Self {
        Self::RemoteTransport(what.into())
    }

    /// Map the kernel-visible subset of error kinds to a libc errno, per the
    /// propagation policy at the filesystem boundary: `DecodeError` and
    /// `StoreError` both surface as a plain I/O error, `Conflict` never
    /// reaches this boundary, and rate limiting is recovered inside the
    /// engine before it could reach a filesystem call.
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::NotFound(_) => libc::ENOENT,
            Self::PermissionDenied(_) => libc::EPERM,
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::FileTooLarge => libc::EFBIG,
            Self::DecodeError(_) => libc::EIO,
            Self::StoreError(_) => libc::EIO,
            Self::RemoteTransport(_) => libc::EIO,
            Self::RemoteRateLimit { .. } => libc::EIO,
            Self::Conflict(_) => libc::EIO,
        }
    }
}

impl From<sqlx::Error> for GitmdfsError {
    fn from(err: sqlx::Error) -> Self {
        Self::store_error(err.to_string())
    }
}

impl From<reqwest::Error> for GitmdfsError {
    fn from(err: reqwest::Error) -> Self {
        // `.json()` surfaces a malformed response body through the same
        // `reqwest::Error` type as a failed `.send()`; the former never
        // reached the remote correctly at all, so retrying won't help —
        // that's a decode failure, not a transport one.
        if err.is_decode() {
            Self::decode_error(err.to_string())
        } else {
            Self::remote_transport(err.to_string())
        }
    }
}

impl From<std::io::Error> for GitmdfsError {
    fn from(err: std::io::Error) -> Self {
        Self::store_error(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_enoent() {
        let err = GitmdfsError::not_found("issue 7");
        assert_eq!(err.to_errno(), libc::ENOENT);
    }

    #[test]
    fn permission_denied_maps_to_eperm() {
        let err = GitmdfsError::permission_denied("unlink");
        assert_eq!(err.to_errno(), libc::EPERM);
    }

    #[test]
    fn decode_and_store_errors_surface_as_io_error() {
        assert_eq!(GitmdfsError::decode_error("bad header").to_errno(), libc::EIO);
        assert_eq!(GitmdfsError::store_error("disk full").to_errno(), libc::EIO);
    }

    #[test]
    fn file_too_large_maps_to_efbig() {
        assert_eq!(GitmdfsError::FileTooLarge.to_errno(), libc::EFBIG);
    }
}
