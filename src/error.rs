//! Error taxonomy for the multi-cloud storage core.
//!
//! Every fallible operation in this crate returns `Result<T, Error>`.
//! [`Error`] wraps a sentinel [`ErrorKind`] together with the operation
//! name, the path/address that was being operated on, and the provider
//! tag (when known), plus an optional source error. Callers test the
//! kind through [`Error::kind`] / [`Error::is`] rather than matching on
//! the `Display` string.

use std::fmt;

use crate::provider::Provider;

/// Sentinel error kinds shared across every provider adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The requested object, bucket, or upload does not exist.
    NotFound,
    /// The target already exists and the operation required it not to.
    AlreadyExists,
    /// The credentials were rejected or lack permission (401/403).
    AccessDenied,
    /// A URI or local path failed to parse or was structurally invalid.
    InvalidPath,
    /// A typed configuration value was missing a required field or
    /// carried a value the adapter does not recognize.
    InvalidConfig,
    /// The backend (or this core) does not implement the requested
    /// capability, e.g. a capability-interface downcast failed.
    NotSupported,
    /// The operation did not complete before its deadline/cancellation.
    Timeout,
    /// The backend rejected the request due to a quota or rate limit.
    QuotaExceeded,
    /// Local integrity validation (MD5/SHA-256) did not match the
    /// value the backend published.
    ChecksumMismatch,
    /// A parted transfer completed with fewer than the expected bytes
    /// or parts.
    PartialContent,
    /// Catch-all for failures that do not fit another kind.
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::AccessDenied => "access denied",
            ErrorKind::InvalidPath => "invalid path",
            ErrorKind::InvalidConfig => "invalid config",
            ErrorKind::NotSupported => "not supported",
            ErrorKind::Timeout => "timeout",
            ErrorKind::QuotaExceeded => "quota exceeded",
            ErrorKind::ChecksumMismatch => "checksum mismatch",
            ErrorKind::PartialContent => "partial content",
            ErrorKind::Other => "error",
        };
        f.write_str(s)
    }
}

/// A wrapped error carrying `(op, path, provider, cause)` as required
/// by the error taxonomy, plus a retryability marker the retry engine
/// consults instead of re-deriving it from `kind`.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    op: &'static str,
    path: String,
    provider: Option<Provider>,
    retryable: bool,
    source: Option<anyhow::Error>,
}

impl Error {
    /// Construct a new error of `kind` for operation `op` against `path`.
    pub fn new(kind: ErrorKind, op: &'static str, path: impl Into<String>) -> Self {
        let retryable = default_retryable(kind);
        Self {
            kind,
            op,
            path: path.into(),
            provider: None,
            retryable,
            source: None,
        }
    }

    /// Attach the provider tag this error occurred under.
    pub fn with_provider(mut self, provider: Provider) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl Into<anyhow::Error>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Force this error to be treated as retryable (or not) regardless
    /// of what its `kind` would normally imply. This is the "separate
    /// `Retryable` wrapper" from the spec, expressed as a builder
    /// method rather than a distinct newtype since `Error` already
    /// carries the flag.
    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn op(&self) -> &str {
        self.op
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn provider(&self) -> Option<Provider> {
        self.provider
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Transparent-unwrapping identity check: `err.is(ErrorKind::NotFound)`.
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    pub fn not_found(op: &'static str, path: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, op, path)
    }

    pub fn invalid_path(op: &'static str, path: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidPath, op, path)
    }

    pub fn invalid_config(op: &'static str, path: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidConfig, op, path)
    }

    pub fn not_supported(op: &'static str, path: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotSupported, op, path)
    }

    pub fn checksum_mismatch(op: &'static str, path: impl Into<String>) -> Self {
        Self::new(ErrorKind::ChecksumMismatch, op, path)
    }

    pub fn access_denied(op: &'static str, path: impl Into<String>) -> Self {
        Self::new(ErrorKind::AccessDenied, op, path)
    }

    pub fn already_exists(op: &'static str, path: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyExists, op, path)
    }

    /// Wrap this error to record that the retry loop gave up after
    /// `attempts` tries, folding any prior source into the new message.
    pub fn exhausted(mut self, attempts: u32) -> Self {
        let message = match self.source.take() {
            Some(src) => format!("attempts exhausted after {attempts} attempt(s): {src}"),
            None => format!("attempts exhausted after {attempts} attempt(s)"),
        };
        self.source = Some(anyhow::anyhow!(message));
        self
    }
}

/// Default retry eligibility, before any explicit override: every kind
/// retries unless the caller supplies a narrower predicate via
/// `RetryOptions::retry_if` or overrides a specific error's
/// retryability with [`Error::retryable`].
fn default_retryable(_kind: ErrorKind) -> bool {
    true
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.provider {
            Some(p) => write!(f, "{} {} ({}): {}", self.op, self.path, p, self.kind)?,
            None => write!(f, "{} {}: {}", self.op, self.path, self.kind)?,
        }
        if let Some(src) = &self.source {
            write!(f, ": {src}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref())
    }
}

/// Classify an HTTP status code into a taxonomy kind, per the
/// "Classification rules" in the error-taxonomy section of the spec.
pub fn classify_http_status(status: u16) -> ErrorKind {
    match status {
        404 => ErrorKind::NotFound,
        401 | 403 => ErrorKind::AccessDenied,
        408 => ErrorKind::Timeout,
        409 => ErrorKind::AlreadyExists,
        429 => ErrorKind::QuotaExceeded,
        416 => ErrorKind::PartialContent,
        500..=599 => ErrorKind::Other,
        _ => ErrorKind::Other,
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_op_path_provider() {
        let err = Error::not_found("stat", "s3://bucket/key").with_provider(Provider::Aws);
        let s = err.to_string();
        assert!(s.contains("stat"));
        assert!(s.contains("s3://bucket/key"));
        assert!(s.contains("aws"));
    }

    #[test]
    fn is_checks_kind_not_display() {
        let err = Error::checksum_mismatch("download", "x");
        assert!(err.is(ErrorKind::ChecksumMismatch));
        assert!(!err.is(ErrorKind::NotFound));
    }

    #[test]
    fn retryable_override_wins_over_default() {
        let err = Error::not_found("get", "x").retryable(true);
        assert!(err.is_retryable());
        let err2 = Error::new(ErrorKind::Timeout, "get", "x");
        assert!(err2.is_retryable());
    }

    #[test]
    fn every_kind_is_retryable_by_default() {
        for kind in [
            ErrorKind::NotFound,
            ErrorKind::AlreadyExists,
            ErrorKind::AccessDenied,
            ErrorKind::InvalidPath,
            ErrorKind::InvalidConfig,
            ErrorKind::NotSupported,
            ErrorKind::Timeout,
            ErrorKind::QuotaExceeded,
            ErrorKind::ChecksumMismatch,
            ErrorKind::PartialContent,
            ErrorKind::Other,
        ] {
            assert!(Error::new(kind, "op", "x").is_retryable(), "{kind} should retry by default");
        }
    }

    #[test]
    fn explicit_override_can_disable_retry() {
        let err = Error::new(ErrorKind::Timeout, "get", "x").retryable(false);
        assert!(!err.is_retryable());
    }

    #[test]
    fn classify_http_status_matches_table() {
        assert_eq!(classify_http_status(404), ErrorKind::NotFound);
        assert_eq!(classify_http_status(401), ErrorKind::AccessDenied);
        assert_eq!(classify_http_status(403), ErrorKind::AccessDenied);
        assert_eq!(classify_http_status(429), ErrorKind::QuotaExceeded);
    }
}
