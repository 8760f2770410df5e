//! Classified errors surfaced to the UI shell
//!
//! Every engine operation returns either a value or one of these variants.
//! SDK failures are mapped through [`classify_sdk_error`] so callers never
//! have to inspect raw AWS error payloads.

use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use thiserror::Error;

/// Result alias used across the crate
pub type S3Result<T> = std::result::Result<T, S3Error>;

#[derive(Debug, Error)]
pub enum S3Error {
    /// Credential/config store missing, unreadable or malformed
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unknown profile '{0}'")]
    UnknownProfile(String),

    /// Credentials rejected, expired, or the service was unreachable while authenticating
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Permission denied. Not retryable.
    #[error("access denied: {0}")]
    Access(String),

    /// Network or service blip. The caller may retry from scratch.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid name '{0}'")]
    InvalidName(String),

    #[error("transfer cancelled")]
    Cancelled,
}

impl S3Error {
    pub fn is_retryable(&self) -> bool {
        matches!(self, S3Error::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, S3Error::NotFound(_))
    }

    /// Short label for log lines
    pub fn kind(&self) -> &'static str {
        match self {
            S3Error::Configuration(_) => "configuration",
            S3Error::UnknownProfile(_) => "unknown-profile",
            S3Error::Authentication(_) => "authentication",
            S3Error::Access(_) => "access",
            S3Error::Transient(_) => "transient",
            S3Error::NotFound(_) => "not-found",
            S3Error::Io(_) => "io",
            S3Error::InvalidName(_) => "invalid-name",
            S3Error::Cancelled => "cancelled",
        }
    }
}

const NOT_FOUND_CODES: &[&str] = &["NoSuchBucket", "NoSuchKey", "NotFound", "NoSuchUpload"];

const AUTH_CODES: &[&str] = &[
    "InvalidAccessKeyId",
    "SignatureDoesNotMatch",
    "ExpiredToken",
    "InvalidToken",
    "TokenRefreshRequired",
    "UnrecognizedClientException",
];

const ACCESS_CODES: &[&str] = &["AccessDenied", "AllAccessDisabled", "AccountProblem"];

const TRANSIENT_CODES: &[&str] = &[
    "SlowDown",
    "RequestTimeout",
    "RequestTimeTooSkewed",
    "InternalError",
    "ServiceUnavailable",
    "Throttling",
];

/// Classify a service response from its HTTP status and S3 error code.
///
/// `target` names the bucket or key the request addressed and ends up in the
/// error message.
pub fn classify_service_error(
    status: u16,
    code: Option<&str>,
    message: Option<&str>,
    target: &str,
) -> S3Error {
    let detail = match (code, message) {
        (Some(c), Some(m)) => format!("{}: {} ({})", target, m, c),
        (Some(c), None) => format!("{} ({})", target, c),
        (None, Some(m)) => format!("{}: {}", target, m),
        (None, None) => format!("{} (HTTP {})", target, status),
    };

    if let Some(code) = code {
        if NOT_FOUND_CODES.contains(&code) {
            return S3Error::NotFound(detail);
        }
        if AUTH_CODES.contains(&code) {
            return S3Error::Authentication(detail);
        }
        if ACCESS_CODES.contains(&code) {
            return S3Error::Access(detail);
        }
        if TRANSIENT_CODES.contains(&code) {
            return S3Error::Transient(detail);
        }
    }

    match status {
        404 => S3Error::NotFound(detail),
        401 => S3Error::Authentication(detail),
        403 => S3Error::Access(detail),
        408 | 429 => S3Error::Transient(detail),
        s if s >= 500 => S3Error::Transient(detail),
        // Anything else the service rejected will not succeed on retry
        _ => S3Error::Access(detail),
    }
}

/// Map an AWS SDK error into the engine taxonomy
pub fn classify_sdk_error<E>(err: SdkError<E>, target: &str) -> S3Error
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match &err {
        SdkError::ServiceError(service_err) => {
            let status = service_err.raw().status().as_u16();
            classify_service_error(status, err.code(), err.message(), target)
        }
        SdkError::ConstructionFailure(_) => S3Error::Configuration(format!(
            "{}: {}",
            target,
            DisplayErrorContext(&err)
        )),
        _ => S3Error::Transient(format!("{}: {}", target, DisplayErrorContext(&err))),
    }
}
