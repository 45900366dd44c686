//! Typed adapter errors.

use foundry_core::taxonomy::ErrorCode;

/// Errors raised by a [`GenerationAdapter`](crate::GenerationAdapter).
///
/// Each variant maps to exactly one [`ErrorCode`]; retryability follows the
/// code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    /// The backend could not be reached.
    #[error("Cannot connect to generation backend: {0}")]
    Connection(String),

    #[error("Generation backend request timed out: {0}")]
    Timeout(String),

    /// The backend rejected the prompt or parameters.
    #[error("Invalid generation parameters: {0}")]
    InvalidParameters(String),

    /// The requested backend, node or model is not available.
    #[error("Unsupported capability: {0}")]
    UnsupportedCapability(String),

    /// Transient backend-side failure.
    #[error("Generation failed: {0}")]
    Generation(String),

    /// The backend finished without a usable artifact.
    #[error("Invalid generation output: {0}")]
    Output(String),
}

impl AdapterError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Connection(_) => ErrorCode::ConnectionError,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::InvalidParameters(_) => ErrorCode::InvalidParameters,
            Self::UnsupportedCapability(_) => ErrorCode::UnsupportedCapability,
            Self::Generation(_) => ErrorCode::GenerationFailure,
            Self::Output(_) => ErrorCode::OutputValidation,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }
}

/// Errors building an [`AdapterFactory`](crate::AdapterFactory) from config.
#[derive(Debug, thiserror::Error)]
pub enum FactoryError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Allowlist(#[from] crate::vetting::AllowlistError),
}

impl From<reqwest::Error> for AdapterError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_decode() {
            Self::Generation(format!("malformed backend response: {err}"))
        } else {
            Self::Connection(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_retryability() {
        let cases = [
            (AdapterError::Connection("x".into()), ErrorCode::ConnectionError, true),
            (AdapterError::Timeout("x".into()), ErrorCode::Timeout, true),
            (AdapterError::InvalidParameters("x".into()), ErrorCode::InvalidParameters, false),
            (
                AdapterError::UnsupportedCapability("x".into()),
                ErrorCode::UnsupportedCapability,
                false,
            ),
            (AdapterError::Generation("x".into()), ErrorCode::GenerationFailure, true),
            (AdapterError::Output("x".into()), ErrorCode::OutputValidation, false),
        ];
        for (err, code, retryable) in cases {
            assert_eq!(err.code(), code);
            assert_eq!(err.is_retryable(), retryable, "{err}");
        }
    }
}
