//! Generation error taxonomy.
//!
//! Every failure that reaches a segment or a render job is reduced to an
//! [`ErrorCode`] plus a retryable flag. Adapters raise typed errors, the
//! worker maps them here, and the code string is what gets persisted.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Machine-readable failure code persisted on segments and render jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Backend unreachable.
    ConnectionError,
    /// Request or generation exceeded its time budget.
    Timeout,
    /// The backend rejected the prompt or parameters.
    InvalidParameters,
    /// The backend lacks a feature the request needs.
    UnsupportedCapability,
    /// Backend-reported transient failure.
    GenerationFailure,
    /// The backend finished without a usable artifact.
    OutputValidation,
    /// Job-level: assembling the final artifact failed.
    CompositionFailed,
}

impl ErrorCode {
    /// Whether a failure with this code may be retried without editing the
    /// segment.
    pub fn is_retryable(self) -> bool {
        match self {
            Self::ConnectionError | Self::Timeout | Self::GenerationFailure => true,
            Self::InvalidParameters
            | Self::UnsupportedCapability
            | Self::OutputValidation
            | Self::CompositionFailed => false,
        }
    }

    /// Persisted string form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionError => "CONNECTION_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::InvalidParameters => "INVALID_PARAMETERS",
            Self::UnsupportedCapability => "UNSUPPORTED_CAPABILITY",
            Self::GenerationFailure => "GENERATION_FAILURE",
            Self::OutputValidation => "OUTPUT_VALIDATION",
            Self::CompositionFailed => "COMPOSITION_FAILED",
        }
    }

    /// Parse the persisted string form.
    pub fn parse(code: &str) -> Result<Self, CoreError> {
        ALL_CODES
            .iter()
            .copied()
            .find(|c| c.as_str() == code)
            .ok_or_else(|| CoreError::Validation(format!("Unknown error code '{code}'")))
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const ALL_CODES: [ErrorCode; 7] = [
    ErrorCode::ConnectionError,
    ErrorCode::Timeout,
    ErrorCode::InvalidParameters,
    ErrorCode::UnsupportedCapability,
    ErrorCode::GenerationFailure,
    ErrorCode::OutputValidation,
    ErrorCode::CompositionFailed,
];

/// Failure reported by a backend while polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    /// Code supplied by the adapter when the backend's error is unambiguous.
    pub code: Option<ErrorCode>,
    /// Backend error text.
    pub message: String,
}

impl FailureDetail {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: ErrorCode) -> Self {
        self.code = Some(code);
        self
    }
}

/// Classify a backend failure into the taxonomy.
///
/// An explicit adapter-supplied code wins. Otherwise the message is matched
/// against known phrases; anything unrecognised is a transient
/// [`ErrorCode::GenerationFailure`].
pub fn classify_failure(detail: &FailureDetail) -> ErrorCode {
    if let Some(code) = detail.code {
        return code;
    }

    let message = detail.message.to_ascii_lowercase();
    if message.contains("timed out") || message.contains("timeout") {
        ErrorCode::Timeout
    } else if message.contains("connection") || message.contains("unreachable") {
        ErrorCode::ConnectionError
    } else if message.contains("missing node")
        || message.contains("not installed")
        || message.contains("unsupported")
    {
        ErrorCode::UnsupportedCapability
    } else if message.contains("invalid") || message.contains("parameter") {
        ErrorCode::InvalidParameters
    } else if message.contains("no output") || message.contains("empty output") {
        ErrorCode::OutputValidation
    } else {
        ErrorCode::GenerationFailure
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_codes() {
        assert!(ErrorCode::ConnectionError.is_retryable());
        assert!(ErrorCode::Timeout.is_retryable());
        assert!(ErrorCode::GenerationFailure.is_retryable());
        assert!(!ErrorCode::InvalidParameters.is_retryable());
        assert!(!ErrorCode::UnsupportedCapability.is_retryable());
        assert!(!ErrorCode::OutputValidation.is_retryable());
        assert!(!ErrorCode::CompositionFailed.is_retryable());
    }

    #[test]
    fn codes_parse_back_from_their_string_form() {
        for code in ALL_CODES {
            assert_eq!(ErrorCode::parse(code.as_str()).unwrap(), code);
        }
        assert!(ErrorCode::parse("NOPE").is_err());
    }

    #[test]
    fn serde_uses_the_persisted_form() {
        let json = serde_json::to_string(&ErrorCode::InvalidParameters).unwrap();
        assert_eq!(json, "\"INVALID_PARAMETERS\"");
    }

    #[test]
    fn explicit_code_wins_over_message() {
        let detail = FailureDetail::new("connection reset").with_code(ErrorCode::OutputValidation);
        assert_eq!(classify_failure(&detail), ErrorCode::OutputValidation);
    }

    #[test]
    fn message_heuristics() {
        let cases = [
            ("Request timed out after 30s", ErrorCode::Timeout),
            ("Connection refused", ErrorCode::ConnectionError),
            ("Missing node: VHS_VideoCombine", ErrorCode::UnsupportedCapability),
            ("Invalid value for steps", ErrorCode::InvalidParameters),
            ("No output video produced", ErrorCode::OutputValidation),
            ("CUDA out of memory", ErrorCode::GenerationFailure),
        ];
        for (message, expected) in cases {
            assert_eq!(
                classify_failure(&FailureDetail::new(message)),
                expected,
                "{message}"
            );
        }
    }
}
