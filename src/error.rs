//! Error types for the media relay

use thiserror::Error;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Error types that can occur in the relay
#[derive(Error, Debug, Clone)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Missing required parameter: {0}")]
    MissingParameter(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("Upstream returned {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    #[error("Upstream body stream failed: {0}")]
    StreamError(String),

    #[error("Response body is not readable")]
    BodyUnavailable,

    #[error("Invalid byte range: {0}")]
    InvalidRange(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::IoError(err.to_string())
    }
}

impl RelayError {
    /// Convert error to the HTTP status code returned downstream
    ///
    /// Caller mistakes map to 4xx, an upstream status is passed through
    /// as-is, and transport faults become 502 Bad Gateway.
    pub fn to_http_status(&self) -> u16 {
        match self {
            RelayError::MissingParameter(_) => 400,
            RelayError::InvalidRequest(_) => 400,
            RelayError::ParseError(_) => 400,
            RelayError::InvalidRange(_) => 416,
            RelayError::NotFound(_) => 404,

            RelayError::UpstreamStatus { status, .. } => *status,

            RelayError::UpstreamUnreachable(_) => 502,
            RelayError::StreamError(_) => 502,
            RelayError::BodyUnavailable => 502,

            RelayError::ConfigError(_) => 500,
            RelayError::HttpError(_) => 500,
            RelayError::IoError(_) => 500,
        }
    }

    /// Whether the error was caused by the downstream caller and was
    /// rejected before any upstream contact
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            RelayError::MissingParameter(_)
                | RelayError::InvalidRequest(_)
                | RelayError::ParseError(_)
                | RelayError::InvalidRange(_)
                | RelayError::NotFound(_)
        )
    }

    /// Create a missing-parameter error
    pub fn missing(name: impl Into<String>) -> Self {
        RelayError::MissingParameter(name.into())
    }

    /// Create an error from an upstream HTTP status code and body text
    pub fn from_http_status(status: u16, body: impl Into<String>) -> Self {
        RelayError::UpstreamStatus {
            status,
            body: body.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_parameter_is_bad_request() {
        let err = RelayError::missing("rel_path");
        assert_eq!(err.to_http_status(), 400);
        assert!(err.is_client_error());
        assert_eq!(err.to_string(), "Missing required parameter: rel_path");
    }

    #[test]
    fn test_upstream_status_passes_through() {
        for status in [401u16, 404, 416, 500, 503] {
            let err = RelayError::from_http_status(status, "boom");
            assert_eq!(err.to_http_status(), status);
            assert!(!err.is_client_error());
        }
    }

    #[test]
    fn test_transport_faults_are_bad_gateway() {
        assert_eq!(RelayError::UpstreamUnreachable("refused".into()).to_http_status(), 502);
        assert_eq!(RelayError::StreamError("reset".into()).to_http_status(), 502);
        assert_eq!(RelayError::BodyUnavailable.to_http_status(), 502);
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        let err: RelayError = io.into();
        assert!(matches!(err, RelayError::IoError(ref m) if m == "disk"));
        assert_eq!(err.to_http_status(), 500);
    }
}
