//! Error type for calls against the chat backend.
//!
//! Every variant is recoverable from the caller's point of view: the
//! conversation controller turns them into fallback messages or
//! notifications, and the session keeper only logs them.

#[cfg(test)]
#[path = "error_test.rs"]
mod error_test;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The HTTP request could not be sent or its body could not be read.
    #[error("request failed: {0}")]
    Request(String),

    /// The backend answered with a non-success status.
    #[error("request failed: {status}")]
    Status { status: u16, body: String },

    /// The response body was not valid JSON for the expected shape.
    #[error("response parse failed: {0}")]
    Parse(String),

    /// The JSON parsed but did not carry the expected envelope.
    #[error("unexpected response envelope: {0}")]
    Envelope(String),

    /// A 401 could not be resolved by refreshing the credential.
    #[error("unauthorized")]
    Unauthorized,

    /// The call needs a signed-in user and there is none.
    #[error("no credential available")]
    MissingCredential,

    /// The underlying HTTP client could not be constructed.
    #[error("HTTP client build failed: {0}")]
    HttpClientBuild(String),
}

impl ApiError {
    /// True for failures a later attempt might not hit again.
    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Request(_) | Self::Status { status: 429 | 500..=599, .. })
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Parse(e.to_string())
        } else {
            Self::Request(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e.to_string())
    }
}
