use thiserror::Error;

/// Outcome classification for one call against the remote index.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

impl UploadError {
    /// A bad URL will not fix itself between attempts; everything else might.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, UploadError::InvalidUrl(_))
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            UploadError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for UploadError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UploadError::Timeout
        } else if err.is_connect() {
            UploadError::Connect(err.to_string())
        } else if err.is_builder() {
            UploadError::InvalidUrl(err.to_string())
        } else {
            UploadError::Transport(err.to_string())
        }
    }
}

impl From<url::ParseError> for UploadError {
    fn from(err: url::ParseError) -> Self {
        UploadError::InvalidUrl(err.to_string())
    }
}

/// Caps server bodies before they reach a log line.
pub(crate) fn truncate_body(body: &str) -> String {
    const MAX: usize = 512;
    if body.len() <= MAX {
        return body.to_string();
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_invalid_url_is_permanent() {
        assert!(UploadError::Timeout.is_retryable());
        assert!(UploadError::Connect("refused".into()).is_retryable());
        assert!(UploadError::Status {
            status: 503,
            body: String::new()
        }
        .is_retryable());
        assert!(!UploadError::InvalidUrl("nope".into()).is_retryable());
    }

    #[test]
    fn long_bodies_are_truncated_on_char_boundary() {
        let body = "é".repeat(400);
        let out = truncate_body(&body);
        assert!(out.ends_with("..."));
        assert!(out.len() <= 515);
        assert_eq!(truncate_body("short"), "short");
    }
}
