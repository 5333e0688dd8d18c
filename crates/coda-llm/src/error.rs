use std::collections::HashMap;

/// Errors that can occur when interacting with a language model.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("http error: {0}")]
    Http(Box<dyn std::error::Error + Send + Sync>),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("sse error: {0}")]
    Sse(String),

    #[error("api error ({code}): {message}")]
    Api {
        code: String,
        message: String,
        metadata: HashMap<String, serde_json::Value>,
    },

    #[error("request timed out")]
    Timeout,

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether retrying with backoff is worthwhile: network-transient
    /// conditions (timeout, 5xx, rate-limit) vs. a request the server will
    /// never accept (4xx other than 429).
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(_) | Error::Sse(_) | Error::Timeout => true,
            Error::Api { code, .. } => code.as_str() == "429" || code.starts_with('5'),
            Error::Json(_) | Error::Other(_) => false,
        }
    }
}
