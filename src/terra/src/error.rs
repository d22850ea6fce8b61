/// Errors from the workspace API
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceApiError {
    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// API returned a non-2xx response
    #[error("HTTP {status} error: {body}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Response body, as returned
        body: String,
    },
    /// JSON deserialization error
    #[error("Deserialization error: {0}")]
    Deserialize(#[from] serde_json::Error),
    /// No bearer token could be obtained
    #[error("Failed to obtain an access token: {0}")]
    Auth(String),
    /// Anything else the API returned that we cannot use
    #[error("Unexpected response: {0}")]
    Unexpected(String),
}

impl WorkspaceApiError {
    /// Connection failures and timeouts are worth retrying; everything else is fatal
    pub fn is_transient(&self) -> bool {
        match self {
            WorkspaceApiError::Http(e) => e.is_connect() || e.is_timeout(),
            _ => false,
        }
    }
}
