use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum TwitchApiError {
    #[error("resource not found: {url}")]
    NotFound { url: String },

    #[error("access forbidden: {url}")]
    Forbidden { url: String },

    #[error("request failed with HTTP {status} for {url}")]
    HttpStatus { status: StatusCode, url: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("unexpected GQL response: {reason}")]
    Gql { reason: String },

    #[error("failed to parse {what}: {reason}")]
    Parse { what: &'static str, reason: String },

    #[error("no stream variant matches requested quality `{requested}`")]
    QualityUnavailable { requested: String },
}

impl TwitchApiError {
    pub fn gql(reason: impl Into<String>) -> Self {
        Self::Gql {
            reason: reason.into(),
        }
    }

    pub fn parse(what: &'static str, reason: impl Into<String>) -> Self {
        Self::Parse {
            what,
            reason: reason.into(),
        }
    }

    /// Whether the request may succeed if repeated.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NotFound { .. } | Self::Forbidden { .. } | Self::QualityUnavailable { .. } => {
                false
            }
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Network { source } => {
                source.is_connect() || source.is_timeout() || source.is_request()
            }
            Self::Gql { .. } | Self::Parse { .. } => false,
        }
    }

    /// Whether the error means the broadcast or VOD no longer exists
    /// (or was never published). Deleted VODs answer 403 or 404.
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::Forbidden { .. })
    }
}
