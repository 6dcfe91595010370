use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Rate limit exceeded: {0} requests in the last 60s")]
    RateLimited(u32),

    #[error("Authorization failed: {0}")]
    Authorization(String),

    #[error("State conflict: {0}")]
    StateConflict(String),

    #[error("Negotiation rounds exhausted after {0} rounds")]
    NegotiationExhausted(u32),

    #[error("Upstream PMS error: {0}")]
    Upstream(String),

    #[error("Circuit breaker open for property {0}")]
    CircuitOpen(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl GatewayError {
    /// HTTP-style status code carried in the response envelope.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Config(_) => 500,
            Self::Validation(_) => 400,
            Self::Authentication(_) => 401,
            Self::RateLimited(_) => 429,
            Self::Authorization(_) => 403,
            Self::StateConflict(_) | Self::NegotiationExhausted(_) => 409,
            Self::Upstream(_) => 502,
            Self::CircuitOpen(_) => 503,
            Self::NotFound(_) => 404,
            Self::Database(_) | Self::Io(_) | Self::Serialization(_) => 500,
            Self::Network(_) => 502,
        }
    }

    /// Whether the caller may retry the same request later. Validation,
    /// authorization, and state conflicts are terminal for this request;
    /// rate limits, open circuits, and upstream failures are transient.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited(_)
                | Self::CircuitOpen(_)
                | Self::Upstream(_)
                | Self::Network(_)
                | Self::Database(_)
                | Self::Io(_)
        )
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Serialization(err.to_string())
    }
}

impl From<uuid::Error> for GatewayError {
    fn from(err: uuid::Error) -> Self {
        GatewayError::Validation(err.to_string())
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Io(err.to_string())
    }
}
