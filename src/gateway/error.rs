use thiserror::Error;

/// Failure talking to the brokerage.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Network or HTTP-layer failure
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// Broker answered with a non-success status
    #[error("broker rejected request ({status}): {message}")]
    Api { status: u16, message: String },
    /// Response body did not match the expected shape
    #[error("failed to decode response: {0}")]
    Decode(String),
    /// Data or service not available (used by the paper gateway)
    #[error("unavailable: {0}")]
    Unavailable(String),
}

pub type GatewayResult<T> = Result<T, GatewayError>;
