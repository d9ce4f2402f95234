// =============================================================================
// Error kinds for the signal-to-exit pipeline
// =============================================================================
//
// Sizing and engine errors are terminal for a single signal only. Exchange
// errors abort the current order-affecting step but never roll back a leg
// that already went through. Configuration errors fail account enable.
// =============================================================================

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BotError {
    /// Non-positive, NaN or infinite numeric input to sizing/risk math.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The exchange answered with a non-success code.
    #[error("exchange rejected request (code {code}): {message}")]
    ExchangeRejection { code: String, message: String },

    /// Transport-level failure talking to the exchange.
    #[error("network error: {0}")]
    TransientNetwork(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("persistence error: {0}")]
    Persistence(String),
}

impl BotError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn rejection(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExchangeRejection {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Transport failures may succeed on a later attempt; everything else
    /// needs operator attention or a different input.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientNetwork(_))
    }
}

impl From<reqwest::Error> for BotError {
    fn from(e: reqwest::Error) -> Self {
        Self::TransientNetwork(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for BotError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::TransientNetwork(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BotError>;
