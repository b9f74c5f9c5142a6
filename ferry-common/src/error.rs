use std::error::Error;

use crate::OptionId;

#[derive(thiserror::Error, Debug)]
pub enum FerryError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse URL: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("URL contains no host")]
    NoHostInUrl,
    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),
    #[error("invalid server path: {0}")]
    InvalidPath(String),
    #[error("option {0:?} holds a value of the wrong type")]
    OptionType(OptionId),
    #[error("rate limiter quota must be greater than zero, got {0}")]
    RateLimiterInvalidQuota(u32),
    #[error("rate limit check failed: the request exceeds the bucket capacity")]
    RateLimiterInsufficientCapacity,
    #[error("not connected")]
    NotConnected,
    #[error("engine is gone")]
    EngineGone,
    #[error(transparent)]
    Other(Box<dyn Error + Send + Sync>),
}

impl FerryError {
    pub fn other<E: Error + Send + Sync + 'static>(err: E) -> Self {
        Self::Other(Box::new(err))
    }
}
