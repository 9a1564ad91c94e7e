use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrowserlessError>;

#[derive(Debug, Error)]
pub enum BrowserlessError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("DevTools protocol error: {0}")]
    Cdp(String),
}

impl From<reqwest::Error> for BrowserlessError {
    fn from(err: reqwest::Error) -> Self {
        BrowserlessError::Network(err.to_string())
    }
}

impl From<chromiumoxide::error::CdpError> for BrowserlessError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        BrowserlessError::Cdp(err.to_string())
    }
}
