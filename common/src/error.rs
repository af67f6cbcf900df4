use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("ntp: {0}")]
    Ntp(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
