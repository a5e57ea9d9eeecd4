use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("http request failed for {url}: {message}")]
    Http { url: String, message: String },

    #[error("http status {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("invalid rule in {field}: {message}")]
    InvalidRule { field: String, message: String },

    #[error("no active page context")]
    NoActiveContext,

    #[error("engine used outside its lifecycle: {0}")]
    Lifecycle(String),

    #[error("config error: {0}")]
    Config(String),
}

impl EngineError {
    /// True when the page/tab went away; polling callers treat this as a
    /// normal shutdown signal rather than a failure.
    pub fn is_no_active_context(&self) -> bool {
        matches!(self, EngineError::NoActiveContext)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
