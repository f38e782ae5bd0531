use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TUN error: {0}")]
    Tun(String),

    #[error("Adapter already exists")]
    AlreadyExists,

    #[error("{0} are operating")]
    Operating(&'static str),

    #[error("{0} not support")]
    Unsupported(String),

    #[error("Command failed: {0}")]
    Command(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl From<tun::Error> for Error {
    fn from(e: tun::Error) -> Self {
        Error::Tun(e.to_string())
    }
}

impl From<uuid::Error> for Error {
    fn from(e: uuid::Error) -> Self {
        Error::Config(format!("Invalid GUID: {}", e))
    }
}
