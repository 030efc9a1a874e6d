use thiserror::Error;

/// Errors produced by the gateway and its protocol layer.
#[derive(Debug, Error)]
pub enum GuacError {
    #[error("codec error: {0}")]
    Codec(String),

    /// The connection token could not be decoded, authenticated, or parsed.
    ///
    /// Deliberately carries no detail about which step failed.
    #[error("token validation failed")]
    TokenValidation,

    #[error("connection settings rejected: {0}")]
    SettingsRejected(String),

    #[error("daemon unreachable: {0}")]
    DaemonUnreachable(String),

    #[error("daemon error: {0}")]
    Daemon(String),

    #[error("guacd was inactive for too long")]
    DaemonInactivityTimeout,

    #[error("WS was inactive for too long")]
    BrowserInactivityTimeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for GuacError {
    fn from(e: serde_json::Error) -> Self {
        GuacError::Codec(e.to_string())
    }
}

pub type GuacResult<T> = Result<T, GuacError>;
