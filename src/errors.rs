use thiserror::Error;

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Socket or stream I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The gate answered session establishment with something other than
    /// a negotiated-heartbeat message.
    #[error("could not establish session, received {0:?}")]
    Establish(Vec<u8>),

    /// The gate socket ended in the middle of a frame.
    #[error("input stream ended mid-frame")]
    TruncatedFrame,

    /// WebSocket transport failure.
    #[error("websocket error: {0}")]
    Websocket(String),

    /// Book feed message that could not be parsed.
    #[error("book feed parse error: {0}")]
    FeedParse(#[from] serde_json::Error),

    /// Configuration file could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),

    /// A connect was attempted on a channel that is already connected.
    #[error("channel already connected")]
    AlreadyConnected,
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn websocket(msg: impl Into<String>) -> Self {
        Error::Websocket(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
