use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid address: {0}")]
    Addr(#[from] std::net::AddrParseError),

    #[error("protocol error: {message}")]
    Protocol { message: String },

    #[error("write buffer full on fd {fd}: {buffered} bytes buffered, high-water mark {high_water}")]
    WriteBufferFull {
        fd: i32,
        buffered: usize,
        high_water: usize,
    },

    #[error("channel closed")]
    ChannelClosed,

    #[error("server error: {0}")]
    Server(String),
}

pub type Result<T> = std::result::Result<T, ChannelError>;

impl ChannelError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol {
            message: msg.into(),
        }
    }

    pub fn server(msg: impl Into<String>) -> Self {
        Self::Server(msg.into())
    }
}
