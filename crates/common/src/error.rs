use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("bootstrap error: {0}")]
    Bootstrap(String),

    #[error("control channel closed")]
    ChannelClosed,

    #[error("timed out waiting for a response")]
    ResponseTimeout,
}
