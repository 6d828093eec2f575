use thiserror::Error;

use crate::packet::PacketError;
use crate::session::SessionError;

/// Crate level error. Transport failures are converted into a connection close
/// at the pipeline that observed them; the remaining variants are surfaced to callers
/// of the public API (pool start-up, server bind, configuration load).
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("Malformed packet: {0}")]
    Malformed(String),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Frame does not fit an empty write buffer of {0} bytes")]
    FrameTooLarge(usize),

    #[error("Connection closed")]
    Closed,

    #[error("Selector loop has stopped")]
    SelectorStopped,

    #[error("Timed out waiting for registration change on {0}")]
    RegistrationTimeout(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<toml::de::Error> for BrokerError {
    fn from(err: toml::de::Error) -> Self {
        BrokerError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
