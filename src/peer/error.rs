use thiserror::Error;

use crate::metadata::file::InfoHash;
use crate::peer::handshake::HandshakeError;
use crate::peer::message::FrameError;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[error("timed out while {0}")]
    Timeout(&'static str),
    #[error("peer answered for info hash {} instead of {}", hex::encode(.received), hex::encode(.expected))]
    HandshakeMismatch { expected: InfoHash, received: InfoHash },
    #[error("invalid handshake: {0}")]
    InvalidHandshake(#[from] HandshakeError),
    #[error("framing error: {0}")]
    Framing(#[from] FrameError),
    #[error("connection is already closed")]
    ConnectionClosed,
}
