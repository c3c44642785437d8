//! Peer wire protocol: handshake, message framing, and the per-peer
//! connection tasks built on them.

mod connection;
mod error;
mod handshake;
mod message;
mod peer_id;

pub use connection::{Command, ConnectionState, PeerConnection, PeerEvent};
pub use error::PeerError;
pub use handshake::{Handshake, HandshakeError, HANDSHAKE_LENGTH, P_STR};
pub use message::{read_frame, write_frame, FrameError, LengthBound, MessageKind, WireMessage};
pub use peer_id::PeerId;
