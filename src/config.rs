use std::time::Duration;

use crate::peer::PeerId;

pub const DEFAULT_PORT: u16 = 6881;

/// Largest frame accepted from a peer: a 1 MiB bitfield or block plus piece header.
pub const DEFAULT_MAX_FRAME_LENGTH: u32 = (1 << 20) + 13;

/// Settings shared by the tracker client and every peer connection.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub peer_id: PeerId,
    pub port: u16,
    pub compact: bool,
    pub tracker_timeout: Duration,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Capacity of the per-connection frame and control channels.
    pub channel_capacity: usize,
    pub max_frame_length: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            peer_id: PeerId::generate(),
            port: DEFAULT_PORT,
            compact: true,
            tracker_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            channel_capacity: 64,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl ClientConfig {
    pub fn with_peer_id(mut self, peer_id: PeerId) -> Self {
        self.peer_id = peer_id;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}
