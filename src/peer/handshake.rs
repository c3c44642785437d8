use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::metadata::file::InfoHash;
use crate::peer::error::PeerError;
use crate::peer::peer_id::PeerId;

pub const P_STR: &[u8; 19] = b"BitTorrent protocol";
pub const HANDSHAKE_LENGTH: usize = 68;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("handshake must be 68 bytes but is {0}")]
    InvalidHandshakeLength(usize),
    #[error("protocol identifier length must be 19 but is {0}")]
    InvalidProtocolIdLength(u8),
    #[error("unknown protocol identifier {}", String::from_utf8_lossy(.0))]
    InvalidProtocolId([u8; 19]),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Handshake { reserved: [0; 8], info_hash, peer_id }
    }
}

impl TryFrom<&[u8]> for Handshake {
    type Error = HandshakeError;
    fn try_from(bytes: &[u8]) -> Result<Self, HandshakeError> {
        let bytes: &[u8; HANDSHAKE_LENGTH] = bytes
            .try_into()
            .map_err(|_| HandshakeError::InvalidHandshakeLength(bytes.len()))?;
        if bytes[0] as usize != P_STR.len() {
            return Err(HandshakeError::InvalidProtocolIdLength(bytes[0]));
        }
        let mut p_str = [0u8; 19];
        p_str.copy_from_slice(&bytes[1..20]);
        if p_str != *P_STR {
            return Err(HandshakeError::InvalidProtocolId(p_str));
        }
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&bytes[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&bytes[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&bytes[48..68]);
        Ok(Handshake { reserved, info_hash, peer_id: PeerId::from_bytes(peer_id) })
    }
}

impl From<&Handshake> for [u8; HANDSHAKE_LENGTH] {
    fn from(handshake: &Handshake) -> [u8; HANDSHAKE_LENGTH] {
        let mut bytes = [0u8; HANDSHAKE_LENGTH];
        bytes[0] = P_STR.len() as u8;
        bytes[1..20].copy_from_slice(P_STR);
        bytes[20..28].copy_from_slice(&handshake.reserved);
        bytes[28..48].copy_from_slice(&handshake.info_hash);
        bytes[48..68].copy_from_slice(handshake.peer_id.as_bytes());
        bytes
    }
}

/// Sends our handshake and reads the peer's, which must name the same info hash.
pub(crate) async fn exchange<S>(stream: &mut S, mine: &Handshake) -> Result<Handshake, PeerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let my_bytes = <[u8; HANDSHAKE_LENGTH]>::from(mine);
    stream.write_all(&my_bytes).await?;
    stream.flush().await?;

    let mut buf = [0u8; HANDSHAKE_LENGTH];
    stream.read_exact(&mut buf).await?;
    let theirs = Handshake::try_from(buf.as_slice())?;
    if theirs.info_hash != mine.info_hash {
        return Err(PeerError::HandshakeMismatch { expected: mine.info_hash, received: theirs.info_hash });
    }
    Ok(theirs)
}
