use std::io::ErrorKind;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Choke         = 0,
    Unchoke       = 1,
    Interested    = 2,
    NotInterested = 3,
    Have          = 4,
    Bitfield      = 5,
    Request       = 6,
    Piece         = 7,
    Cancel        = 8,
    Port          = 9,
}

/// Permitted frame length (id plus payload) for a message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthBound {
    Exact(u32),
    AtLeast(u32),
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("peer closed the stream")]
    EndOfStream,
    #[error("stream ended after {received} of 4 length prefix bytes")]
    TruncatedHeader { received: usize },
    #[error("stream ended inside a frame of declared length {length}")]
    Truncated { length: u32 },
    #[error("{kind:?} frame of length {length} is shorter than {minimum}")]
    TooShort { kind: MessageKind, length: u32, minimum: u32 },
    #[error("{kind:?} frame must have length {expected} but has {length}")]
    WrongLength { kind: MessageKind, length: u32, expected: u32 },
    #[error("frame length {length} exceeds limit of {limit}")]
    TooLarge { length: u32, limit: u32 },
    #[error("failed to read frame: {0}")]
    Io(std::io::Error),
}

impl TryFrom<u8> for MessageKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(MessageKind::Choke),
            1 => Ok(MessageKind::Unchoke),
            2 => Ok(MessageKind::Interested),
            3 => Ok(MessageKind::NotInterested),
            4 => Ok(MessageKind::Have),
            5 => Ok(MessageKind::Bitfield),
            6 => Ok(MessageKind::Request),
            7 => Ok(MessageKind::Piece),
            8 => Ok(MessageKind::Cancel),
            9 => Ok(MessageKind::Port),
            _ => Err(value),
        }
    }
}

impl MessageKind {
    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn length_bound(self) -> LengthBound {
        match self {
            MessageKind::Choke
            | MessageKind::Unchoke
            | MessageKind::Interested
            | MessageKind::NotInterested => LengthBound::Exact(1),
            MessageKind::Have => LengthBound::Exact(5),
            MessageKind::Bitfield => LengthBound::AtLeast(1),
            MessageKind::Request | MessageKind::Cancel => LengthBound::Exact(13),
            MessageKind::Piece => LengthBound::AtLeast(9),
            MessageKind::Port => LengthBound::Exact(3),
        }
    }

    pub fn min_length(self) -> u32 {
        match self.length_bound() {
            LengthBound::Exact(n) | LengthBound::AtLeast(n) => n,
        }
    }

    fn check_length(self, length: u32) -> Result<(), FrameError> {
        match self.length_bound() {
            LengthBound::Exact(expected) if length != expected => {
                Err(FrameError::WrongLength { kind: self, length, expected })
            },
            LengthBound::AtLeast(minimum) if length < minimum => {
                Err(FrameError::TooShort { kind: self, length, minimum })
            },
            _ => Ok(()),
        }
    }
}

/// One length-prefixed frame. Payloads are carried uninterpreted; ids outside
/// the standard catalog pass through with `kind()` returning `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    KeepAlive,
    Frame { id: u8, payload: Vec<u8> },
}

impl WireMessage {
    pub fn new(kind: MessageKind, payload: Vec<u8>) -> Self {
        WireMessage::Frame { id: kind.id(), payload }
    }

    pub fn choke() -> Self {
        WireMessage::new(MessageKind::Choke, Vec::new())
    }

    pub fn unchoke() -> Self {
        WireMessage::new(MessageKind::Unchoke, Vec::new())
    }

    pub fn interested() -> Self {
        WireMessage::new(MessageKind::Interested, Vec::new())
    }

    pub fn not_interested() -> Self {
        WireMessage::new(MessageKind::NotInterested, Vec::new())
    }

    pub fn have(index: u32) -> Self {
        WireMessage::new(MessageKind::Have, index.to_be_bytes().to_vec())
    }

    pub fn bitfield(bitmap: &[u8]) -> Self {
        WireMessage::new(MessageKind::Bitfield, bitmap.to_vec())
    }

    pub fn request(index: u32, begin: u32, length: u32) -> Self {
        WireMessage::new(MessageKind::Request, encode_12(index, begin, length))
    }

    pub fn piece(index: u32, begin: u32, block: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(8 + block.len());
        payload.extend_from_slice(&index.to_be_bytes());
        payload.extend_from_slice(&begin.to_be_bytes());
        payload.extend_from_slice(block);
        WireMessage::new(MessageKind::Piece, payload)
    }

    pub fn cancel(index: u32, begin: u32, length: u32) -> Self {
        WireMessage::new(MessageKind::Cancel, encode_12(index, begin, length))
    }

    pub fn port(port: u16) -> Self {
        WireMessage::new(MessageKind::Port, port.to_be_bytes().to_vec())
    }

    /// Value of the length prefix: id plus payload bytes, zero for a keep-alive.
    pub fn length(&self) -> u32 {
        match self {
            WireMessage::KeepAlive => 0,
            WireMessage::Frame { payload, .. } => 1 + payload.len() as u32,
        }
    }

    pub fn id(&self) -> Option<u8> {
        match self {
            WireMessage::KeepAlive => None,
            WireMessage::Frame { id, .. } => Some(*id),
        }
    }

    pub fn kind(&self) -> Option<MessageKind> {
        self.id().and_then(|id| MessageKind::try_from(id).ok())
    }

    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            WireMessage::Frame { payload, .. } if !payload.is_empty() => Some(payload),
            _ => None,
        }
    }

    pub fn is_keep_alive(&self) -> bool {
        matches!(self, WireMessage::KeepAlive)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.length() as usize);
        buf.extend_from_slice(&self.length().to_be_bytes());
        if let WireMessage::Frame { id, payload } = self {
            buf.push(*id);
            buf.extend_from_slice(payload);
        }
        buf
    }
}

fn encode_12(index: u32, begin: u32, length: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(12);
    payload.extend_from_slice(&index.to_be_bytes());
    payload.extend_from_slice(&begin.to_be_bytes());
    payload.extend_from_slice(&length.to_be_bytes());
    payload
}

/// Reads one frame. A clean end of stream before the first header byte is
/// reported as `EndOfStream`; running out of data anywhere else is
/// `TruncatedHeader` or `Truncated`.
pub async fn read_frame<R>(reader: &mut R, max_length: u32) -> Result<WireMessage, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..]).await.map_err(FrameError::Io)?;
        if n == 0 {
            return Err(if filled == 0 {
                FrameError::EndOfStream
            } else {
                FrameError::TruncatedHeader { received: filled }
            });
        }
        filled += n;
    }

    let length = u32::from_be_bytes(header);
    if length == 0 {
        return Ok(WireMessage::KeepAlive);
    }
    if length > max_length {
        return Err(FrameError::TooLarge { length, limit: max_length });
    }

    let mut id = [0u8; 1];
    read_body(reader, &mut id, length).await?;
    if let Ok(kind) = MessageKind::try_from(id[0]) {
        kind.check_length(length)?;
    }

    let mut payload = vec![0u8; length as usize - 1];
    read_body(reader, &mut payload, length).await?;
    Ok(WireMessage::Frame { id: id[0], payload })
}

async fn read_body<R>(reader: &mut R, buf: &mut [u8], length: u32) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(FrameError::Truncated { length }),
        Err(e) => Err(FrameError::Io(e)),
    }
}

pub async fn write_frame<W>(writer: &mut W, message: &WireMessage) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&message.encode()).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: u32 = 1 << 16;

    async fn read(bytes: &[u8]) -> Result<WireMessage, FrameError> {
        let mut reader = bytes;
        read_frame(&mut reader, LIMIT).await
    }

    #[tokio::test]
    async fn zero_length_is_keep_alive() {
        let message = read(&[0, 0, 0, 0]).await.unwrap();
        assert!(message.is_keep_alive());
        assert_eq!(message.id(), None);
        assert_eq!(message.payload(), None);
        assert_eq!(message.length(), 0);
    }

    #[tokio::test]
    async fn length_one_has_id_without_payload() {
        let message = read(&[0, 0, 0, 1, 1]).await.unwrap();
        assert_eq!(message.id(), Some(1));
        assert_eq!(message.kind(), Some(MessageKind::Unchoke));
        assert_eq!(message.payload(), None);
    }

    #[tokio::test]
    async fn request_frame_carries_twelve_bytes() {
        let mut bytes = vec![0, 0, 0, 13, 6];
        bytes.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0x40, 0, 0, 0, 0x40, 0]);
        let message = read(&bytes).await.unwrap();
        assert_eq!(message.id(), Some(6));
        assert_eq!(message.payload().map(<[u8]>::len), Some(12));
        assert_eq!(message, WireMessage::request(1, 0x4000, 0x4000));
    }

    #[tokio::test]
    async fn consecutive_frames_are_read_in_order() {
        let mut bytes = WireMessage::KeepAlive.encode();
        bytes.extend(WireMessage::have(7).encode());
        bytes.extend(WireMessage::piece(1, 2, b"block").encode());
        let mut reader = bytes.as_slice();
        assert_eq!(read_frame(&mut reader, LIMIT).await.unwrap(), WireMessage::KeepAlive);
        assert_eq!(read_frame(&mut reader, LIMIT).await.unwrap(), WireMessage::have(7));
        assert_eq!(read_frame(&mut reader, LIMIT).await.unwrap(), WireMessage::piece(1, 2, b"block"));
        assert!(matches!(read_frame(&mut reader, LIMIT).await, Err(FrameError::EndOfStream)));
    }

    #[tokio::test]
    async fn truncated_frames_are_errors() {
        assert!(matches!(read(&[0, 0, 0, 13, 6, 0, 0, 0]).await, Err(FrameError::Truncated { length: 13 })));
        assert!(matches!(read(&[0, 0, 0, 5]).await, Err(FrameError::Truncated { length: 5 })));
        assert!(matches!(read(&[0, 0]).await, Err(FrameError::TruncatedHeader { received: 2 })));
        assert!(matches!(read(&[0, 0, 0]).await, Err(FrameError::TruncatedHeader { received: 3 })));
        assert!(matches!(read(&[]).await, Err(FrameError::EndOfStream)));
    }

    #[tokio::test]
    async fn enforces_catalog_length_bounds() {
        assert!(matches!(
            read(&[0, 0, 0, 3, 4, 0, 0]).await,
            Err(FrameError::WrongLength { kind: MessageKind::Have, length: 3, expected: 5 })
        ));
        assert!(matches!(
            read(&[0, 0, 0, 2, 0, 0]).await,
            Err(FrameError::WrongLength { kind: MessageKind::Choke, .. })
        ));
        assert!(matches!(
            read(&[0, 0, 0, 5, 7, 0, 0, 0, 0]).await,
            Err(FrameError::TooShort { kind: MessageKind::Piece, minimum: 9, .. })
        ));
        assert!(matches!(read(&[0, 1, 0, 1]).await, Err(FrameError::TooLarge { length: 65537, .. })));
    }

    #[tokio::test]
    async fn unknown_ids_pass_through() {
        let message = read(&[0, 0, 0, 3, 20, 0, 1]).await.unwrap();
        assert_eq!(message.id(), Some(20));
        assert_eq!(message.kind(), None);
        assert_eq!(message.payload(), Some([0u8, 1].as_slice()));
    }

    #[test]
    fn encodes_catalog_messages() {
        assert_eq!(WireMessage::KeepAlive.encode(), vec![0, 0, 0, 0]);
        assert_eq!(WireMessage::interested().encode(), vec![0, 0, 0, 1, 2]);
        assert_eq!(WireMessage::have(258).encode(), vec![0, 0, 0, 5, 4, 0, 0, 1, 2]);
        assert_eq!(WireMessage::port(6881).encode(), vec![0, 0, 0, 3, 9, 0x1A, 0xE1]);
        assert_eq!(WireMessage::cancel(1, 2, 3).length(), 13);
        for id in 0..=9u8 {
            let kind = MessageKind::try_from(id).unwrap();
            assert_eq!(kind.id(), id);
            assert!(kind.min_length() >= 1);
        }
        assert_eq!(MessageKind::try_from(10), Err(10));
    }

    #[tokio::test]
    async fn write_frame_emits_encoding() {
        let mut out = Vec::new();
        write_frame(&mut out, &WireMessage::bitfield(&[0xF0])).await.unwrap();
        assert_eq!(out, vec![0, 0, 0, 2, 5, 0xF0]);
    }
}
