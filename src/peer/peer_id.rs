use std::fmt;

use time::OffsetDateTime;

const PREFIX: &[u8; 8] = b"-TW0001-";
const SUFFIX_LENGTH: usize = 12;

/// The 20-byte identity this process presents to trackers and peers.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 20]);

impl PeerId {
    /// Client prefix followed by the low-order digits of the current time in nanoseconds.
    pub fn generate() -> Self {
        Self::from_timestamp(OffsetDateTime::now_utc().unix_timestamp_nanos())
    }

    fn from_timestamp(nanos: i128) -> Self {
        let mut id = [b'0'; 20];
        id[..PREFIX.len()].copy_from_slice(PREFIX);
        let digits = nanos.unsigned_abs().to_string();
        let digits = digits.as_bytes();
        let take = digits.len().min(SUFFIX_LENGTH);
        id[20 - take..].copy_from_slice(&digits[digits.len() - take..]);
        PeerId(id)
    }

    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        PeerId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl From<[u8; 20]> for PeerId {
    fn from(bytes: [u8; 20]) -> Self {
        PeerId(bytes)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.0.iter().all(|b| b.is_ascii_graphic()) {
            write!(f, "{}", String::from_utf8_lossy(&self.0))
        } else {
            write!(f, "{}", hex::encode(self.0))
        }
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_prefix_and_time_suffix() {
        let id = PeerId::from_timestamp(1_700_000_000_123_456_789);
        assert_eq!(id.as_bytes(), b"-TW0001-000123456789");
        assert_eq!(id.to_string(), "-TW0001-000123456789");
    }

    #[test]
    fn pads_short_timestamps() {
        let id = PeerId::from_timestamp(42);
        assert_eq!(id.as_bytes(), b"-TW0001-000000000042");
    }

    #[test]
    fn generated_ids_carry_prefix() {
        let id = PeerId::generate();
        assert_eq!(&id.as_bytes()[..8], PREFIX);
        assert!(id.as_bytes()[8..].iter().all(u8::is_ascii_digit));
    }
}
