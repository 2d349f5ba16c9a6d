//! Discovery beacon wire format
//!
//! Neighbor discovery broadcasts a fixed 12-byte datagram on UDP port 9697:
//! `{u32 seqno (network order), u8 interval_seconds, u8 mac[6], u8 pad[2]}`.
//! A receiver keeps the sender's interface alive for
//! `(interval + 1 s) * 3`; missing three beacons in a row expires it.

use std::time::Duration;
use thiserror::Error;

/// UDP port beacons are broadcast on
pub const BEACON_PORT: u16 = 9697;

/// Encoded beacon length
pub const BEACON_LEN: usize = 12;

/// Number of consecutive beacons a neighbor may miss before expiry
pub const BEACON_LOSS_MAX: u32 = 3;

/// Slack added to the advertised interval when computing lifetimes
pub const BEACON_EPSILON: Duration = Duration::from_secs(1);

/// Beacon decoding errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BeaconError {
    #[error("bad beacon length: {0} bytes (expected {BEACON_LEN})")]
    BadLength(usize),
}

/// One discovery beacon
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Beacon {
    /// Sender's monotonically increasing sequence number
    pub seqno: u32,
    /// Sender's current beacon interval in seconds
    pub interval: u8,
    /// Sender's interface MAC
    pub mac: [u8; 6],
}

impl Beacon {
    pub fn new(seqno: u32, interval: u8, mac: [u8; 6]) -> Self {
        Beacon {
            seqno,
            interval,
            mac,
        }
    }

    pub fn encode(&self) -> [u8; BEACON_LEN] {
        let mut out = [0u8; BEACON_LEN];
        out[0..4].copy_from_slice(&self.seqno.to_be_bytes());
        out[4] = self.interval;
        out[5..11].copy_from_slice(&self.mac);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Beacon, BeaconError> {
        if bytes.len() != BEACON_LEN {
            return Err(BeaconError::BadLength(bytes.len()));
        }
        Ok(Beacon {
            seqno: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            interval: bytes[4],
            mac: bytes[5..11].try_into().expect("length checked"),
        })
    }

    /// How long the sender's interface should stay alive after receiving
    /// this beacon
    pub fn lifetime(&self) -> Duration {
        (Duration::from_secs(self.interval as u64) + BEACON_EPSILON) * BEACON_LOSS_MAX
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: [u8; 6] = [0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee];

    #[test]
    fn test_encode_layout() {
        let b = Beacon::new(0x01020304, 5, MAC);
        let bytes = b.encode();
        assert_eq!(bytes.len(), BEACON_LEN);
        // seqno in network order
        assert_eq!(&bytes[0..4], &[1, 2, 3, 4]);
        assert_eq!(bytes[4], 5);
        assert_eq!(&bytes[5..11], &MAC);
        // pad stays zero
        assert_eq!(bytes[11], 0);
    }

    #[test]
    fn test_roundtrip() {
        let b = Beacon::new(42, 2, MAC);
        assert_eq!(Beacon::decode(&b.encode()).unwrap(), b);
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        assert_eq!(
            Beacon::decode(&[0; 11]),
            Err(BeaconError::BadLength(11))
        );
        assert_eq!(
            Beacon::decode(&[0; 13]),
            Err(BeaconError::BadLength(13))
        );
    }

    #[test]
    fn test_lifetime_arithmetic() {
        // interval 2 s: (2 + 1) * 3 = 9 s
        assert_eq!(
            Beacon::new(0, 2, MAC).lifetime(),
            Duration::from_secs(9)
        );
        // interval 5 s: (5 + 1) * 3 = 18 s
        assert_eq!(
            Beacon::new(0, 5, MAC).lifetime(),
            Duration::from_secs(18)
        );
    }
}
