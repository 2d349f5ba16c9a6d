//! Haggle wire formats
//!
//! - [`beacon`]: the fixed 12-byte UDP discovery beacon
//! - [`framing`]: the length-prefixed frame codec of the TCP object exchange

pub mod beacon;
pub mod framing;

pub use beacon::{Beacon, BeaconError, BEACON_EPSILON, BEACON_LEN, BEACON_LOSS_MAX, BEACON_PORT};
pub use framing::{Frame, FrameCodec, FrameError, FrameType, DATA_CHUNK_SIZE, MAX_FRAME_SIZE};
