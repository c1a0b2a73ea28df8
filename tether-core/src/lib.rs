//! Shared types for the ship/offshore uplink: the frame codec, correlation
//! ids and the constants both sides agree on. Kept as its own crate so
//! both binaries and the services crate depend on one definition of the
//! wire format instead of each other.

pub mod config;
pub mod frame;

pub use config::*;
pub use frame::{read_frame, write_frame, CorrelationId, Frame, FrameError, ID_LEN, MAX_FRAME_LEN};
