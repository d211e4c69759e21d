//! Blocking handoff of small strings from an async control side to a worker
//! thread that cannot yield.
//!
//! A [`SharedChannel`] is a pair of regions shared by both sides:
//!
//! - a control word the worker parks on until a length is deposited
//! - a fixed-capacity byte region holding the UTF-8 value
//!
//! The control side writes the value first and signals second. The worker
//! wakes, consumes the length and decodes exactly that many bytes.
//!
//! # Control word encoding
//!
//! `0` means idle. A deposited length `n` is stored as `n + 1`, so an empty
//! string is distinguishable from "nothing sent yet".

mod channel;
mod codec;

pub use channel::{SharedChannel, DEFAULT_CAPACITY};
pub use codec::{decode, encode};

/// Errors raised by channel and codec operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("Payload of {len} bytes does not fit a {capacity}-byte channel")]
    CapacityExceeded { len: usize, capacity: usize },

    #[error("Length {length} is outside the {capacity}-byte value region")]
    OutOfBounds { length: usize, capacity: usize },

    #[error("Value region does not hold valid UTF-8: {0}")]
    InvalidUtf8(String),

    #[error("Channel closed")]
    Closed,
}
