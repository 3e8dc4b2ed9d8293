//! Client configuration constants.
//!
//! Centralizes hardcoded values for easier configuration and documentation.

/// Capacity of the session event broadcast channel. Slow subscribers that
/// fall further behind than this see `RecvError::Lagged`.
pub const SESSION_EVENT_CAPACITY: usize = 64;

/// Largest exponent applied to a period during retry backoff. Past this many
/// consecutive failures the delay stops doubling (and `max_backoff` usually
/// caps it long before).
pub const MAX_BACKOFF_SHIFT: u32 = 10;

