//! Small helpers shared across the crate.

mod clock;

pub use self::clock::{ClockSource, DualTimestamp, Monotonic, Realtime, Time};
