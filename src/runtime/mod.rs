//! Background sync loop and its event stream.

/// Event stream types emitted by the sync loop.
pub mod events;
/// Handle and command loop implementation.
pub mod handle;
