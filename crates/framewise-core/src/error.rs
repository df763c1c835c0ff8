//! Error types for the engine.

use thiserror::Error;

/// Engine-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Frame slot outside `[0, frames_in_flight)`
    #[error("Frame slot {slot} out of range for {frames_in_flight} frames in flight")]
    SlotOutOfRange {
        slot: usize,
        frames_in_flight: usize,
    },
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
