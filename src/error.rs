//! Custom error types for the application.
//!
//! This module defines the primary error type, `MoptopError`, for the entire
//! acquisition engine. Using the `thiserror` crate, it provides a centralized
//! and consistent way to handle everything from I/O and configuration issues
//! to rotator, camera and protocol-handshake failures.
//!
//! ## Error hierarchy
//!
//! `MoptopError` consolidates the error classes laid out by the engine's
//! error-handling design: fatal conditions that abort a run (`RotatorTimeout`,
//! `BufferMissed`, `CameraOpenFailed`), conditions the camera driver retries
//! internally before escalating (`VendorCall`), and argument-level validation
//! failures raised while decoding a `RUN` payload (`InvalidArgument`).
//! "Reported but continued" conditions (cooling timeout on a secondary pass,
//! a missing timestamp tick, an unrecognised filter position) are not errors
//! at all here — they are logged at `WARN` and represented as a degraded
//! value, matching the source engine's pattern of logging and continuing
//! past a non-fatal failure.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, MoptopError>;

#[derive(Error, Debug)]
pub enum MoptopError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid argument '-{flag}': {reason}")]
    InvalidArgument { flag: char, reason: String },

    #[error("Rotator connection failed after all retries: {0}")]
    RotatorConnect(String),

    #[error("Rotator did not reach target within timeout")]
    RotatorTimeout,

    #[error("Rotator command error: {0}")]
    Rotator(String),

    #[error("Filter wheel command error: {0}")]
    FilterWheel(String),

    #[error("Camera failed to open: {0}")]
    CameraOpenFailed(String),

    #[error("Vendor call '{call}' failed after {attempts} attempts: {reason}")]
    VendorCall {
        call: String,
        attempts: u32,
        reason: String,
    },

    #[error("Missed image buffer for frame {frame} (fatal, aborting run)")]
    BufferMissed { frame: u32 },

    #[error("Cooling timeout waiting for sensor to reach target")]
    CoolingTimeout,

    #[error("Unknown camera serial number: {0}")]
    UnknownCameraSerial(String),

    #[error("Transport timeout waiting for {0}")]
    TransportTimeout(String),

    #[error("Transport received unexpected reply: expected '{expected}', got '{got}'")]
    UnexpectedReply { expected: String, got: String },

    #[error("Socket error: {0}")]
    Socket(String),

    #[error("FITS write failed: {0}")]
    Fits(String),

    #[error("Sequencer error: {0}")]
    Sequencer(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MoptopError::Rotator("no response".to_string());
        assert_eq!(err.to_string(), "Rotator command error: no response");
    }

    #[test]
    fn test_buffer_missed_is_fatal_message() {
        let err = MoptopError::BufferMissed { frame: 5 };
        assert!(err.to_string().contains("frame 5"));
    }

    #[test]
    fn test_invalid_argument_display() {
        let err = MoptopError::InvalidArgument {
            flag: 'b',
            reason: "must be one of 1,2,3,4,8".into(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid argument '-b': must be one of 1,2,3,4,8"
        );
    }
}
