//! Rotator driver: an abstract precision rotation stage behind a typed
//! trait, plus the two concrete implementations (a real serial-attached
//! device and a mock for tests).
//!
//! Grounded on `mop_rot.c`, which wraps a PI GCS-protocol controller
//! (`PI_ConnectRS232ByDevName`, `PI_qPOS`, `PI_MOV`, `PI_qONT`,
//! `PI_GcsCommandset`). The vendor command strings themselves are out of
//! scope (per the source specification's exclusions) — what's modeled is
//! the shape of the interface: connect-with-retry, position query,
//! absolute move, on-target polling wait, and programmable trigger arming.

pub mod mock;
#[cfg(feature = "tokio_serial")]
pub mod serial;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::AppResult;

/// Trigger pulse polarity, mirroring the `ROT_TRG_HI`/`ROT_TRG_LO` constants
/// used when arming the rotator's trigger output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerPolarity {
    ActiveHigh,
    ActiveLow,
}

/// The abstract precision rotator behind the vendor-specific serial
/// protocol.
#[async_trait]
pub trait Rotator: Send + Sync {
    /// Opens the connection, retrying up to 5 times at 1-second intervals
    /// before returning a fatal [`crate::error::MoptopError::RotatorConnect`].
    async fn connect(&self) -> AppResult<()>;

    /// Disconnects, releasing the underlying serial port.
    async fn disconnect(&self) -> AppResult<()>;

    /// Stops any in-progress motion immediately.
    async fn stop(&self) -> AppResult<()>;

    /// Clears any latched controller error state.
    async fn clear_errors(&self) -> AppResult<()>;

    /// Commands an absolute move without waiting for arrival.
    async fn move_absolute(&self, position_deg: f64) -> AppResult<()>;

    /// Commands an absolute move and polls on-target every 1ms up to
    /// `timeout`, returning the position actually reached.
    async fn goto(&self, position_deg: f64, timeout: Duration) -> AppResult<f64>;

    /// Blocks until on-target or `timeout` elapses.
    async fn wait_on_target(&self, timeout: Duration) -> AppResult<()>;

    /// Reads the current position.
    async fn query_position(&self) -> AppResult<f64>;

    /// Programs the rotator to emit one TTL pulse at `start_deg` and every
    /// `step_deg` thereafter, ceasing past `end_deg`.
    async fn arm_trigger(
        &self,
        start_deg: f64,
        step_deg: f64,
        end_deg: f64,
        polarity: TriggerPolarity,
    ) -> AppResult<()>;

    /// Enables or disables the trigger output.
    async fn enable_trigger(&self, enabled: bool) -> AppResult<()>;

    /// `true` once motion has stopped at the commanded position.
    async fn on_target(&self) -> AppResult<bool>;
}
