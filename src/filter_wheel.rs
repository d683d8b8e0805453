//! Filter wheel driver: a minimal abstract positioner.
//!
//! Grounded on `mop_whl.c`'s shape — the wheel is addressed purely by
//! integer position (1..=5, per `RunConfig::filter_wheel_position`) and the
//! vendor command set it wraps is out of scope, the same way the rotator's
//! GCS command vocabulary is kept opaque in [`crate::rotator::serial`].

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{AppResult, MoptopError};

/// The abstract filter wheel behind the vendor-specific protocol.
#[async_trait]
pub trait FilterWheel: Send + Sync {
    /// Moves to `position` (1..=5) and waits for arrival.
    async fn goto_position(&self, position: u8) -> AppResult<()>;

    /// Reads the wheel's current position.
    async fn position(&self) -> AppResult<u8>;
}

/// In-memory filter wheel double.
pub struct MockFilterWheel {
    position: RwLock<u8>,
}

impl MockFilterWheel {
    pub fn new() -> Self {
        Self {
            position: RwLock::new(1),
        }
    }
}

impl Default for MockFilterWheel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FilterWheel for MockFilterWheel {
    async fn goto_position(&self, position: u8) -> AppResult<()> {
        if !(1..=5).contains(&position) {
            return Err(MoptopError::FilterWheel(format!(
                "filter wheel position {position} out of range 1..=5"
            )));
        }
        *self.position.write().await = position;
        Ok(())
    }

    async fn position(&self) -> AppResult<u8> {
        Ok(*self.position.read().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_goto_and_query() {
        let wheel = MockFilterWheel::new();
        wheel.goto_position(3).await.unwrap();
        assert_eq!(wheel.position().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_goto_rejects_out_of_range() {
        let wheel = MockFilterWheel::new();
        assert!(wheel.goto_position(9).await.is_err());
    }
}
