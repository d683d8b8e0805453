//! In-memory rotator double, used by the slave process (which never opens
//! the real rotator) and by acquisition-loop tests.
//!
//! Grounded on `hardware/mock.rs`'s `MockStage`: realistic but instant-ish
//! timing, `tokio::time::sleep` for any simulated motion, thread-safe state
//! behind an async lock.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

use crate::error::AppResult;
use crate::rotator::{Rotator, TriggerPolarity};

/// Motion speed used to simulate settle time in tests.
const DEG_PER_SEC: f64 = 180.0;

pub struct MockRotator {
    position: RwLock<f64>,
    trigger_enabled: AtomicBool,
}

impl MockRotator {
    pub fn new() -> Self {
        Self {
            position: RwLock::new(0.0),
            trigger_enabled: AtomicBool::new(false),
        }
    }
}

impl Default for MockRotator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Rotator for MockRotator {
    async fn connect(&self) -> AppResult<()> {
        Ok(())
    }

    async fn disconnect(&self) -> AppResult<()> {
        Ok(())
    }

    async fn stop(&self) -> AppResult<()> {
        Ok(())
    }

    async fn clear_errors(&self) -> AppResult<()> {
        Ok(())
    }

    async fn move_absolute(&self, position_deg: f64) -> AppResult<()> {
        let current = *self.position.read().await;
        let distance = (position_deg - current).abs();
        let delay_ms = (distance / DEG_PER_SEC * 1000.0) as u64;
        tokio::time::sleep(Duration::from_millis(delay_ms.min(50))).await;
        *self.position.write().await = position_deg;
        Ok(())
    }

    async fn goto(&self, position_deg: f64, timeout: Duration) -> AppResult<f64> {
        self.move_absolute(position_deg).await?;
        self.wait_on_target(timeout).await?;
        self.query_position().await
    }

    async fn wait_on_target(&self, _timeout: Duration) -> AppResult<()> {
        Ok(())
    }

    async fn query_position(&self) -> AppResult<f64> {
        Ok(*self.position.read().await)
    }

    async fn arm_trigger(
        &self,
        _start_deg: f64,
        _step_deg: f64,
        _end_deg: f64,
        _polarity: TriggerPolarity,
    ) -> AppResult<()> {
        Ok(())
    }

    async fn enable_trigger(&self, enabled: bool) -> AppResult<()> {
        self.trigger_enabled.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    async fn on_target(&self) -> AppResult<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_move_and_query() {
        let rotator = MockRotator::new();
        rotator.move_absolute(45.0).await.unwrap();
        assert_eq!(rotator.query_position().await.unwrap(), 45.0);
    }
}
