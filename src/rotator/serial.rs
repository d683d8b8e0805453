//! Serial-attached rotator driver.
//!
//! Grounded on `hardware/ell14.rs`'s pattern — a `tokio::sync::Mutex`
//! around a `tokio_serial::SerialStream`, half-duplex request/response
//! transactions, and a connect-with-retry sequence mirroring `rot_init`'s
//! `PI_ConnectRS232ByDevName` retry loop (5 attempts, 1 second apart).
//! Vendor command strings are deliberately opaque (`send_raw_command`) so
//! the concrete controller protocol stays out of scope, matching the
//! source specification's exclusions.

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use crate::error::{AppResult, MoptopError};
use crate::rotator::{Rotator, TriggerPolarity};

const CONNECT_RETRIES: u32 = 5;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Serial-port rotator driver.
pub struct SerialRotator {
    port: Mutex<Option<SerialStream>>,
    device: String,
    baud: u32,
}

impl SerialRotator {
    pub fn new(device: impl Into<String>, baud: u32) -> Self {
        Self {
            port: Mutex::new(None),
            device: device.into(),
            baud,
        }
    }

    /// Sends a raw command string and returns the controller's raw reply.
    /// The command vocabulary itself is vendor-specific and out of scope;
    /// this is the one seam an integration would plug real GCS commands
    /// into.
    pub async fn send_raw_command(&self, command: &str) -> AppResult<String> {
        let mut guard = self.port.lock().await;
        let port = guard
            .as_mut()
            .ok_or(MoptopError::Rotator("not connected".into()))?;

        port.write_all(command.as_bytes())
            .await
            .map_err(MoptopError::Io)?;

        let mut buf = [0u8; 256];
        let n = tokio::time::timeout(Duration::from_millis(500), port.read(&mut buf))
            .await
            .map_err(|_| MoptopError::Rotator("response timeout".into()))?
            .map_err(MoptopError::Io)?;

        Ok(String::from_utf8_lossy(&buf[..n]).trim().to_string())
    }
}

#[async_trait]
impl Rotator for SerialRotator {
    async fn connect(&self) -> AppResult<()> {
        let mut last_err = String::new();
        for attempt in 0..CONNECT_RETRIES {
            match tokio_serial::new(&self.device, self.baud).open_native_async() {
                Ok(stream) => {
                    *self.port.lock().await = Some(stream);
                    return Ok(());
                }
                Err(e) => {
                    last_err = e.to_string();
                    tracing::warn!(
                        target: "moptop::rot",
                        attempt,
                        error = %last_err,
                        "rotator connect attempt failed"
                    );
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
            }
        }
        Err(MoptopError::RotatorConnect(last_err))
    }

    async fn disconnect(&self) -> AppResult<()> {
        *self.port.lock().await = None;
        Ok(())
    }

    async fn stop(&self) -> AppResult<()> {
        self.send_raw_command("STOP").await.map(|_| ())
    }

    async fn clear_errors(&self) -> AppResult<()> {
        self.send_raw_command("ERR?").await.map(|_| ())
    }

    async fn move_absolute(&self, position_deg: f64) -> AppResult<()> {
        self.send_raw_command(&format!("MOV {position_deg}"))
            .await
            .map(|_| ())
    }

    async fn goto(&self, position_deg: f64, timeout: Duration) -> AppResult<f64> {
        self.move_absolute(position_deg).await?;
        self.wait_on_target(timeout).await?;
        self.query_position().await
    }

    async fn wait_on_target(&self, timeout: Duration) -> AppResult<()> {
        let start = std::time::Instant::now();
        loop {
            if self.on_target().await? {
                return Ok(());
            }
            if start.elapsed() > timeout {
                return Err(MoptopError::RotatorTimeout);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn query_position(&self) -> AppResult<f64> {
        let reply = self.send_raw_command("POS?").await?;
        reply
            .trim()
            .parse()
            .map_err(|_| MoptopError::Rotator(format!("unparsable position reply: {reply}")))
    }

    async fn arm_trigger(
        &self,
        start_deg: f64,
        step_deg: f64,
        end_deg: f64,
        polarity: TriggerPolarity,
    ) -> AppResult<()> {
        let pol = match polarity {
            TriggerPolarity::ActiveHigh => 1,
            TriggerPolarity::ActiveLow => 0,
        };
        self.send_raw_command(&format!(
            "TRG_CFG {start_deg} {step_deg} {end_deg} {pol}"
        ))
        .await
        .map(|_| ())
    }

    async fn enable_trigger(&self, enabled: bool) -> AppResult<()> {
        self.send_raw_command(&format!("TRG_EN {}", enabled as u8))
            .await
            .map(|_| ())
    }

    async fn on_target(&self) -> AppResult<bool> {
        let reply = self.send_raw_command("ONT?").await?;
        Ok(reply.trim() == "1")
    }
}
