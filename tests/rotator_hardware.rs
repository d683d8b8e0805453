//! MOPTOP rotator hardware validation tests.
//!
//! Run with: cargo test --features "hardware_tests,tokio_serial" --test rotator_hardware -- --nocapture
//!
//! SAFETY: These tests move a physical rotation stage. Ensure no
//! obstructions are in its path before running.
//!
//! Device path and baud come from `MOPTOP_TEST_ROTATOR_DEVICE` /
//! `MOPTOP_TEST_ROTATOR_BAUD` so the suite can target whatever serial port
//! the rotator is actually attached to on the test bench.

#![cfg(all(feature = "hardware_tests", feature = "tokio_serial"))]

use std::time::Duration;

use moptop::rotator::serial::SerialRotator;
use moptop::rotator::{Rotator, TriggerPolarity};

const POSITION_TOLERANCE_DEG: f64 = 0.5;
const GOTO_TIMEOUT: Duration = Duration::from_secs(30);

fn device_path() -> String {
    std::env::var("MOPTOP_TEST_ROTATOR_DEVICE").expect("set MOPTOP_TEST_ROTATOR_DEVICE to run hardware tests")
}

fn baud() -> u32 {
    std::env::var("MOPTOP_TEST_ROTATOR_BAUD")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(115_200)
}

async fn connected_rotator() -> SerialRotator {
    let rotator = SerialRotator::new(device_path(), baud());
    rotator.connect().await.expect("rotator failed to connect");
    rotator
}

#[tokio::test]
async fn test_rotator_responds_to_position_query() {
    let rotator = connected_rotator().await;
    let position = rotator.query_position().await.expect("position query failed");
    assert!(position.is_finite(), "position is not finite: {position}");
}

#[tokio::test]
async fn test_rotator_goto_reaches_target() {
    let rotator = connected_rotator().await;
    let reached = rotator.goto(45.0, GOTO_TIMEOUT).await.expect("goto failed");
    assert!(
        (reached - 45.0).abs() <= POSITION_TOLERANCE_DEG,
        "rotator settled at {reached}, expected near 45.0"
    );
    rotator.goto(0.0, GOTO_TIMEOUT).await.expect("return goto failed");
}

#[tokio::test]
async fn test_rotator_arm_and_disarm_trigger() {
    let rotator = connected_rotator().await;
    rotator
        .arm_trigger(0.0, 22.5, 360.0, TriggerPolarity::ActiveHigh)
        .await
        .expect("arm_trigger failed");
    rotator.enable_trigger(true).await.expect("enable_trigger failed");
    rotator.enable_trigger(false).await.expect("disable_trigger failed");
}
