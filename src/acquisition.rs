//! Image acquisition loops.
//!
//! Grounded on `mop_cam.c`'s `cam_acq_circ` (hardware-triggered, §4.5) and
//! `cam_acq_stat` (software-triggered, §4.6), plus `cam_ticks` (timestamp
//! extraction from the vendor's trailing per-frame metadata record).
//!
//! Both loops share the same per-frame shape: wait for a filled ring
//! buffer, work out the rotator geometry for that frame, extract the
//! embedded timestamp tick, hand the frame to a [`FrameSink`] to be written
//! and announced, then advance. They differ only in how the frame is
//! triggered and in how `RotEnd`/`RotDif` are derived.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;

use crate::camera::Camera;
use crate::config::CameraRole;
use crate::error::{AppResult, MoptopError};
use crate::protocol::{RunConfig, Tag};
use crate::rotator::Rotator;
use crate::transport::Transport;

/// Extra time allowed for image transfer over the exposure time itself
/// before a `WaitBuffer` call is considered a dropped frame (`TMO_XFR`).
const TRANSFER_TIMEOUT_MS: f64 = 30_000.0;
/// Timeout for a `goto` in the static/software-triggered loop (`TMO_ROTATOR`).
const ROTATOR_GOTO_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for the master/slave `TRG` handshake (`TMO_ACK`).
const TRIGGER_HANDSHAKE_TIMEOUT_SECS: u64 = 5;

/// Rotator geometry and timing recorded for one acquired frame, matching the
/// per-index `Rot*[i]`/`TimestampClock[i]` arrays in `mop_cam_t`.
#[derive(Debug, Clone, Copy)]
pub struct FrameTiming {
    pub rotation_requested_deg: f64,
    pub rotation_begin_deg: f64,
    pub rotation_end_deg: f64,
    pub rotation_arc_deg: f64,
    pub rotation_number: u32,
    pub position_in_rotation: u32,
    pub timestamp_ticks: u64,
    pub clock_diff_s: f64,
    pub obs_start: chrono::DateTime<Local>,
    pub obs_end: chrono::DateTime<Local>,
    pub is_final_frame: bool,
}

/// Receives one completed frame: writes it out (FITS + filename sequencing)
/// and announces the resulting path to any listening command submitter.
/// Implemented outside this module since it needs the camera's
/// [`crate::camera::CameraSpec`], the run's [`crate::sequencer::NameState`]
/// and a [`Transport`] — this module only needs to know it can hand a frame
/// off and get the written path back.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn emit(&mut self, frame_index: u32, timing: &FrameTiming, pixels: &[u8]) -> AppResult<PathBuf>;
}

/// Reads the vendor's trailing per-frame metadata to recover the camera's
/// free-running clock tick count at exposure time, matching `cam_ticks`'s
/// backward parse of up to three metadata chunks. Each chunk is stored as
/// `[data][CID: u32][len: u32]` immediately preceding the next chunk (or the
/// end of `buffer` for the last one), where `len` counts the CID field plus
/// the data. Returns `None` (rather than panicking) on truncated or
/// malformed trailing data, and when no `CID == 1` (timestamp) chunk is
/// found within the first three — matching the source's `return 0` fallback,
/// represented here as "no timestamp" rather than a literal zero tick.
pub fn extract_timestamp(buffer: &[u8]) -> Option<u64> {
    let mut pos = buffer.len();
    for _ in 0..3 {
        if pos < 8 {
            return None;
        }
        pos -= 4;
        let len = u32::from_le_bytes(buffer[pos..pos + 4].try_into().ok()?) as usize;
        pos -= 4;
        let cid = u32::from_le_bytes(buffer[pos..pos + 4].try_into().ok()?);

        if len < 4 || pos < len - 4 {
            return None;
        }
        pos -= len - 4;

        if cid == 1 {
            if pos + 8 > buffer.len() {
                return None;
            }
            return Some(u64::from_le_bytes(buffer[pos..pos + 8].try_into().ok()?));
        }
    }
    None
}

fn clock_diff_s(prev_ticks: Option<u64>, ticks: u64, clock_hz: u64) -> f64 {
    let delta = match prev_ticks {
        Some(prev) => ticks.wrapping_sub(prev),
        None => ticks,
    };
    delta as f64 / clock_hz as f64
}

/// Hardware-triggered acquisition: the rotator is already moving and firing
/// trigger pulses, the camera free-runs off them. Grounded on `cam_acq_circ`.
/// `rotator` is only queried on the master; the slave has no rotator and
/// fakes the final angle/arc from the commanded step, matching the
/// `mop_master` branch in the source.
pub async fn acquire_hardware_triggered(
    camera: &dyn Camera,
    rotator: Option<&dyn Rotator>,
    role: CameraRole,
    ring_size: u32,
    cfg: &RunConfig,
    exposure_s: f64,
    clock_hz: u64,
    sink: &mut dyn FrameSink,
) -> AppResult<Vec<PathBuf>> {
    let total = cfg.total_images();
    let step = cfg.rotation_step();
    let timeout = Duration::from_millis((exposure_s * 1000.0 + TRANSFER_TIMEOUT_MS) as u64);

    let mut rot_req = cfg.static_angle;
    let mut prev_ticks = None;
    let mut paths = Vec::with_capacity(total as usize);
    let _ = ring_size;

    for i in 0..total {
        let obs_start = Local::now();

        let (slot_idx, len) = camera.wait_buffer(timeout).await.map_err(|_| MoptopError::BufferMissed { frame: i })?;
        let bytes = camera.read_buffer(slot_idx, len).await?;
        let ticks = extract_timestamp(&bytes).unwrap_or(0);
        let clk_dif = clock_diff_s(prev_ticks, ticks, clock_hz);
        prev_ticks = Some(ticks);

        // Snapshot the rotator only after the buffer has actually arrived
        // (§4.5 step 4 follows step 3), so RotEnd/RotDif reflect the angle
        // at frame completion, not at the start of the wait.
        let (rot_end, rot_diff) = if role == CameraRole::Master {
            let rotator = rotator.ok_or_else(|| MoptopError::Rotator("master has no rotator".into()))?;
            let rot_now = rotator.query_position().await?;
            (rot_now % 360.0, rot_now - rot_req)
        } else {
            ((rot_req + step) % 360.0, step)
        };

        let obs_end = Local::now();

        let timing = FrameTiming {
            rotation_requested_deg: rot_req,
            rotation_begin_deg: rot_req % 360.0,
            rotation_end_deg: rot_end,
            rotation_arc_deg: rot_diff,
            rotation_number: 1 + i / cfg.images_per_rev,
            position_in_rotation: 1 + i % cfg.images_per_rev,
            timestamp_ticks: ticks,
            clock_diff_s: clk_dif,
            obs_start,
            obs_end,
            is_final_frame: i + 1 == total,
        };

        let path = sink.emit(i, &timing, &bytes).await?;
        tracing::info!(
            target: "moptop::acq",
            frame = i + 1,
            total,
            rot_req = timing.rotation_requested_deg,
            rot_end,
            clk_dif,
            path = %path.display(),
            "frame acquired"
        );
        paths.push(path);

        camera.queue_buffer(slot_idx).await?;
        rot_req += step;
    }

    camera.acquisition_set_enabled(false).await?;
    camera.trigger_mode_set(crate::camera::TriggerMode::Software).await?;
    let _ = camera.sensor_temperature().await?;
    camera.flush().await?;

    Ok(paths)
}

/// Static/software-triggered acquisition: either a genuinely fixed angle
/// (`static_angle` with zero step) or a rotating target stepped between
/// software triggers. Grounded on `cam_acq_stat`: the master commands each
/// rotator move then signals the slave over `transport` with a `TRG`
/// datagram; the slave instead waits on it. When `transport` is `None`
/// (single-camera debug mode), the handshake is skipped entirely, matching
/// the source's `!one_cam` guards.
#[allow(clippy::too_many_arguments)]
pub async fn acquire_static(
    camera: &dyn Camera,
    rotator: Option<&dyn Rotator>,
    role: CameraRole,
    transport: Option<(&Transport, &str)>,
    ring_size: u32,
    cfg: &RunConfig,
    exposure_s: f64,
    clock_hz: u64,
    sink: &mut dyn FrameSink,
) -> AppResult<Vec<PathBuf>> {
    let total = cfg.total_images();
    let step = cfg.rotation_step();
    let timeout = Duration::from_millis((exposure_s * 1000.0 + TRANSFER_TIMEOUT_MS) as u64);

    let mut rot_req = cfg.static_angle;
    let mut prev_ticks = None;
    let mut paths = Vec::with_capacity(total as usize);
    let _ = ring_size;

    for i in 0..total {
        let obs_start = Local::now();

        let rot_end = match role {
            CameraRole::Master => {
                let commanded = if let Some(rotator) = rotator {
                    rotator.goto(rot_req, ROTATOR_GOTO_TIMEOUT).await?
                } else {
                    rot_req
                };
                if let Some((transport, peer)) = transport {
                    transport
                        .send(TRIGGER_HANDSHAKE_TIMEOUT_SECS, Tag::Trg.as_str(), peer, Some(Tag::Ack))
                        .await?;
                }
                commanded
            }
            CameraRole::Slave => {
                if let Some((transport, _peer)) = transport {
                    transport.recv_forever(Tag::Trg).await?;
                }
                rot_req
            }
        };

        camera.command("SoftwareTrigger").await?;
        let (slot_idx, len) = camera.wait_buffer(timeout).await.map_err(|_| MoptopError::BufferMissed { frame: i })?;
        let bytes = camera.read_buffer(slot_idx, len).await?;
        let ticks = extract_timestamp(&bytes).unwrap_or(0);
        let clk_dif = clock_diff_s(prev_ticks, ticks, clock_hz);
        prev_ticks = Some(ticks);

        let rot_end = rot_end % 360.0;
        let rot_diff = rot_end - (rot_req % 360.0);
        let obs_end = Local::now();

        let timing = FrameTiming {
            rotation_requested_deg: rot_req,
            rotation_begin_deg: rot_req % 360.0,
            rotation_end_deg: rot_end,
            rotation_arc_deg: rot_diff,
            rotation_number: 1 + i / cfg.images_per_rev,
            position_in_rotation: 1 + i % cfg.images_per_rev,
            timestamp_ticks: ticks,
            clock_diff_s: clk_dif,
            obs_start,
            obs_end,
            is_final_frame: i + 1 == total,
        };

        let path = sink.emit(i, &timing, &bytes).await?;
        tracing::info!(
            target: "moptop::acq",
            frame = i + 1,
            total,
            rot_req,
            rot_end,
            clk_dif,
            path = %path.display(),
            "frame acquired"
        );
        paths.push(path);

        camera.queue_buffer(slot_idx).await?;
        rot_req += step;
    }

    camera.command("AcquisitionStop").await?;
    let _ = camera.sensor_temperature().await?;
    camera.flush().await?;

    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_cid(cid: u32, data: &[u8]) -> Vec<u8> {
        let len = (data.len() + 4) as u32;
        let mut out = Vec::new();
        out.extend_from_slice(data);
        out.extend_from_slice(&cid.to_le_bytes());
        out.extend_from_slice(&len.to_le_bytes());
        out
    }

    #[test]
    fn test_extract_timestamp_no_records_returns_none() {
        let buffer = vec![0u8; 16];
        assert_eq!(extract_timestamp(&buffer), None);
    }

    #[test]
    fn test_extract_timestamp_single_cid1_record() {
        let mut buffer = vec![1, 2, 3, 4];
        buffer.extend(record_cid(1, &42u64.to_le_bytes()));
        assert_eq!(extract_timestamp(&buffer), Some(42));
    }

    #[test]
    fn test_extract_timestamp_malformed_length_returns_none() {
        // len field claims an absurd chunk size far exceeding the buffer.
        let mut buffer = vec![0u8; 8];
        buffer.extend_from_slice(&1u32.to_le_bytes()); // cid
        buffer.extend_from_slice(&0xFFFFFFFFu32.to_le_bytes()); // len
        assert_eq!(extract_timestamp(&buffer), None);
    }

    #[test]
    fn test_extract_timestamp_cid0_then_cid1() {
        let mut buffer = vec![9, 9, 9, 9];
        buffer.extend(record_cid(0, &[5, 6, 7, 8]));
        buffer.extend(record_cid(1, &99u64.to_le_bytes()));
        assert_eq!(extract_timestamp(&buffer), Some(99));
    }

    #[test]
    fn test_clock_diff_first_frame_uses_raw_ticks() {
        assert_eq!(clock_diff_s(None, 1_000_000, 1_000_000), 1.0);
    }

    #[test]
    fn test_clock_diff_subsequent_frame_uses_delta() {
        assert_eq!(clock_diff_s(Some(1_000_000), 1_500_000, 1_000_000), 0.5);
    }
}
