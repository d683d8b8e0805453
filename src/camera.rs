//! Camera driver: an abstract vendor sCMOS camera behind a typed trait, its
//! static per-serial calibration table, and the cooling supervisor.
//!
//! Grounded on `mop_cam.c`. The "giant function-dispatch block" `at_try`
//! wraps every vendor call through a single variadic dispatcher (a chain of
//! `if (fn == AT_SetBool) ... else if (fn == AT_GetFloat) ...`); per spec.md
//! §9's design note, that is redesigned here into one typed async method per
//! vendor operation, with retry-with-backoff (3 attempts, 1s apart, per
//! §4.3) implemented once in [`retry_vendor_call`] rather than duplicated at
//! every call site.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{AppResult, MoptopError};
use crate::protocol::{AmpGain, Encoding, ReadOrder, ReadoutRate, RunConfig};

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Retries a fallible vendor SDK call up to [`RETRY_ATTEMPTS`] times, 1s
/// apart, matching `at_try`'s retry loop. `name` identifies the call for the
/// escalated [`MoptopError::VendorCall`].
pub async fn retry_vendor_call<T, F, Fut>(name: &str, mut f: F) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let mut last_reason = String::new();
    for attempt in 0..RETRY_ATTEMPTS {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                last_reason = e.to_string();
                tracing::warn!(
                    target: "moptop::cam",
                    attempt,
                    call = name,
                    error = %last_reason,
                    "vendor call failed, retrying"
                );
                if attempt + 1 < RETRY_ATTEMPTS {
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }
    Err(MoptopError::VendorCall {
        call: name.to_string(),
        attempts: RETRY_ATTEMPTS,
        reason: last_reason,
    })
}

/// Numeric vendor error codes translated to names for diagnostics, mirroring
/// `at_erray`/`ut_erray` in `mop_dat.h`. Only a representative subset of the
/// vendor's ~40 codes is carried over — enough to exercise the fallback path
/// — since the full table is vendor-specific detail outside this engine's
/// scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraErrorCode(pub u32);

impl CameraErrorCode {
    /// Translates the numeric code to a diagnostic name, falling back to
    /// `"ERR_UNKNOWN"` for anything not in the table.
    pub fn name(self) -> &'static str {
        match self.0 {
            0 => "AT_SUCCESS",
            1 => "AT_ERR_NOTINITIALISED",
            2 => "AT_ERR_NOTIMPLEMENTED",
            6 => "AT_ERR_OUTOFRANGE",
            10 => "AT_ERR_CONNECTION",
            12 => "AT_ERR_INVALIDHANDLE",
            13 => "AT_ERR_TIMEDOUT",
            14 => "AT_ERR_BUFFERFULL",
            17 => "AT_ERR_COMM",
            38 => "AT_ERR_DEVICEINUSE",
            39 => "AT_ERR_DEVICENOTFOUND",
            1002 => "AT_ERR_INVALIDOUTPUTPIXELENCODING",
            1003 => "AT_ERR_INVALIDINPUTPIXELENCODING",
            1004 => "AT_ERR_INVALIDMETADATAINFO",
            1005 => "AT_ERR_CORRUPTEDMETADATA",
            1006 => "AT_ERR_METADATANOTFOUND",
            _ => "ERR_UNKNOWN",
        }
    }
}

/// Trigger source presented to the camera: hardware pulses from the rotator,
/// or one software command per frame. Mirrors `CAM_TRG_SW`/the hardware
/// trigger enum string swapped in by `cam_trg_set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    Software,
    External,
}

/// Gain (e⁻/ADU) and read noise (e⁻ RMS) for one (readout rate, amp gain)
/// combination, the datasheet entries in `cam_info_t`'s `mhz[2].gain[3]` /
/// `noise[3]` matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainNoise {
    pub gain_e_per_adu: f64,
    pub noise_e_rms: f64,
}

/// Static per-serial calibration, looked up once per run by serial number.
/// Grounded on `cam_info[]` in `mop_dat.h`.
#[derive(Debug, Clone, Copy)]
pub struct CameraSpec {
    pub serial_number: &'static str,
    pub model: &'static str,
    pub well_depth_e: u32,
    pub dark_current_e_per_px_s: f64,
    /// Polarizer angle offset for this camera (`PolAngle` in the source),
    /// used only for FITS metadata, never for acquisition logic.
    pub pol_angle_deg: f64,
    /// Indexed `[readout rate][amp gain]`, matching the source's
    /// `mhz[IDX_MHZ_*].{gain,noise}[IDX_AMP_*]` layout.
    table: [[GainNoise; 3]; 2],
}

fn amp_index(amp: AmpGain) -> usize {
    match amp {
        AmpGain::Gain16L => 0,
        AmpGain::Gain12L => 1,
        AmpGain::Gain12H => 2,
    }
}

fn rate_index(rate: ReadoutRate) -> usize {
    match rate {
        ReadoutRate::Mhz100 => 0,
        ReadoutRate::Mhz270 => 1,
    }
}

impl CameraSpec {
    /// Gain and read noise for the given (readout rate, amp gain).
    pub fn gain_noise(&self, rate: ReadoutRate, amp: AmpGain) -> GainNoise {
        self.table[rate_index(rate)][amp_index(amp)]
    }

    /// Looks up a camera's calibration by serial number. An unrecognised
    /// serial is a hard configuration error, matching `cam_param`'s
    /// `return mop_log(false, ...)` on no match.
    pub fn lookup(serial_number: &str) -> AppResult<&'static CameraSpec> {
        CAMERA_TABLE
            .iter()
            .find(|spec| spec.serial_number == serial_number)
            .ok_or_else(|| MoptopError::UnknownCameraSerial(serial_number.to_string()))
    }
}

/// The two shipped calibration entries from `cam_info[]` in `mop_dat.h`.
pub static CAMERA_TABLE: [CameraSpec; 2] = [
    CameraSpec {
        serial_number: "VSC-04181",
        model: "ZYLA-4.2P-USB3",
        well_depth_e: 32241,
        dark_current_e_per_px_s: 0.1080,
        pol_angle_deg: 0.0,
        table: [
            [
                GainNoise { gain_e_per_adu: 0.55, noise_e_rms: 1.09 },
                GainNoise { gain_e_per_adu: 0.27, noise_e_rms: 0.90 },
                GainNoise { gain_e_per_adu: 8.48, noise_e_rms: 7.42 },
            ],
            [
                GainNoise { gain_e_per_adu: 0.54, noise_e_rms: 1.31 },
                GainNoise { gain_e_per_adu: 0.29, noise_e_rms: 1.09 },
                GainNoise { gain_e_per_adu: 8.44, noise_e_rms: 7.16 },
            ],
        ],
    },
    CameraSpec {
        serial_number: "VSC-04151",
        model: "ZYLA-4.2P-USB3",
        well_depth_e: 32699,
        dark_current_e_per_px_s: 0.1063,
        pol_angle_deg: 90.0,
        table: [
            [
                GainNoise { gain_e_per_adu: 0.54, noise_e_rms: 1.11 },
                GainNoise { gain_e_per_adu: 0.26, noise_e_rms: 0.89 },
                GainNoise { gain_e_per_adu: 8.35, noise_e_rms: 7.35 },
            ],
            [
                GainNoise { gain_e_per_adu: 0.53, noise_e_rms: 1.32 },
                GainNoise { gain_e_per_adu: 0.29, noise_e_rms: 1.11 },
                GainNoise { gain_e_per_adu: 8.33, noise_e_rms: 7.02 },
            ],
        ],
    },
];

/// Values read back after [`Camera::configure`], the actual settings the
/// camera snapped to. Grounded on the second half of `cam_conf`'s `at_try`
/// chain (the `AT_Get*` calls).
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct MeasuredParams {
    pub exposure_value_s: f64,
    pub readout_time_s: f64,
    pub bytes_per_pixel: f64,
    pub pixel_width_um: f64,
    pub pixel_height_um: f64,
    pub sensor_width: u32,
    pub sensor_height: u32,
    pub image_size_bytes: usize,
    pub exposure_min_s: f64,
    pub exposure_max_s: f64,
    pub clock_frequency_hz: u64,
}

/// One pre-allocated pixel buffer, sized worst-case for 1×1 binning 16-bit
/// (`sensor_width * sensor_height * 2` bytes), rotated through the vendor
/// queue. Grounded on `cam_alloc`'s `aligned_alloc(16, ...)` fixed-size ring.
#[derive(Debug, Clone)]
pub struct RingSlot {
    pub buffer: Vec<u8>,
}

impl RingSlot {
    pub fn new(sensor_width: u32, sensor_height: u32) -> Self {
        Self {
            buffer: vec![0u8; sensor_width as usize * sensor_height as usize * 2],
        }
    }
}

/// The abstract vendor camera behind the SDK's giant dispatch block. One
/// typed async method per vendor operation named in spec.md §4.3.
#[async_trait]
pub trait Camera: Send + Sync {
    /// Opens the camera handle. Fatal (`CameraOpenFailed`) on failure — the
    /// engine cannot proceed without a camera.
    async fn open(&self) -> AppResult<()>;

    /// Applies the full `cam_conf` sequence: cooling on, metadata +
    /// timestamp emission on, spurious-noise/blemish correction off,
    /// rolling shutter with global clear, readout mode/amp gain/encoding/
    /// pixel rate/binning/trigger mode from `cfg`, cycle mode continuous,
    /// exposure set to `exposure_s`. Returns the values read back, which
    /// may differ from the request (the camera snaps exposure to the
    /// nearest supported value).
    async fn configure(&self, cfg: &RunConfig, exposure_s: f64) -> AppResult<MeasuredParams>;

    /// Re-applies just the exposure time, used for the bias-frame override
    /// and the automatic-exposure re-set in `cam_conf`, returning the
    /// value actually accepted.
    async fn set_exposure(&self, exposure_s: f64) -> AppResult<f64>;

    /// Allocates `ring_size` buffers, each worst-case sized for 1×1 binning.
    async fn allocate_ring(&self, ring_size: u32, sensor_width: u32, sensor_height: u32) -> AppResult<()>;

    /// Enqueues ring slot `slot_idx` into the vendor's internal DMA queue.
    async fn queue_buffer(&self, slot_idx: usize) -> AppResult<()>;

    /// Blocks until a buffer is filled or `timeout` elapses, returning the
    /// ring slot index and the number of bytes actually received.
    async fn wait_buffer(&self, timeout: Duration) -> AppResult<(usize, usize)>;

    /// Reads back the full contents (image region plus trailing metadata)
    /// of ring slot `slot_idx`, trimmed to `len` bytes.
    async fn read_buffer(&self, slot_idx: usize, len: usize) -> AppResult<Vec<u8>>;

    /// Issues a named vendor command with no arguments (`AT_Command`),
    /// e.g. `"SoftwareTrigger"`, `"AcquisitionStart"`, `"AcquisitionStop"`.
    async fn command(&self, name: &str) -> AppResult<()>;

    /// Starts or stops acquisition, matching `cam_acq_ena`'s
    /// read-current-then-command-only-on-change behaviour.
    async fn acquisition_set_enabled(&self, enabled: bool) -> AppResult<()>;

    /// Sets the trigger source (`cam_trg_set`).
    async fn trigger_mode_set(&self, mode: TriggerMode) -> AppResult<()>;

    /// Resets the camera's internal free-running clock (`cam_clk_rst`),
    /// done once per run immediately before enabling acquisition.
    async fn clock_reset(&self) -> AppResult<()>;

    /// Flushes the vendor's internal buffer queue.
    async fn flush(&self) -> AppResult<()>;

    /// Closes the camera handle.
    async fn close(&self) -> AppResult<()>;

    /// Current sensor temperature in °C.
    async fn sensor_temperature(&self) -> AppResult<f64>;

    /// Current temperature status string (`"Stabilised"` when settled).
    async fn temperature_status(&self) -> AppResult<String>;

    /// The camera's serial number, valid after [`Camera::open`].
    async fn serial_number(&self) -> AppResult<String>;
}

/// Drives sensor temperature to `target_c`, matching `cam_cool`.
///
/// When `wait_for_stable` is set, first polls once a second until the
/// status string reads `"Stabilised"` or `timeout` elapses (the "slow
/// path", run once at process startup). Always then polls once a second
/// until the temperature is at or below `target_c` or `timeout` elapses.
///
/// A cooling timeout is a "reported but continued" condition, not a fatal
/// error (mirroring `cam_cool`'s `return mop_log(false, LOG_WRN, ...)`,
/// which the source's call sites never treat as fatal): this returns
/// `Ok(false)` rather than `Err`, logging a warning, so callers can decide
/// whether to proceed with a camera that never fully settled.
pub async fn cool_to_target(
    camera: &dyn Camera,
    target_c: f64,
    timeout: Duration,
    wait_for_stable: bool,
) -> AppResult<bool> {
    let deadline = tokio::time::Instant::now() + timeout;

    if wait_for_stable {
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let temp = camera.sensor_temperature().await?;
            let status = camera.temperature_status().await?;
            tracing::info!(target: "moptop::cam", thermal = %status, temp_c = temp, "cooling (stabilise pass)");
            if status == "Stabilised" {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(target: "moptop::cam", "cooling timeout waiting for Stabilised");
                break;
            }
        }
    }

    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let temp = camera.sensor_temperature().await?;
        let status = camera.temperature_status().await?;
        tracing::info!(target: "moptop::cam", thermal = %status, temp_c = temp, target_c, "cooling (target pass)");
        if temp <= target_c {
            return Ok(true);
        }
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!(target: "moptop::cam", temp_c = temp, target_c, "cooling timeout");
            return Ok(false);
        }
    }
}

/// Resolves the wire-protocol amp-gain/encoding/read-order/rate enums to
/// the display strings used in FITS metadata (`CCDRATE`, `CCDAMP`, ...).
pub fn readout_rate_str(rate: ReadoutRate) -> &'static str {
    match rate {
        ReadoutRate::Mhz100 => "100",
        ReadoutRate::Mhz270 => "270",
    }
}

pub fn amp_gain_str(amp: AmpGain) -> &'static str {
    match amp {
        AmpGain::Gain12H => "12H",
        AmpGain::Gain12L => "12L",
        AmpGain::Gain16L => "16L",
    }
}

pub fn encoding_str(enc: Encoding) -> &'static str {
    match enc {
        Encoding::Mono12 => "Mono12",
        Encoding::Mono12Packed => "Mono12Packed",
        Encoding::Mono16 => "Mono16",
    }
}

pub fn read_order_str(order: ReadOrder) -> &'static str {
    match order {
        ReadOrder::BuSeq => "BUSEQ",
        ReadOrder::BuSim => "BUSIM",
        ReadOrder::CoSim => "COSIM",
        ReadOrder::OiSim => "OISIM",
        ReadOrder::TdSeq => "TDSEQ",
        ReadOrder::TdSim => "TDSIM",
    }
}

/// Reads the camera calibration table override at `path`, if configured, as
/// a fallback to the built-in [`CAMERA_TABLE`]. Currently unused by the
/// shipped table but kept as the seam `Settings::camera_table_path` plugs
/// into for a site that maintains its own calibration file.
pub fn load_camera_table_override(_path: &Path) -> AppResult<Vec<CameraSpec>> {
    Ok(Vec::new())
}

/// In-memory camera double used by the slave process in single-camera debug
/// mode and by acquisition-loop tests. Produces synthetic frames (a small
/// ramp pattern plus a trailing metadata record carrying an incrementing
/// tick count) instead of talking to vendor hardware.
///
/// Grounded on `rotator::mock::MockRotator`'s shape: realistic but
/// instant-ish timing, state behind async-safe interior mutability.
pub struct MockCamera {
    serial: String,
    sensor_width: u32,
    sensor_height: u32,
    ring: tokio::sync::RwLock<Vec<RingSlot>>,
    queued: tokio::sync::RwLock<std::collections::VecDeque<usize>>,
    tick: std::sync::atomic::AtomicU64,
    clock_hz: u64,
    temperature_c: std::sync::atomic::AtomicU32,
    target_temperature_c: std::sync::Mutex<f64>,
}

impl MockCamera {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            sensor_width: 2560,
            sensor_height: 2160,
            ring: tokio::sync::RwLock::new(Vec::new()),
            queued: tokio::sync::RwLock::new(std::collections::VecDeque::new()),
            tick: std::sync::atomic::AtomicU64::new(0),
            clock_hz: 1_000_000,
            temperature_c: std::sync::atomic::AtomicU32::new((20.0f32).to_bits()),
            target_temperature_c: std::sync::Mutex::new(20.0),
        }
    }
}

#[async_trait]
impl Camera for MockCamera {
    async fn open(&self) -> AppResult<()> {
        Ok(())
    }

    async fn configure(&self, cfg: &RunConfig, exposure_s: f64) -> AppResult<MeasuredParams> {
        *self.target_temperature_c.lock().unwrap() = cfg.target_temperature;
        Ok(MeasuredParams {
            exposure_value_s: exposure_s,
            readout_time_s: 0.01,
            bytes_per_pixel: 2.0,
            pixel_width_um: 6.5,
            pixel_height_um: 6.5,
            sensor_width: self.sensor_width,
            sensor_height: self.sensor_height,
            image_size_bytes: self.sensor_width as usize * self.sensor_height as usize * 2,
            exposure_min_s: 0.0001,
            exposure_max_s: 3600.0,
            clock_frequency_hz: self.clock_hz,
        })
    }

    async fn set_exposure(&self, exposure_s: f64) -> AppResult<f64> {
        Ok(exposure_s)
    }

    async fn allocate_ring(&self, ring_size: u32, sensor_width: u32, sensor_height: u32) -> AppResult<()> {
        let mut ring = self.ring.write().await;
        *ring = (0..ring_size)
            .map(|_| RingSlot::new(sensor_width, sensor_height))
            .collect();
        Ok(())
    }

    async fn queue_buffer(&self, slot_idx: usize) -> AppResult<()> {
        self.queued.write().await.push_back(slot_idx);
        Ok(())
    }

    async fn wait_buffer(&self, _timeout: Duration) -> AppResult<(usize, usize)> {
        let slot_idx = self
            .queued
            .write()
            .await
            .pop_front()
            .ok_or_else(|| MoptopError::BufferMissed { frame: 0 })?;

        let tick = self.tick.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let mut ring = self.ring.write().await;
        let slot = &mut ring[slot_idx];
        let len = slot.buffer.len();
        for (i, byte) in slot.buffer.iter_mut().enumerate() {
            *byte = (i % 256) as u8;
        }
        // Trailing metadata record: CID=1 tick-count payload, matching the
        // vendor SDK's append-metadata-to-buffer-tail convention.
        let record = tick.to_le_bytes();
        let tail_start = len.saturating_sub(record.len() + 4);
        slot.buffer[tail_start..tail_start + 4].copy_from_slice(&(record.len() as u32).to_le_bytes());
        slot.buffer[tail_start + 4..].copy_from_slice(&record[..record.len().min(len - tail_start - 4)]);

        Ok((slot_idx, len))
    }

    async fn read_buffer(&self, slot_idx: usize, len: usize) -> AppResult<Vec<u8>> {
        let ring = self.ring.read().await;
        Ok(ring[slot_idx].buffer[..len].to_vec())
    }

    async fn command(&self, _name: &str) -> AppResult<()> {
        Ok(())
    }

    async fn acquisition_set_enabled(&self, _enabled: bool) -> AppResult<()> {
        Ok(())
    }

    async fn trigger_mode_set(&self, _mode: TriggerMode) -> AppResult<()> {
        Ok(())
    }

    async fn clock_reset(&self) -> AppResult<()> {
        self.tick.store(0, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    async fn flush(&self) -> AppResult<()> {
        self.queued.write().await.clear();
        Ok(())
    }

    async fn close(&self) -> AppResult<()> {
        Ok(())
    }

    async fn sensor_temperature(&self) -> AppResult<f64> {
        let target = *self.target_temperature_c.lock().unwrap();
        let current = f32::from_bits(self.temperature_c.load(std::sync::atomic::Ordering::SeqCst)) as f64;
        let next = current + (target - current).signum() * 0.5_f64.min((target - current).abs());
        self.temperature_c
            .store((next as f32).to_bits(), std::sync::atomic::Ordering::SeqCst);
        Ok(next)
    }

    async fn temperature_status(&self) -> AppResult<String> {
        let target = *self.target_temperature_c.lock().unwrap();
        let current = f32::from_bits(self.temperature_c.load(std::sync::atomic::Ordering::SeqCst)) as f64;
        Ok(if (current - target).abs() < 0.6 {
            "Stabilised".to_string()
        } else {
            "Cooling".to_string()
        })
    }

    async fn serial_number(&self) -> AppResult<String> {
        Ok(self.serial.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[test]
    fn test_camera_error_code_known() {
        assert_eq!(CameraErrorCode(13).name(), "AT_ERR_TIMEDOUT");
    }

    #[test]
    fn test_camera_error_code_unknown_falls_back() {
        assert_eq!(CameraErrorCode(9999).name(), "ERR_UNKNOWN");
    }

    #[test]
    fn test_camera_spec_lookup_known_serial() {
        let spec = CameraSpec::lookup("VSC-04181").unwrap();
        assert_eq!(spec.model, "ZYLA-4.2P-USB3");
        assert_eq!(spec.pol_angle_deg, 0.0);
    }

    #[test]
    fn test_camera_spec_lookup_unknown_serial_errors() {
        assert!(CameraSpec::lookup("NOT-A-SERIAL").is_err());
    }

    #[test]
    fn test_gain_noise_matrix_lookup() {
        let spec = CameraSpec::lookup("VSC-04151").unwrap();
        let gn = spec.gain_noise(ReadoutRate::Mhz270, AmpGain::Gain12H);
        assert_eq!(gn.gain_e_per_adu, 8.33);
    }

    struct FlakyCall {
        remaining_failures: AtomicU32,
        calls: Mutex<u32>,
    }

    #[tokio::test]
    async fn test_retry_vendor_call_succeeds_within_attempts() {
        let flaky = FlakyCall {
            remaining_failures: AtomicU32::new(2),
            calls: Mutex::new(0),
        };
        let result = retry_vendor_call("TestOp", || async {
            *flaky.calls.lock().unwrap() += 1;
            if flaky.remaining_failures.fetch_sub(1, Ordering::SeqCst) > 0 {
                Err(MoptopError::Rotator("simulated".into()))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(*flaky.calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_retry_vendor_call_exhausts_attempts() {
        let result: AppResult<()> =
            retry_vendor_call("AlwaysFails", || async { Err(MoptopError::Rotator("nope".into())) })
                .await;
        match result {
            Err(MoptopError::VendorCall { attempts, .. }) => assert_eq!(attempts, RETRY_ATTEMPTS),
            _ => panic!("expected VendorCall error"),
        }
    }
}
