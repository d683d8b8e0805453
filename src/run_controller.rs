//! Master/slave run orchestration: the per-run sequence that ties the
//! rotator, camera, filter wheel, sequencer, FITS writer and datagram
//! transport together.
//!
//! Grounded on `mopnet.c`'s `main()` — the master and slave branches are
//! structurally identical except for who drives the rotator and who
//! initiates each handshake step, which is why both are expressed here as
//! one state machine parameterised by [`CameraRole`] rather than as two
//! separate functions, as the spec calls for (see `RunController` below).
//! The `one_cam`/single-camera debug path is modeled by `peer` being `None`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use crate::acquisition::{self, FrameSink, FrameTiming};
use crate::camera::{Camera, CameraSpec};
use crate::config::{CameraRole, Settings};
use crate::error::{AppResult, MoptopError};
use crate::filter_wheel::FilterWheel;
use crate::fits::{self, FrameRecord, RotatorGeometry};
use crate::protocol::{RunConfig, Tag, TargetInfo};
use crate::rotator::Rotator;
use crate::sequencer::{self, NameState};
use crate::transport::Transport;

/// Timeout for temperature-OK / run-number synchronisation (`TMO_TOK`).
const TOK_TIMEOUT_SECS: u64 = 60;
/// Timeout waiting for the rotation-start signal (`TMO_ROT`).
const ROT_TIMEOUT_SECS: u64 = 30;
/// Timeout for a generic forwarded-message round trip (`TMO_MSG`).
const MSG_TIMEOUT_SECS: u64 = 30;
/// Timeout for a bare ACK round trip (`TMO_ACK`).
const ACK_TIMEOUT_SECS: u64 = 5;
/// Rotator-to-trigger-arm travel tolerance past the last intended pulse.
const TOLERANCE_DEG: f64 = 0.5;
/// Ring buffer depth (`MAX_CYCLE`).
const RING_SIZE: u32 = 16;

/// Converts a raw little-endian Mono16 byte buffer's leading pixel region
/// into a `u16` sample slice for FITS output, trimming off the trailing
/// vendor metadata.
fn pixels_u16(bytes: &[u8], pixel_count: usize) -> Vec<u16> {
    bytes[..pixel_count * 2]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect()
}

/// Ties a [`NameState`] and the FITS writer together as a [`FrameSink`],
/// and best-effort announces each written filename over `transport` to
/// `command_address`, mirroring `msg_send(0, msg_buf, ipcommand, NULL, 0)`'s
/// fire-and-forget notification.
struct FileWritingSink<'a> {
    camera_id: char,
    spec: &'static CameraSpec,
    name_state: &'a mut NameState,
    run_number: u32,
    total_images: u32,
    target: TargetInfo,
    filter_position: u8,
    filter_name: String,
    cfg: &'a RunConfig,
    exposure_requested_s: f64,
    exposure_value_s: f64,
    gain_e_per_adu: f64,
    pixel_width_um: f64,
    pixel_height_um: f64,
    sensor_temperature_c: f64,
    clock_frequency_hz: u64,
    sensor_width: u32,
    sensor_height: u32,
    transport: Option<&'a Transport>,
    command_address: Option<&'a str>,
}

#[async_trait::async_trait]
impl<'a> FrameSink for FileWritingSink<'a> {
    async fn emit(&mut self, _frame_index: u32, timing: &FrameTiming, pixels: &[u8]) -> AppResult<PathBuf> {
        let path = self.name_state.next_filename();
        let pixel_count = (self.sensor_width * self.sensor_height) as usize;
        let samples = pixels_u16(pixels, pixel_count);

        let frame = FrameRecord {
            image_type: self.cfg.image_type,
            sensor_width: self.sensor_width,
            sensor_height: self.sensor_height,
            pixels_16bit: samples,
            obs_start: timing.obs_start,
            obs_end: timing.obs_end,
            filter_position: self.filter_position,
            filter_name: self.filter_name.clone(),
            target: self.target.clone(),
            rotator: RotatorGeometry {
                requested_deg: timing.rotation_requested_deg,
                begin_deg: timing.rotation_begin_deg,
                end_deg: timing.rotation_end_deg,
                arc_deg: timing.rotation_arc_deg,
                rotation_number: timing.rotation_number,
                position_in_rotation: timing.position_in_rotation,
            },
            trigger_mode: if self.cfg.is_hardware_triggered() { "External" } else { "Software" },
            exposure_requested_s: self.exposure_requested_s,
            exposure_value_s: self.exposure_value_s,
            readout_rate: self.cfg.readout_rate,
            amp_gain: self.cfg.amp_gain,
            encoding: self.cfg.encoding,
            read_order: self.cfg.read_order,
            binning: self.cfg.binning,
            sensor_temperature_c: self.sensor_temperature_c,
            gain_e_per_adu: self.gain_e_per_adu,
            timestamp_clock_frequency_hz: self.clock_frequency_hz,
            timestamp_clock_ticks: timing.timestamp_ticks,
            run_number: self.run_number,
            exposure_number: timing.position_in_rotation,
            exposure_total: self.total_images,
            pixel_width_um: self.pixel_width_um,
            pixel_height_um: self.pixel_height_um,
            altitude_deg: self.target.altitude,
            azimuth_deg: self.target.azimuth,
            cas_angle_deg: self.target.cas_angle,
            focus_position: self.target.focus,
        };

        let spec = self.spec;
        let camera_id = self.camera_id;
        let write_path = path.clone();
        tokio::task::spawn_blocking(move || fits::write_fits(&write_path, spec, camera_id, &frame))
            .await
            .map_err(|e| MoptopError::Fits(format!("write task panicked: {e}")))??;

        if let (Some(transport), Some(addr)) = (self.transport, self.command_address) {
            let _ = transport.send(0, &path.display().to_string(), addr, None).await;
        }

        Ok(path)
    }
}

/// Everything needed to run the engine for one process (master or slave),
/// bundled so the dispatch in [`run_forever`] doesn't need a dozen
/// parameters threaded through every call.
pub struct RunController {
    pub settings: Settings,
    pub transport: Transport,
    pub camera: Arc<dyn Camera>,
    pub rotator: Option<Arc<dyn Rotator>>,
    pub filter_wheel: Arc<dyn FilterWheel>,
    pub camera_id: char,
    pub spec: &'static CameraSpec,
}

impl RunController {
    /// Runs the master/slave forever-loop once per `RUN` message, matching
    /// `mopnet.c`'s `for(;;)` body. Returns only on a fatal error; a `-k`
    /// (kill) flag in a `RUN` payload exits the loop cleanly instead.
    pub async fn run_forever(&self) -> AppResult<()> {
        self.camera.open().await.map_err(|e| MoptopError::CameraOpenFailed(e.to_string()))?;
        let initial_cfg = RunConfig::parse_args("-xb -r1 -n8")?;
        let measured = self.camera.configure(&initial_cfg, 1.0).await?;
        self.camera
            .allocate_ring(RING_SIZE, measured.sensor_width, measured.sensor_height)
            .await?;
        crate::camera::cool_to_target(
            self.camera.as_ref(),
            initial_cfg.target_temperature,
            Duration::from_secs(TOK_TIMEOUT_SECS),
            !initial_cfg.quick_start,
        )
        .await?;

        loop {
            let body = self.transport.recv_forever(Tag::Run).await?;
            let cfg = RunConfig::parse_args(body.trim_start_matches("RUN").trim())?;
            if cfg.kill {
                tracing::info!(target: "moptop::run", "kill flag set, exiting run loop");
                return Ok(());
            }

            if let Err(e) = self.run_once(&cfg).await {
                tracing::error!(target: "moptop::run", error = %e, "run failed");
                return Err(e);
            }
        }
    }
}

/// Resolves the exposure time to actually command, per spec.md §4.3's
/// automatic-exposure formula. Bias frames override whatever was requested
/// (fixed or auto) with the camera's measured minimum exposure, matching
/// `cam_acq_circ`/`cam_acq_stat`'s `fts_pfx == FTS_PFX_BIAS` clamp
/// (SPEC_FULL.md §4.5/4.6, scenario S1).
fn resolve_exposure_s(cfg: &RunConfig, readout_time_s: f64, exposure_min_s: f64) -> f64 {
    if cfg.image_type == crate::protocol::ImageType::Bias {
        return exposure_min_s;
    }
    match cfg.exposure {
        crate::protocol::Exposure::Seconds(s) => s,
        crate::protocol::Exposure::Auto => {
            if cfg.angular_velocity != 0.0 {
                (cfg.rotation_step() / cfg.angular_velocity).abs() - 2.0 * readout_time_s
            } else {
                readout_time_s.max(0.001)
            }
        }
    }
}

impl RunController {
    async fn run_once(&self, cfg: &RunConfig) -> AppResult<()> {
        let provisional_exposure = match cfg.exposure {
            crate::protocol::Exposure::Seconds(s) => s,
            crate::protocol::Exposure::Auto => 1.0,
        };
        let measured = self.camera.configure(cfg, provisional_exposure).await?;
        let exposure_s = resolve_exposure_s(cfg, measured.readout_time_s, measured.exposure_min_s);
        let exposure_s = self.camera.set_exposure(exposure_s).await?;

        self.filter_wheel.goto_position(cfg.filter_wheel_position).await?;

        if self.settings.role == CameraRole::Master {
            if let Some(rotator) = &self.rotator {
                rotator.goto(cfg.static_angle, Duration::from_secs(ROT_TIMEOUT_SECS)).await?;
            }
        }

        for slot in 0..RING_SIZE {
            self.camera.queue_buffer(slot as usize).await?;
        }
        crate::camera::cool_to_target(
            self.camera.as_ref(),
            cfg.target_temperature,
            Duration::from_secs(TOK_TIMEOUT_SECS),
            false,
        )
        .await?;
        let sensor_temperature_c = self.camera.sensor_temperature().await?;

        let date = sequencer::mjd_adjusted_date(Local::now());
        let discovered = sequencer::discover_max_run_number(&cfg.output_dir, date).await?;
        let run_number = self.negotiate_run_number(cfg, discovered).await?;

        let mut name_state = NameState::start(
            cfg.output_dir.clone(),
            self.camera_id,
            cfg.image_type,
            Local::now(),
            cfg.images_per_rev,
            Some(run_number),
            discovered,
        );

        self.camera.clock_reset().await?;
        self.camera.acquisition_set_enabled(true).await?;

        if self.settings.role == CameraRole::Master {
            if let Some(peer) = self.peer_for_handshake() {
                self.transport.send(ACK_TIMEOUT_SECS, Tag::Rot.as_str(), peer, Some(Tag::Ack)).await?;
            }
        } else if let Some(_peer) = self.peer_for_handshake() {
            self.transport.recv(ROT_TIMEOUT_SECS, Some(Tag::Rot)).await?;
        }

        let filter_name = format!("position-{}", cfg.filter_wheel_position);
        let mut sink = FileWritingSink {
            camera_id: self.camera_id,
            spec: self.spec,
            name_state: &mut name_state,
            run_number,
            total_images: cfg.total_images(),
            target: cfg.target.clone(),
            filter_position: cfg.filter_wheel_position,
            filter_name,
            cfg,
            exposure_requested_s: provisional_exposure,
            exposure_value_s: exposure_s,
            gain_e_per_adu: self.spec.gain_noise(cfg.readout_rate, cfg.amp_gain).gain_e_per_adu,
            pixel_width_um: measured.pixel_width_um,
            pixel_height_um: measured.pixel_height_um,
            sensor_temperature_c,
            clock_frequency_hz: measured.clock_frequency_hz,
            sensor_width: measured.sensor_width,
            sensor_height: measured.sensor_height,
            transport: Some(&self.transport),
            command_address: self.settings.command_address.as_deref(),
        };

        if cfg.is_hardware_triggered() {
            if self.settings.role == CameraRole::Master {
                let rotator = self
                    .rotator
                    .as_ref()
                    .ok_or_else(|| MoptopError::Rotator("master has no rotator".into()))?;
                rotator
                    .arm_trigger(cfg.static_angle, cfg.rotation_step(), cfg.final_rotator_position(TOLERANCE_DEG), crate::rotator::TriggerPolarity::ActiveHigh)
                    .await?;
                rotator.enable_trigger(true).await?;
                rotator.move_absolute(cfg.final_rotator_position(TOLERANCE_DEG)).await?;
            }

            acquisition::acquire_hardware_triggered(
                self.camera.as_ref(),
                self.rotator.as_deref(),
                self.settings.role,
                RING_SIZE,
                cfg,
                exposure_s,
                measured.clock_frequency_hz,
                &mut sink,
            )
            .await?;

            if self.settings.role == CameraRole::Master {
                if let Some(rotator) = &self.rotator {
                    rotator.enable_trigger(false).await?;
                }
            }
        } else {
            let transport_pair = self
                .peer_for_handshake()
                .map(|peer| (&self.transport, peer));
            acquisition::acquire_static(
                self.camera.as_ref(),
                self.rotator.as_deref(),
                self.settings.role,
                transport_pair,
                RING_SIZE,
                cfg,
                exposure_s,
                measured.clock_frequency_hz,
                &mut sink,
            )
            .await?;
        }

        Ok(())
    }

    fn peer_for_handshake(&self) -> Option<&str> {
        if self.settings.single_camera {
            None
        } else {
            Some(self.settings.peer_address.as_str())
        }
    }

    /// Reconciles the locally-discovered run number against the peer's, the
    /// `KLUDGE` comment's behaviour in `mopnet.c`: whichever process
    /// proposes the higher run number wins, communicated via the `-U`
    /// argument forwarded in the `RUN` message (master→slave) and via a
    /// `TOK <n>` reply (slave→master).
    async fn negotiate_run_number(&self, cfg: &RunConfig, discovered_max: u32) -> AppResult<u32> {
        let local_proposal = cfg.suggested_run_number.unwrap_or(discovered_max + 1).max(discovered_max + 1);

        let Some(peer) = self.peer_for_handshake() else {
            return Ok(local_proposal);
        };

        match self.settings.role {
            CameraRole::Master => {
                let forwarded = cfg.to_message();
                let forwarded = format!("RUN {forwarded} -U{local_proposal}");
                self.transport.send(MSG_TIMEOUT_SECS, &forwarded, peer, Some(Tag::Ack)).await?;
                let (reply, _) = self.transport.recv(TOK_TIMEOUT_SECS, Some(Tag::Tok)).await?;
                if let Some(slave_run) = reply.trim_start_matches("TOK").trim().parse::<u32>().ok() {
                    Ok(local_proposal.max(slave_run))
                } else {
                    Ok(local_proposal)
                }
            }
            CameraRole::Slave => {
                let run_number = local_proposal;
                let reply = format!("{} {}", Tag::Tok.as_str(), run_number);
                self.transport.send(MSG_TIMEOUT_SECS, &reply, peer, Some(Tag::Ack)).await?;
                Ok(run_number)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixels_u16_decodes_little_endian_pairs() {
        let bytes = [0x34, 0x12, 0xFF, 0x00];
        assert_eq!(pixels_u16(&bytes, 2), vec![0x1234, 0x00FF]);
    }

    #[test]
    fn test_resolve_exposure_bias_overrides_requested_value() {
        let cfg = RunConfig::parse_args("-xb -a0 -n8 -r1 -e5").unwrap();
        assert_eq!(resolve_exposure_s(&cfg, 0.05, 0.0001), 0.0001);
    }

    #[test]
    fn test_resolve_exposure_bias_overrides_auto() {
        let cfg = RunConfig::parse_args("-xb -v45 -n16 -r1 -ea").unwrap();
        assert_eq!(resolve_exposure_s(&cfg, 0.05, 0.0001), 0.0001);
    }

    #[test]
    fn test_resolve_exposure_scenario_s5_auto() {
        let cfg = RunConfig::parse_args("-xe -ea -v45 -n8 -r1").unwrap();
        let readout_time_s = 0.01;
        let resolved = resolve_exposure_s(&cfg, readout_time_s, 0.0001);
        assert_eq!(resolved, 1.0 - 2.0 * readout_time_s);
    }

    #[test]
    fn test_resolve_exposure_fixed_value_passed_through() {
        let cfg = RunConfig::parse_args("-xe -e0.45 -v45 -n16 -r3").unwrap();
        assert_eq!(resolve_exposure_s(&cfg, 0.01, 0.0001), 0.45);
    }
}
