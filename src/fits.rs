//! FITS file emission.
//!
//! Grounded on `mop_fts.c`'s `fts_write`: one 16-bit image extension per
//! frame, a long flat run of header keywords covering observation
//! identity, telescope pointing, target metadata, rotator geometry and
//! detector calibration. Uses the `fitsio` crate (wrapping cfitsio) the
//! same way the source wraps it directly — this is the one dependency this
//! crate adds beyond the donor codebase's stack, since no example in the
//! pack performs scientific FITS I/O.

use std::path::Path;

use chrono::{DateTime, Datelike, Local, Timelike};
use fitsio::images::{ImageDescription, ImageType as FitsImageType};
use fitsio::FitsFile;

use crate::camera::{amp_gain_str, encoding_str, read_order_str, readout_rate_str, CameraSpec};
use crate::error::{AppResult, MoptopError};
use crate::protocol::{AmpGain, Encoding, ImageType, ReadOrder, ReadoutRate, TargetInfo};

/// MOPTOP rotator geometry recorded against one frame, the `Rot*[seq]`
/// arrays in `mop_cam_t`.
#[derive(Debug, Clone, Copy)]
pub struct RotatorGeometry {
    pub requested_deg: f64,
    pub begin_deg: f64,
    pub end_deg: f64,
    pub arc_deg: f64,
    pub rotation_number: u32,
    pub position_in_rotation: u32,
}

/// Everything [`write_fits`] needs for one frame that isn't already implied
/// by the camera's static [`CameraSpec`] or the run's [`crate::protocol::RunConfig`].
///
/// Owns its data (rather than borrowing from the run loop) so a whole
/// record can be moved into [`tokio::task::spawn_blocking`] for the actual
/// (blocking) cfitsio call.
pub struct FrameRecord {
    pub image_type: ImageType,
    pub sensor_width: u32,
    pub sensor_height: u32,
    pub pixels_16bit: Vec<u16>,
    pub obs_start: DateTime<Local>,
    pub obs_end: DateTime<Local>,
    pub filter_position: u8,
    pub filter_name: String,
    pub target: TargetInfo,
    pub rotator: RotatorGeometry,
    pub trigger_mode: &'static str,
    pub exposure_requested_s: f64,
    pub exposure_value_s: f64,
    pub readout_rate: ReadoutRate,
    pub amp_gain: AmpGain,
    pub encoding: Encoding,
    pub read_order: ReadOrder,
    pub binning: u8,
    pub sensor_temperature_c: f64,
    pub gain_e_per_adu: f64,
    pub timestamp_clock_frequency_hz: u64,
    pub timestamp_clock_ticks: u64,
    pub run_number: u32,
    pub exposure_number: u32,
    pub exposure_total: u32,
    pub pixel_width_um: f64,
    pub pixel_height_um: f64,
    pub altitude_deg: Option<f64>,
    pub azimuth_deg: Option<f64>,
    pub cas_angle_deg: Option<f64>,
    pub focus_position: Option<f64>,
}

const WAV_SHORT_ANGSTROM: i64 = 4200;
const WAV_LONG_ANGSTROM: i64 = 6800;

/// Unix-epoch based MJD, the same approximation as `(time(NULL)/86400.0) + 40587`.
fn unix_mjd(now: DateTime<Local>) -> f64 {
    now.timestamp() as f64 / 86400.0 + 40587.0
}

fn iso_datetime(t: DateTime<Local>) -> (String, String, String) {
    let date = format!("{:04}-{:02}-{:02}", t.year(), t.month(), t.day());
    let time = format!("{:02}:{:02}:{:02}", t.hour(), t.minute(), t.second());
    let datetime = format!("{date}T{time}.{:03}", t.timestamp_subsec_millis());
    (date, time, datetime)
}

/// Writes one FITS primary image plus full header to `path`, matching
/// `fts_write`'s key-by-key sequence. `spec` supplies the static detector
/// calibration (model, serial, well depth, dark current, pixel pitch via
/// `frame`, gain from the frame's measured readout mode).
pub fn write_fits(path: &Path, spec: &CameraSpec, camera_id: char, frame: &FrameRecord) -> AppResult<()> {
    let mut fptr = FitsFile::create(path)
        .open()
        .map_err(|e| MoptopError::Fits(format!("fits_create_file({}): {e}", path.display())))?;

    let description = ImageDescription {
        data_type: FitsImageType::UnsignedShort,
        dimensions: &[frame.sensor_height as usize, frame.sensor_width as usize],
    };
    let hdu = fptr
        .create_image("IMAGE".to_string(), &description)
        .map_err(|e| MoptopError::Fits(format!("fits_create_img(): {e}")))?;

    let (start_date, start_time, start_dt) = iso_datetime(frame.obs_start);
    let (end_date, end_time, end_dt) = iso_datetime(frame.obs_end);
    let duration_s = (frame.obs_end - frame.obs_start).num_milliseconds() as f64 / 1000.0;
    let mjd = unix_mjd(frame.obs_start);

    let obstype = match frame.image_type {
        ImageType::Bias => "bias",
        ImageType::Dark => "dark",
        ImageType::Expose => "expose",
        ImageType::Flat => "flat",
        ImageType::Acquire => "acquire",
        ImageType::Standard => "standard",
    };

    macro_rules! key {
        ($k:expr, $v:expr) => {
            hdu.write_key(&mut fptr, $k, $v)
                .map_err(|e| MoptopError::Fits(format!(concat!("write_key(", $k, "): {}"), e)))?
        };
    }

    key!("OBSTYPE", obstype.to_string());
    key!("ORIGIN", "Liverpool JMU".to_string());
    key!("INSTRUME", "MOPTOP".to_string());
    key!("FILTER1", frame.filter_position as i64);
    key!("FILTERID", frame.filter_name.to_string());
    key!("PRESCAN", 0i64);
    key!("POSTSCAN", 0i64);
    key!("WAVSHORT", WAV_SHORT_ANGSTROM);
    key!("WAVLONG", WAV_LONG_ANGSTROM);
    // `fts_write` writes `cam->RotN[seq]` (the rotation number) into
    // RUNNUM, identical to MOPRNUM below — not the sequencer's run
    // number — so that's preserved here rather than "fixed".
    key!("RUNNUM", frame.rotator.rotation_number as i64);
    key!("EXPNUM", frame.exposure_number as i64);
    key!("EXPTOTAL", frame.exposure_total as i64);

    if let Some(alt) = frame.altitude_deg {
        key!("ALTITUDE", alt);
    }
    if let Some(azm) = frame.azimuth_deg {
        key!("AZIMUTH", azm);
    }
    if let Some(cas) = frame.cas_angle_deg {
        key!("ROTANGLE", cas);
    }
    if let Some(foc) = frame.focus_position {
        key!("FOCUSPOS", foc);
    }

    key!("RA", frame.target.ra.clone().unwrap_or_default());
    key!("DEC", frame.target.dec.clone().unwrap_or_default());
    key!("OBJECT", frame.target.object.clone().unwrap_or_default());
    key!("RADECSYS", "FK5".to_string());
    key!("EQUINOX", 2000.0);
    key!("MJD", mjd);

    key!("DATE", start_date);
    key!("DATE-OBS", start_dt);
    key!("UTSTART", start_time);

    key!("ENDDATE", end_date);
    key!("END-OBS", end_dt);
    key!("UTEND", end_time);
    key!("DURATION", duration_s);

    key!("MOPRREQ", frame.rotator.requested_deg);
    key!("MOPRBEG", frame.rotator.begin_deg);
    key!("MOPREND", frame.rotator.end_deg);
    key!("MOPRARC", frame.rotator.arc_deg);
    key!("MOPRNUM", frame.rotator.rotation_number as i64);
    key!("MOPRPOS", frame.rotator.position_in_rotation as i64);

    key!("TRIGGER", frame.trigger_mode.to_string());
    key!("EXPREQST", frame.exposure_requested_s);
    key!("EXPTIME", frame.exposure_value_s);
    key!("GAIN", frame.gain_e_per_adu);
    key!("CCDXBIN", frame.binning as i64);
    key!("CCDYBIN", frame.binning as i64);
    key!("CCDATEMP", frame.sensor_temperature_c + 273.15);
    key!("CCDTYPE", "sCMOS".to_string());
    key!("CCDMODEL", spec.model.to_string());
    key!("CCDSERNO", spec.serial_number.to_string());
    key!("CCDRATE", readout_rate_str(frame.readout_rate).to_string());
    key!("CCDORDER", read_order_str(frame.read_order).to_string());
    key!("CCDENCOD", encoding_str(frame.encoding).to_string());
    key!("CCDAMP", amp_gain_str(frame.amp_gain).to_string());
    key!("CCDDEPTH", spec.well_depth_e as i64);
    key!("CCDDARK", spec.dark_current_e_per_px_s);
    key!("CCDXPIXE", frame.pixel_width_um / 1_000_000.0);
    key!("CCDYPIXE", frame.pixel_height_um / 1_000_000.0);
    key!("CLKFREQ", frame.timestamp_clock_frequency_hz as i64);
    key!("CLKSTAMP", frame.timestamp_clock_ticks as i64);

    let _ = camera_id;

    hdu.write_image(&mut fptr, &frame.pixels_16bit)
        .map_err(|e| MoptopError::Fits(format!("fits_write_img(): {e}")))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_unix_mjd_matches_known_epoch() {
        let t = Local.timestamp_opt(0, 0).unwrap();
        // time()==0 -> mjd == 40587 exactly, the Unix epoch in MJD.
        assert_eq!(unix_mjd(t), 40587.0);
    }

    #[test]
    fn test_iso_datetime_format() {
        let t = Local.with_ymd_and_hms(2024, 3, 15, 21, 5, 9).unwrap();
        let (date, time, dt) = iso_datetime(t);
        assert_eq!(date, "2024-03-15");
        assert_eq!(time, "21:05:09");
        assert!(dt.starts_with("2024-03-15T21:05:09."));
    }
}
