//! Output filename sequencing: `<cam>_<type>_<date>_<run>_<rev>_<pos>_0.fits`.
//!
//! Grounded on `mop_fts.c`'s `fts_mkname`/`fts_selname`/`fts_compare`. The
//! original packs "first call vs. next call" behaviour into one function
//! keyed off a sentinel argument and static local state; here that becomes
//! an explicit [`NameState`] built once per run and advanced by
//! [`NameState::next_filename`].

use std::path::{Path, PathBuf};

use chrono::{Datelike, Local, NaiveDate, Timelike};

use crate::error::AppResult;
use crate::protocol::ImageType;

/// MJD day boundary used by the engine: a new observing day begins at local
/// noon, not at local midnight and not at UTC midnight. This mirrors
/// `fts_mkname`'s explicit `if (hour <= 11) day--;` against `localtime()`,
/// which is local-time, not UTC — preserved here exactly rather than
/// "corrected" to UTC, since every existing archive's date-stamped filenames
/// depend on this exact boundary.
pub fn mjd_adjusted_date(now: chrono::DateTime<Local>) -> NaiveDate {
    if now.hour() <= 11 {
        now.date_naive().pred_opt().expect("date arithmetic underflow")
    } else {
        now.date_naive()
    }
}

/// Per-run filename state: the observing date (fixed for the run's
/// duration, computed once at first call) and a monotonically advancing
/// sequence counter.
#[derive(Debug, Clone)]
pub struct NameState {
    output_dir: PathBuf,
    camera_id: char,
    image_type: char,
    date: NaiveDate,
    run_number: u32,
    seq: u32,
    images_per_rev: u32,
}

/// Builds the filename prefix used both for on-disk scanning
/// (`fts_file_pfx`, `"%c_"`) and for the final filename.
fn camera_prefix(camera_id: char) -> String {
    format!("{camera_id}_")
}

/// Builds the date substring embedded in every filename for today's
/// observing date (`fts_file_str`, `"_YYYYMMDD_"`).
fn date_substring(date: NaiveDate) -> String {
    format!("_{:04}{:02}{:02}_", date.year(), date.month(), date.day())
}

/// The full set of camera identifiers the engine knows about (`'1'..='6'`,
/// matching `mop_opt.c`'s `cam_info[]` table), scanned as one directory pass
/// since run numbers are shared across both cameras writing into the same
/// `output_dir`.
const CAMERA_IDS: [char; 6] = ['1', '2', '3', '4', '5', '6'];

/// Scans `output_dir` for existing FITS files from *any* camera dated
/// `date`, returning the highest run number found (0 if none), mirroring
/// `fts_mkname`'s `scandir`/`fts_compare` loop, which filters on the date
/// substring alone and lets every camera's `fts_compare` call contend for
/// the same run-number sequence (spec.md §4.8: "for every camera c"). The
/// run number is the field immediately after the date in the filename
/// (`<cam>_<type>_<date>_<run>_...`).
pub async fn discover_max_run_number(output_dir: &Path, date: NaiveDate) -> AppResult<u32> {
    let date_str = date_substring(date);
    let prefixes: Vec<String> = CAMERA_IDS.iter().map(|&c| camera_prefix(c)).collect();

    let mut max_run = 0u32;
    let mut entries = match tokio::fs::read_dir(output_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(crate::error::MoptopError::Io(e)),
    };

    while let Some(entry) = entries.next_entry().await.map_err(crate::error::MoptopError::Io)? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let matches_camera = prefixes.iter().any(|p| name.starts_with(p.as_str()));
        if !matches_camera || !name.contains(&date_str) || !name.ends_with("_0.fits") {
            continue;
        }
        if let Some(run) = parse_run_number(name, &date_str) {
            max_run = max_run.max(run);
        }
    }

    Ok(max_run)
}

/// Extracts the run-number field from a filename of the form
/// `<cam>_<type>_<date>_<run>_<rev>_<pos>_0.fits`, i.e. the first
/// underscore-delimited token after the date substring.
fn parse_run_number(name: &str, date_str: &str) -> Option<u32> {
    let after_date = name.split_once(date_str)?.1;
    let run_token = after_date.split('_').next()?;
    run_token.parse().ok()
}

impl NameState {
    /// Establishes filename state for a new run, matching `fts_mkname`'s
    /// first-call branch: computes today's MJD-adjusted date, then either
    /// forces the run number (when `forced_run` is `Some`, the `*frun > 0`
    /// branch) or scans the output directory for the next available run
    /// number across both cameras (the `*frun == 0` branch — here the
    /// caller passes the already-combined max across both camera
    /// directories, since each process only writes its own camera's files).
    pub fn start(
        output_dir: PathBuf,
        camera_id: char,
        image_type: ImageType,
        now: chrono::DateTime<Local>,
        images_per_rev: u32,
        forced_run: Option<u32>,
        discovered_max_run: u32,
    ) -> Self {
        let date = mjd_adjusted_date(now);
        let run_number = forced_run.unwrap_or(discovered_max_run + 1);
        Self {
            output_dir,
            camera_id,
            image_type: image_type.prefix_char(),
            date,
            run_number,
            seq: 0,
            images_per_rev,
        }
    }

    pub fn run_number(&self) -> u32 {
        self.run_number
    }

    /// Generates the next filename and advances the sequence counter,
    /// matching `fts_mkname`'s `FTS_NEXT` branch. `revolution` and
    /// `position_in_revolution` are 1-based, computed the same way as
    /// `1+(cam->seq)/img_cycle` and `1+(cam->seq)%img_cycle`.
    pub fn next_filename(&mut self) -> PathBuf {
        let revolution = 1 + self.seq / self.images_per_rev;
        let position = 1 + self.seq % self.images_per_rev;
        let name = format!(
            "{}_{}_{:04}{:02}{:02}_{}_{}_{}_0.fits",
            self.camera_id,
            self.image_type,
            self.date.year(),
            self.date.month(),
            self.date.day(),
            self.run_number,
            revolution,
            position
        );
        self.seq += 1;
        self.output_dir.join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn local_at(year: i32, month: u32, day: u32, hour: u32) -> chrono::DateTime<Local> {
        Local.with_ymd_and_hms(year, month, day, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_mjd_boundary_before_noon_rolls_back() {
        let date = mjd_adjusted_date(local_at(2024, 3, 15, 10));
        assert_eq!(date, NaiveDate::from_ymd_opt(2024, 3, 14).unwrap());
    }

    #[test]
    fn test_mjd_boundary_after_noon_stays() {
        let date = mjd_adjusted_date(local_at(2024, 3, 15, 12));
        assert_eq!(date, NaiveDate::from_ymd_opt(2024, 3, 15).unwrap());
    }

    #[test]
    fn test_mjd_boundary_month_rollover() {
        // 1st of the month, before noon -> last day of previous month.
        let date = mjd_adjusted_date(local_at(2024, 3, 1, 6));
        assert_eq!(date, NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
    }

    #[test]
    fn test_mjd_boundary_year_rollover() {
        let date = mjd_adjusted_date(local_at(2024, 1, 1, 6));
        assert_eq!(date, NaiveDate::from_ymd_opt(2023, 12, 31).unwrap());
    }

    #[test]
    fn test_next_filename_sequence_and_revolution_wrap() {
        let mut state = NameState::start(
            PathBuf::from("/data"),
            '1',
            ImageType::Expose,
            local_at(2024, 3, 15, 13),
            8,
            Some(4),
            0,
        );
        assert_eq!(
            state.next_filename(),
            PathBuf::from("/data/1_e_20240315_4_1_1_0.fits")
        );
        for _ in 0..6 {
            state.next_filename();
        }
        // seq is now 7 (0-indexed), the 8th frame: still revolution 1, position 8.
        assert_eq!(
            state.next_filename(),
            PathBuf::from("/data/1_e_20240315_4_1_8_0.fits")
        );
        // seq now 8: wraps into revolution 2, position 1.
        assert_eq!(
            state.next_filename(),
            PathBuf::from("/data/1_e_20240315_4_2_1_0.fits")
        );
    }

    #[test]
    fn test_parse_run_number_extracts_field_after_date() {
        let name = "1_e_20240315_7_1_3_0.fits";
        assert_eq!(parse_run_number(name, "_20240315_"), Some(7));
    }

    #[test]
    fn test_parse_run_number_rejects_malformed() {
        assert_eq!(parse_run_number("not_a_match.fits", "_20240315_"), None);
    }

    #[tokio::test]
    async fn test_discover_max_run_number_scans_all_camera_prefixes() {
        let dir = tempfile::tempdir().unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        // Camera 1 wrote run 4, camera 2 (the other half of the pair) wrote
        // a later run 9 into the same directory; single-camera debug mode
        // has no TOK negotiation to paper over a miss here, so the scan
        // must see both prefixes, not just the caller's own camera.
        tokio::fs::write(dir.path().join("1_e_20240315_4_1_1_0.fits"), b"")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("2_e_20240315_9_1_1_0.fits"), b"")
            .await
            .unwrap();

        let max_run = discover_max_run_number(dir.path(), date).await.unwrap();
        assert_eq!(max_run, 9);
    }

    #[tokio::test]
    async fn test_discover_max_run_number_missing_dir_returns_zero() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        let max_run = discover_max_run_number(Path::new("/no/such/dir"), date)
            .await
            .unwrap();
        assert_eq!(max_run, 0);
    }
}
