//! The synchronization protocol's message tags and the `RUN` payload grammar.
//!
//! Two distinct things live here, both grounded on the same pair of source
//! files (`mop_utl.c`'s `utl_arg2msg`/`utl_msg2arg`, `mop_opt.c`'s
//! `mop_opts`):
//!
//! - [`Tag`] — the five-letter message vocabulary (`RUN`, `TOK`, `ROT`,
//!   `TRG`, `ACK`/`NAK`) that rides on top of the raw datagram transport.
//! - [`RunConfig`] — the per-run parameters carried inside a `RUN` payload,
//!   together with `parse_args`/`to_message`, which decode and re-encode the
//!   `-<opt><arg>` space-separated argument grammar. This is genuinely part
//!   of the core engine rather than ambient CLI plumbing: a `RUN` message's
//!   body *is* this grammar, on the wire, between two processes — it just
//!   happens to look like shell arguments because the source reused
//!   `getopt` to parse it twice (once from `argv`, once from a re-split
//!   message string).

use std::path::PathBuf;

use crate::error::{AppResult, MoptopError};

/// The five message tags (plus ACK/NAK) that comprise the synchronization
/// protocol, per the external interface table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Run,
    Tok,
    Rot,
    Trg,
    Ack,
    Nak,
}

impl Tag {
    pub fn as_str(self) -> &'static str {
        match self {
            Tag::Run => "RUN",
            Tag::Tok => "TOK",
            Tag::Rot => "ROT",
            Tag::Trg => "TRG",
            Tag::Ack => "ACK",
            Tag::Nak => "NAK",
        }
    }
}

/// `true` if `s` looks like `"n.n.n.n:port"`, mirroring `utl_chk_ip`'s
/// sanity check (not a full validation — just enough to catch typos before
/// a socket bind fails obscurely later).
pub fn parse_ip_port(s: &str) -> bool {
    let Some((host, port)) = s.rsplit_once(':') else {
        return false;
    };
    let octets: Vec<&str> = host.split('.').collect();
    if octets.len() != 4 {
        return false;
    }
    if !octets.iter().all(|o| o.parse::<u8>().is_ok()) {
        return false;
    }
    port.parse::<u16>().is_ok()
}

/// Exposure time: either a fixed value or `auto`, resolved per §4.3's
/// formula once the rotator step/velocity and measured readout time are
/// known.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Exposure {
    Seconds(f64),
    Auto,
}

/// Image type tag, in the same order as both the data-model names and the
/// single-character flags so the two lists line up positionally:
/// bias/b, dark/d, expose/e, flat/f, acquire/q, standard/s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageType {
    Bias,
    Dark,
    Expose,
    Flat,
    Acquire,
    Standard,
}

impl ImageType {
    fn from_char(c: char) -> AppResult<Self> {
        Ok(match c {
            'b' => ImageType::Bias,
            'd' => ImageType::Dark,
            'e' => ImageType::Expose,
            'f' => ImageType::Flat,
            'q' => ImageType::Acquire,
            's' => ImageType::Standard,
            _ => {
                return Err(MoptopError::InvalidArgument {
                    flag: 'x',
                    reason: format!("unrecognised image type '{c}'"),
                })
            }
        })
    }

    fn to_char(self) -> char {
        match self {
            ImageType::Bias => 'b',
            ImageType::Dark => 'd',
            ImageType::Expose => 'e',
            ImageType::Flat => 'f',
            ImageType::Acquire => 'q',
            ImageType::Standard => 's',
        }
    }

    /// Single-character file-sequencer prefix, identical to the wire flag.
    pub fn prefix_char(self) -> char {
        self.to_char()
    }
}

/// Pixel readout rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadoutRate {
    Mhz100,
    Mhz270,
}

/// Electronic amplifier gain mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmpGain {
    Gain12H,
    Gain12L,
    Gain16L,
}

/// Pixel encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Mono12,
    Mono12Packed,
    Mono16,
}

/// Pixel readout order. The six named patterns are opaque to the engine —
/// they select a vendor scan pattern and are passed straight through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOrder {
    BuSeq,
    BuSim,
    CoSim,
    OiSim,
    TdSeq,
    TdSim,
}

impl ReadOrder {
    fn from_str(s: &str) -> AppResult<Self> {
        Ok(match s {
            "BUSEQ" => ReadOrder::BuSeq,
            "BUSIM" => ReadOrder::BuSim,
            "COSIM" => ReadOrder::CoSim,
            "OISIM" => ReadOrder::OiSim,
            "TDSEQ" => ReadOrder::TdSeq,
            "TDSIM" => ReadOrder::TdSim,
            _ => {
                return Err(MoptopError::InvalidArgument {
                    flag: 'o',
                    reason: format!("unrecognised read order '{s}'"),
                })
            }
        })
    }

    fn as_str(self) -> &'static str {
        match self {
            ReadOrder::BuSeq => "BUSEQ",
            ReadOrder::BuSim => "BUSIM",
            ReadOrder::CoSim => "COSIM",
            ReadOrder::OiSim => "OISIM",
            ReadOrder::TdSeq => "TDSEQ",
            ReadOrder::TdSim => "TDSIM",
        }
    }
}

/// Target pointing and identity metadata carried through to the FITS
/// header, with no bearing on acquisition logic itself.
#[derive(Debug, Clone, Default)]
pub struct TargetInfo {
    pub object: Option<String>,
    pub ra: Option<String>,
    pub dec: Option<String>,
    pub focus: Option<f64>,
    pub cas_angle: Option<f64>,
    pub altitude: Option<f64>,
    pub azimuth: Option<f64>,
}

/// The per-run parameters derived from a `RUN` message body.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub exposure: Exposure,
    pub image_type: ImageType,
    pub binning: u8,
    pub readout_rate: ReadoutRate,
    pub amp_gain: AmpGain,
    pub encoding: Encoding,
    pub read_order: ReadOrder,
    pub revolutions: u32,
    pub images_per_rev: u32,
    /// Signed degrees/second; 0 = static (software-triggered).
    pub angular_velocity: f64,
    pub target_temperature: f64,
    pub quick_start: bool,
    pub filter_wheel_position: u8,
    pub output_dir: PathBuf,
    pub target: TargetInfo,
    /// `-a`: fixed angle override for the static/software-triggered case.
    pub static_angle: f64,
    /// `-U`: a suggested starting run number, forwarded master→slave.
    pub suggested_run_number: Option<u32>,
    pub kill: bool,
}

impl RunConfig {
    /// `img_total = img_cycle × revolutions`, per the data-model invariant.
    pub fn total_images(&self) -> u32 {
        self.images_per_rev * self.revolutions
    }

    /// `rot_step = ±360/img_cycle`; sign follows the velocity's sign, 0 when
    /// static.
    pub fn rotation_step(&self) -> f64 {
        let magnitude = 360.0 / self.images_per_rev as f64;
        if self.angular_velocity > 0.0 {
            magnitude
        } else if self.angular_velocity < 0.0 {
            -magnitude
        } else {
            0.0
        }
    }

    /// `true` when the rotator is moving and hardware-triggered acquisition
    /// applies (§4.5); `false` selects the static/software-triggered loop
    /// (§4.6).
    pub fn is_hardware_triggered(&self) -> bool {
        self.angular_velocity != 0.0
    }

    /// The rotator's commanded final position: `img_total × rot_step`,
    /// pulled back by `tolerance_deg` so the rotator halts past the last
    /// intended trigger point without overshooting its travel limit.
    pub fn final_rotator_position(&self, tolerance_deg: f64) -> f64 {
        let raw = self.total_images() as f64 * self.rotation_step();
        if raw >= 0.0 {
            raw - tolerance_deg
        } else {
            raw + tolerance_deg
        }
    }

    /// Parses a `RUN` message body (space-separated `-<opt><arg>` tokens, no
    /// space between option and argument) into a [`RunConfig`]. Mirrors
    /// `mop_opts`'s `getopt`-driven parse, minus its process-start-only
    /// options (serial device, IP addresses, camera index) which belong in
    /// [`crate::config::Settings`] instead.
    pub fn parse_args(body: &str) -> AppResult<Self> {
        let mut exposure = Exposure::Auto;
        let mut image_type = ImageType::Expose;
        let mut binning: u8 = 1;
        let mut readout_rate = ReadoutRate::Mhz100;
        let mut amp_gain = AmpGain::Gain12H;
        let mut encoding = Encoding::Mono16;
        let mut read_order = ReadOrder::BuSeq;
        let mut revolutions: u32 = 1;
        let mut images_per_rev: u32 = 8;
        let mut angular_velocity: f64 = 0.0;
        let mut target_temperature: f64 = -20.0;
        let mut quick_start = false;
        let mut filter_wheel_position: u8 = 1;
        let mut output_dir = PathBuf::from(".");
        let mut target = TargetInfo::default();
        let mut static_angle: f64 = 0.0;
        let mut suggested_run_number = None;
        let mut kill = false;

        for token in body.split_whitespace() {
            let token = token.strip_prefix('-').ok_or_else(|| MoptopError::InvalidArgument {
                flag: '?',
                reason: format!("expected '-<opt>...', got '{token}'"),
            })?;
            let mut chars = token.chars();
            let flag = chars.next().ok_or_else(|| MoptopError::InvalidArgument {
                flag: '?',
                reason: "empty option".into(),
            })?;
            let arg: &str = chars.as_str();

            match flag {
                'e' => {
                    exposure = if arg == "a" {
                        Exposure::Auto
                    } else {
                        Exposure::Seconds(parse_f64(flag, arg)?)
                    };
                }
                'x' => image_type = ImageType::from_char(arg.chars().next().unwrap_or(' '))?,
                'b' => {
                    let v = parse_u8(flag, arg)?;
                    if ![1, 2, 3, 4, 8].contains(&v) {
                        return Err(MoptopError::InvalidArgument {
                            flag,
                            reason: "binning must be one of 1,2,3,4,8".into(),
                        });
                    }
                    binning = v;
                }
                'f' => {
                    readout_rate = match arg {
                        "100" => ReadoutRate::Mhz100,
                        "270" => ReadoutRate::Mhz270,
                        _ => {
                            return Err(MoptopError::InvalidArgument {
                                flag,
                                reason: "readout rate must be 100 or 270".into(),
                            })
                        }
                    };
                }
                'm' => {
                    amp_gain = match arg {
                        "12H" => AmpGain::Gain12H,
                        "12L" => AmpGain::Gain12L,
                        "16L" => AmpGain::Gain16L,
                        _ => {
                            return Err(MoptopError::InvalidArgument {
                                flag,
                                reason: "amp gain must be one of 12H,12L,16L".into(),
                            })
                        }
                    };
                }
                'p' => {
                    encoding = match arg {
                        "12" => Encoding::Mono12,
                        "12PACK" => Encoding::Mono12Packed,
                        "16" => Encoding::Mono16,
                        _ => {
                            return Err(MoptopError::InvalidArgument {
                                flag,
                                reason: "encoding must be one of 12,12PACK,16".into(),
                            })
                        }
                    };
                }
                'n' => {
                    let v = parse_u32(flag, arg)?;
                    if v != 8 && v != 16 {
                        return Err(MoptopError::InvalidArgument {
                            flag,
                            reason: "images-per-revolution must be 8 or 16".into(),
                        });
                    }
                    images_per_rev = v;
                }
                'o' => read_order = ReadOrder::from_str(arg)?,
                'r' => {
                    let v = parse_u32(flag, arg)?;
                    if !(1..=100).contains(&v) {
                        return Err(MoptopError::InvalidArgument {
                            flag,
                            reason: "revolutions must be in 1..=100".into(),
                        });
                    }
                    revolutions = v;
                }
                'v' => {
                    let v = parse_f64(flag, arg)?;
                    if v.abs() > 360.0 {
                        return Err(MoptopError::InvalidArgument {
                            flag,
                            reason: "angular velocity magnitude must be <= 360".into(),
                        });
                    }
                    angular_velocity = v;
                }
                't' => target_temperature = parse_f64(flag, arg)?,
                'q' => quick_start = arg == "1",
                'w' => {
                    let v = parse_u8(flag, arg)?;
                    if !(1..=5).contains(&v) {
                        return Err(MoptopError::InvalidArgument {
                            flag,
                            reason: "filter wheel position must be in 1..=5".into(),
                        });
                    }
                    filter_wheel_position = v;
                }
                'W' => output_dir = PathBuf::from(arg),
                'O' => target.object = Some(arg.to_string()),
                'R' => target.ra = Some(arg.to_string()),
                'D' => target.dec = Some(arg.to_string()),
                'F' => target.focus = Some(parse_f64(flag, arg)?),
                'C' => target.cas_angle = Some(parse_f64(flag, arg)?),
                'A' => target.altitude = Some(parse_f64(flag, arg)?),
                'Z' => target.azimuth = Some(parse_f64(flag, arg)?),
                'a' => static_angle = parse_f64(flag, arg)?,
                'U' => suggested_run_number = Some(parse_u32(flag, arg)?),
                'k' => kill = true,
                other => {
                    // Informational/unstructured options are logged and
                    // ignored rather than rejected; structural options are
                    // hard errors (§7 Argument-level error class).
                    tracing::warn!(target: "moptop::opt", "ignoring unrecognised option -{other}");
                }
            }
        }

        Ok(RunConfig {
            exposure,
            image_type,
            binning,
            readout_rate,
            amp_gain,
            encoding,
            read_order,
            revolutions,
            images_per_rev,
            angular_velocity,
            target_temperature,
            quick_start,
            filter_wheel_position,
            output_dir,
            target,
            static_angle,
            suggested_run_number,
            kill,
        })
    }

    /// Re-encodes this config as a `RUN` message body, the inverse of
    /// [`RunConfig::parse_args`]. Used by the master to forward the
    /// request on to the slave, appending a suggested run number as `-U<n>`
    /// the same way the source's "KLUDGE" comment describes.
    pub fn to_message(&self) -> String {
        let mut parts = vec![
            match self.exposure {
                Exposure::Auto => "-ea".to_string(),
                Exposure::Seconds(s) => format!("-e{s}"),
            },
            format!("-x{}", self.image_type.to_char()),
            format!("-b{}", self.binning),
            format!(
                "-f{}",
                match self.readout_rate {
                    ReadoutRate::Mhz100 => "100",
                    ReadoutRate::Mhz270 => "270",
                }
            ),
            format!(
                "-m{}",
                match self.amp_gain {
                    AmpGain::Gain12H => "12H",
                    AmpGain::Gain12L => "12L",
                    AmpGain::Gain16L => "16L",
                }
            ),
            format!(
                "-p{}",
                match self.encoding {
                    Encoding::Mono12 => "12",
                    Encoding::Mono12Packed => "12PACK",
                    Encoding::Mono16 => "16",
                }
            ),
            format!("-o{}", self.read_order.as_str()),
            format!("-r{}", self.revolutions),
            format!("-n{}", self.images_per_rev),
            format!("-v{}", self.angular_velocity),
            format!("-t{}", self.target_temperature),
            format!("-q{}", if self.quick_start { 1 } else { 0 }),
            format!("-w{}", self.filter_wheel_position),
            format!("-W{}", self.output_dir.display()),
            format!("-a{}", self.static_angle),
        ];
        if let Some(object) = &self.target.object {
            parts.push(format!("-O{object}"));
        }
        if let Some(ra) = &self.target.ra {
            parts.push(format!("-R{ra}"));
        }
        if let Some(dec) = &self.target.dec {
            parts.push(format!("-D{dec}"));
        }
        if let Some(run) = self.suggested_run_number {
            parts.push(format!("-U{run}"));
        }
        if self.kill {
            parts.push("-k".to_string());
        }
        parts.join(" ")
    }
}

fn parse_f64(flag: char, arg: &str) -> AppResult<f64> {
    arg.parse().map_err(|_| MoptopError::InvalidArgument {
        flag,
        reason: format!("'{arg}' is not a number"),
    })
}

fn parse_u32(flag: char, arg: &str) -> AppResult<u32> {
    arg.parse().map_err(|_| MoptopError::InvalidArgument {
        flag,
        reason: format!("'{arg}' is not an integer"),
    })
}

fn parse_u8(flag: char, arg: &str) -> AppResult<u8> {
    arg.parse().map_err(|_| MoptopError::InvalidArgument {
        flag,
        reason: format!("'{arg}' is not an integer"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ip_port_valid() {
        assert!(parse_ip_port("192.168.1.10:4400"));
    }

    #[test]
    fn test_parse_ip_port_invalid() {
        assert!(!parse_ip_port("not-an-ip"));
        assert!(!parse_ip_port("192.168.1.10"));
        assert!(!parse_ip_port("192.168.1.10:bad"));
    }

    #[test]
    fn test_parse_args_rejects_bad_binning() {
        let err = RunConfig::parse_args("-xb -b5 -n8 -r1").unwrap_err();
        assert!(err.to_string().contains("binning"));
    }

    #[test]
    fn test_parse_args_scenario_s1_static_bias() {
        let cfg = RunConfig::parse_args("-xb -a0 -n8 -r1").unwrap();
        assert_eq!(cfg.image_type, ImageType::Bias);
        assert_eq!(cfg.static_angle, 0.0);
        assert_eq!(cfg.images_per_rev, 8);
        assert_eq!(cfg.revolutions, 1);
        assert_eq!(cfg.total_images(), 8);
        assert!(!cfg.is_hardware_triggered());
    }

    #[test]
    fn test_parse_args_scenario_s2_clockwise() {
        let cfg = RunConfig::parse_args("-v45 -n16 -r3 -e0.45").unwrap();
        assert_eq!(cfg.total_images(), 48);
        assert_eq!(cfg.rotation_step(), 22.5);
        assert!(cfg.is_hardware_triggered());
    }

    #[test]
    fn test_parse_args_scenario_s3_counter_clockwise() {
        let cfg = RunConfig::parse_args("-v-45 -n16 -r1").unwrap();
        assert_eq!(cfg.rotation_step(), -22.5);
    }

    #[test]
    fn test_roundtrip_through_message() {
        let cfg = RunConfig::parse_args("-v45 -n16 -r3 -e0.45 -xb -U7").unwrap();
        let msg = cfg.to_message();
        let reparsed = RunConfig::parse_args(&msg).unwrap();
        assert_eq!(reparsed.angular_velocity, cfg.angular_velocity);
        assert_eq!(reparsed.images_per_rev, cfg.images_per_rev);
        assert_eq!(reparsed.suggested_run_number, Some(7));
    }

    #[test]
    fn test_final_rotator_position_clockwise() {
        let cfg = RunConfig::parse_args("-v45 -n16 -r3").unwrap();
        // 48 frames * 22.5 deg = 1080, minus tolerance.
        assert_eq!(cfg.final_rotator_position(1.0), 1079.0);
    }
}
