//! Process-static settings for the acquisition engine.
//!
//! Loaded once at process start from a TOML file plus environment variable
//! overrides (`MOPTOP_` prefix), the same Figment-based layering the donor
//! codebase's V5 configuration system uses. This is deliberately narrow: it
//! only covers the values that *cannot* change without restarting the
//! process (bind/peer addresses, the rotator's serial device, the camera
//! calibration table path, default log level). Everything that can change
//! per run travels inside the `RUN` datagram payload instead and is decoded
//! by [`crate::protocol::RunConfig`] — see that module's doc comment for why
//! the split exists.

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{AppResult, MoptopError};

/// Which camera slot this process binds (1 = master, 2 = slave), mirroring
/// the `-c` command-line option in the source engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CameraRole {
    Master,
    Slave,
}

/// Top-level process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// This process' role.
    pub role: CameraRole,
    /// Local "ip:port" this process binds its datagram socket to.
    pub bind_address: String,
    /// Peer "ip:port" (master's address if this is the slave, and vice versa).
    pub peer_address: String,
    /// Address the command submitter listens on for filename notifications.
    pub command_address: Option<String>,
    /// Serial device path for the rotator (master only).
    #[serde(default)]
    pub rotator_device: Option<String>,
    /// Path to the camera calibration table, if overriding the built-in one.
    #[serde(default)]
    pub camera_table_path: Option<PathBuf>,
    /// Default output directory for FITS files.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Default `tracing` filter directive (e.g. "info", "moptop=debug").
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Skip all slave handshakes and run standalone (debug aid, mirrors the
    /// source engine's `-s` force-single-camera flag).
    #[serde(default)]
    pub single_camera: bool,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    /// Load settings from `path` merged with `MOPTOP_`-prefixed environment
    /// variables, which take precedence over the file.
    pub fn load(path: impl AsRef<std::path::Path>) -> AppResult<Self> {
        let settings: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("MOPTOP_").split("_"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> AppResult<()> {
        if self.role == CameraRole::Master && self.rotator_device.is_none() {
            return Err(MoptopError::Configuration(
                "master role requires rotator_device".into(),
            ));
        }
        if !crate::protocol::parse_ip_port(&self.bind_address) {
            return Err(MoptopError::Configuration(format!(
                "bind_address '{}' is not a valid ip:port",
                self.bind_address
            )));
        }
        if !crate::protocol::parse_ip_port(&self.peer_address) {
            return Err(MoptopError::Configuration(format!(
                "peer_address '{}' is not a valid ip:port",
                self.peer_address
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_master_without_rotator_device_fails_validation() {
        let settings = Settings {
            role: CameraRole::Master,
            bind_address: "127.0.0.1:9001".into(),
            peer_address: "127.0.0.1:9002".into(),
            command_address: None,
            rotator_device: None,
            camera_table_path: None,
            output_dir: default_output_dir(),
            log_level: default_log_level(),
            single_camera: false,
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_slave_without_rotator_device_is_valid() {
        let settings = Settings {
            role: CameraRole::Slave,
            bind_address: "127.0.0.1:9002".into(),
            peer_address: "127.0.0.1:9001".into(),
            command_address: None,
            rotator_device: None,
            camera_table_path: None,
            output_dir: default_output_dir(),
            log_level: default_log_level(),
            single_camera: false,
        };
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_bad_bind_address_rejected() {
        let settings = Settings {
            role: CameraRole::Slave,
            bind_address: "not-an-address".into(),
            peer_address: "127.0.0.1:9001".into(),
            command_address: None,
            rotator_device: None,
            camera_table_path: None,
            output_dir: default_output_dir(),
            log_level: default_log_level(),
            single_camera: false,
        };
        assert!(settings.validate().is_err());
    }
}
