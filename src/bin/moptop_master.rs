//! Master process entry point: owns the rotator, drives the common
//! handshake sequence, and runs the acquisition engine for camera 1
//! (`mopnet.c`'s `main()` with `role == MASTER`).

use std::sync::Arc;

use clap::Parser;
use moptop::camera::{CameraSpec, MockCamera, CAMERA_TABLE};
use moptop::config::{CameraRole, Settings};
use moptop::error::{AppResult, MoptopError};
use moptop::filter_wheel::MockFilterWheel;
#[cfg(not(feature = "tokio_serial"))]
use moptop::rotator::mock::MockRotator;
#[cfg(feature = "tokio_serial")]
use moptop::rotator::serial::SerialRotator;
use moptop::rotator::Rotator;
use moptop::run_controller::RunController;
use moptop::transport::Transport;

#[cfg(feature = "tokio_serial")]
const SERIAL_BAUD: u32 = 115_200;

#[derive(Debug, Parser)]
#[command(name = "moptop-master", author, version, about = "MOPTOP master-camera acquisition process")]
struct Cli {
    /// Path to the process settings file (role, addresses, rotator device, ...).
    #[arg(short, long, default_value = "moptop.toml")]
    config: std::path::PathBuf,

    /// Overrides the camera serial number used to look up calibration data.
    #[arg(long)]
    camera_serial: Option<String>,
}

fn resolve_spec(serial: Option<&str>) -> AppResult<&'static CameraSpec> {
    match serial {
        Some(s) => CameraSpec::lookup(s),
        None => Ok(&CAMERA_TABLE[0]),
    }
}

fn build_rotator(settings: &Settings) -> AppResult<Arc<dyn Rotator>> {
    let device = settings
        .rotator_device
        .as_deref()
        .ok_or_else(|| MoptopError::Configuration("master role requires rotator_device".into()))?;

    #[cfg(feature = "tokio_serial")]
    {
        return Ok(Arc::new(SerialRotator::new(device, SERIAL_BAUD)));
    }

    #[cfg(not(feature = "tokio_serial"))]
    {
        tracing::warn!(
            target: "moptop::rot",
            device,
            "built without the tokio_serial feature, running against a mock rotator"
        );
        Ok(Arc::new(MockRotator::new()))
    }
}

#[tokio::main]
async fn main() -> AppResult<()> {
    let cli = Cli::parse();
    let settings = Settings::load(&cli.config)?;
    moptop::logging::init(&settings.log_level);

    if settings.role != CameraRole::Master {
        return Err(MoptopError::Configuration(
            "moptop-master requires a settings file with role = \"Master\"".into(),
        ));
    }

    let spec = resolve_spec(cli.camera_serial.as_deref())?;
    let transport = Transport::bind(&settings.bind_address).await?;
    let rotator = build_rotator(&settings)?;
    rotator.connect().await?;

    let controller = RunController {
        settings,
        transport,
        camera: Arc::new(MockCamera::new(spec.serial_number)),
        rotator: Some(rotator),
        filter_wheel: Arc::new(MockFilterWheel::new()),
        camera_id: '1',
        spec,
    };

    controller.run_forever().await
}
