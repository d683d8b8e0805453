//! Slave process entry point: no rotator of its own, follows the master's
//! ROT/TRG handshake and runs the acquisition engine for camera 2
//! (`mopnet.c`'s `main()` with `role == SLAVE`).

use std::sync::Arc;

use clap::Parser;
use moptop::camera::{CameraSpec, MockCamera, CAMERA_TABLE};
use moptop::config::{CameraRole, Settings};
use moptop::error::{AppResult, MoptopError};
use moptop::filter_wheel::MockFilterWheel;
use moptop::run_controller::RunController;
use moptop::transport::Transport;

#[derive(Debug, Parser)]
#[command(name = "moptop-slave", author, version, about = "MOPTOP slave-camera acquisition process")]
struct Cli {
    /// Path to the process settings file (role, addresses, ...).
    #[arg(short, long, default_value = "moptop.toml")]
    config: std::path::PathBuf,

    /// Overrides the camera serial number used to look up calibration data.
    #[arg(long)]
    camera_serial: Option<String>,
}

fn resolve_spec(serial: Option<&str>) -> AppResult<&'static CameraSpec> {
    match serial {
        Some(s) => CameraSpec::lookup(s),
        None => Ok(&CAMERA_TABLE[1]),
    }
}

#[tokio::main]
async fn main() -> AppResult<()> {
    let cli = Cli::parse();
    let settings = Settings::load(&cli.config)?;
    moptop::logging::init(&settings.log_level);

    if settings.role != CameraRole::Slave {
        return Err(MoptopError::Configuration(
            "moptop-slave requires a settings file with role = \"Slave\"".into(),
        ));
    }

    let spec = resolve_spec(cli.camera_serial.as_deref())?;
    let transport = Transport::bind(&settings.bind_address).await?;

    let controller = RunController {
        settings,
        transport,
        camera: Arc::new(MockCamera::new(spec.serial_number)),
        rotator: None,
        filter_wheel: Arc::new(MockFilterWheel::new()),
        camera_id: '2',
        spec,
    };

    controller.run_forever().await
}
