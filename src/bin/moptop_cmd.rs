//! Command submitter: a short-lived process that posts one `RUN` request to
//! the master and prints each frame's filename as it's written, mirroring
//! the source specification's third process role (`mop_cmd`-equivalent).
//!
//! Unlike the master/slave processes this reads no settings file: the
//! master's address and this process' own listening address (which must
//! match the target processes' configured `command_address`) are passed
//! directly on the command line.

use clap::Parser;
use moptop::error::AppResult;
use moptop::protocol::{RunConfig, Tag};
use moptop::transport::Transport;

/// Timeout waiting for the master's ACK of the submitted `RUN` message.
const SUBMIT_TIMEOUT_SECS: u64 = 30;
/// Timeout waiting for each frame's filename notification.
const NOTIFY_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Parser)]
#[command(name = "moptop-cmd", author, version, about = "Submits a MOPTOP run and reports written filenames")]
struct Cli {
    /// Master process address ("ip:port").
    #[arg(long)]
    master: String,

    /// Local address to bind for sending the request and receiving
    /// filename notifications; must match the engine's configured
    /// `command_address`.
    #[arg(long)]
    listen: String,

    /// The run's parameters, in the same `-<opt><arg>` grammar as the wire
    /// protocol (e.g. `"-xb -n8 -r1 -v45 -e0.5"`).
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

#[tokio::main]
async fn main() -> AppResult<()> {
    moptop::logging::init("info");

    let cli = Cli::parse();
    let body = cli.args.join(" ");
    let cfg = RunConfig::parse_args(&body)?;
    let total = cfg.total_images();

    let transport = Transport::bind(&cli.listen).await?;
    let message = format!("{} {}", Tag::Run.as_str(), body);
    transport
        .send(SUBMIT_TIMEOUT_SECS, &message, &cli.master, Some(Tag::Ack))
        .await?;
    tracing::info!(target: "moptop::cmd", total_images = total, "run accepted, awaiting frames");

    for frame in 1..=total {
        let (payload, _) = transport.recv(NOTIFY_TIMEOUT_SECS, None).await?;
        println!("{frame}/{total} {payload}");
    }

    Ok(())
}
