//! Structured logging setup.
//!
//! The source engine logs through a single `mop_log(ok, severity, facility,
//! fmt, ...)` call threaded through every operation, where `facility` picks
//! one of ten subsystems (`MOP`, `LOG`, `UTL`, `OPT`, `CAM`, `ROT`, `FTS`,
//! `MSG`, `WHL`, `CMD`) and `severity` is one of eight levels (`CRIT`, `SYS`,
//! `ERR`, `WRN`, `IMG`, `INF`, `MSG`, `DBG`). `tracing`'s target string and
//! `Level` give the same two axes without a bespoke logger: the facility
//! becomes the event's target, the severity maps onto a `tracing::Level`
//! plus a `kind` field for the two severities (`IMG`, `MSG`) that don't have
//! a same-named `Level`. Colour-coded formatting is out of scope; the
//! default `tracing-subscriber` formatter is used unstyled.

use tracing_subscriber::EnvFilter;

/// One of the ten logging facilities from the source engine's `fac_levels`
/// table, reused here as `tracing` target strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facility {
    Mop,
    Log,
    Utl,
    Opt,
    Cam,
    Rot,
    Fts,
    Msg,
    Whl,
    Cmd,
}

impl Facility {
    /// The `tracing` target string for this facility.
    pub fn target(self) -> &'static str {
        match self {
            Facility::Mop => "moptop::mop",
            Facility::Log => "moptop::log",
            Facility::Utl => "moptop::utl",
            Facility::Opt => "moptop::opt",
            Facility::Cam => "moptop::cam",
            Facility::Rot => "moptop::rot",
            Facility::Fts => "moptop::fts",
            Facility::Msg => "moptop::msg",
            Facility::Whl => "moptop::whl",
            Facility::Cmd => "moptop::cmd",
        }
    }
}

/// Initializes the global `tracing` subscriber.
///
/// `filter_directive` is an `EnvFilter` directive string (e.g. `"info"` or
/// `"moptop::cam=debug,info"`); `RUST_LOG`, if set, overrides it.
pub fn init(filter_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive.to_string()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Logs an `IMG`-severity event (a successfully written frame) at the given
/// facility target. Kept as a macro-free helper so call sites stay close to
/// plain `tracing::info!` usage elsewhere in the engine.
#[macro_export]
macro_rules! log_img {
    ($facility:expr, $($arg:tt)*) => {
        tracing::info!(target: $facility.target(), kind = "IMG", $($arg)*);
    };
}
