//! portkeeper library (lib.rs)
//!
//! Keeps a set of UPnP port forwardings alive with short leases: renews
//! them before they expire, repairs them when the router drops or alters
//! them, and removes them on shutdown.

#![warn(clippy::all)]

pub mod config;
pub mod nat;

pub use config::KeeperConfig;
pub use nat::{
    ForwardError, ForwardOptions, GatewayClient, LeaseScheduler, MappingDescriptor, MemoryGateway,
    Protocol, Reconciler, ScheduleConfig, SchedulerState, UpnpGateway,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging at an explicit level
///
/// # Arguments
/// * `level` - Log level (trace/debug/info/warn/error) or a full filter directive
///
/// Falls back to `info` if `level` does not parse. The environment is not
/// consulted.
pub fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    // Reduce verbosity of some dependencies
    let quiet = "igd=warn,hyper=warn,tokio=warn";
    let filter = EnvFilter::try_new(format!("{},{}", level, quiet))
        .unwrap_or_else(|_| EnvFilter::new(format!("info,{}", quiet)));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_line_number(true)
                .with_ansi(true),
        )
        .with(filter)
        .init();
}
