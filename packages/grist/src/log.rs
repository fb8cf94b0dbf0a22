//! Logging wiring for driver embeddings.

use clap::ValueEnum;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::LevelFilter, layer::SubscriberExt as _,
    util::SubscriberInitExt as _,
};

/// Verbosity accepted by `--log`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    /// Alias for the most severe level tracing offers.
    Critical,
}

impl LogLevel {
    fn filter(self) -> LevelFilter {
        match self {
            Self::Debug => LevelFilter::DEBUG,
            Self::Info => LevelFilter::INFO,
            Self::Warning => LevelFilter::WARN,
            Self::Error | Self::Critical => LevelFilter::ERROR,
        }
    }
}

/// Install the subscriber for a build-script run.
///
/// The `GRIST_LOG` environment variable overrides the `--log` floor with a
/// full filter directive. Installation is best-effort: a script that set up
/// its own subscriber keeps it.
pub fn init(level: LogLevel) {
    let filter = EnvFilter::builder()
        .with_env_var("GRIST_LOG")
        .with_default_directive(level.filter().into())
        .from_env_lossy();
    let _ = tracing_subscriber::registry()
        .with(ErrorLayer::default())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_filter(filter),
        )
        .try_init();
}
