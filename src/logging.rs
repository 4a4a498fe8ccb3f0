//! Tracing subscriber setup for the CLI.
//!
//! `RUST_LOG` wins over `logging.default_level`. Output goes to stderr so
//! command output on stdout stays machine-readable.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Builds the filter: `RUST_LOG` if set and valid, otherwise `default_level`,
/// otherwise `warn`.
pub fn env_filter(config: &LoggingConfig, verbosity: u8) -> EnvFilter {
    match verbosity {
        0 => EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&config.default_level))
            .unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    }
}

/// Installs the global subscriber. Safe to call more than once; later calls
/// are ignored.
pub fn init(config: &LoggingConfig, verbosity: u8) {
    let filter = env_filter(config, verbosity);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    let result = if config.json {
        builder
            .json()
            .with_thread_names(true)
            .try_init()
    } else {
        builder.try_init()
    };
    if result.is_err() {
        tracing::debug!("[logging] subscriber already installed");
    }
}
