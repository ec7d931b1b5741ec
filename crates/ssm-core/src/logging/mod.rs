//! Structured logging for fit runs.
//!
//! Console output on stderr by default, JSON lines when asked for.
//!
//! ```ignore
//! use ssm_core::logging::{init_logging, LogConfig};
//!
//! init_logging(&LogConfig::from_env(fit_config.verbosity));
//! ```
//!
//! Every event emitted by the fit loop carries the `run_id` of its EM run,
//! an `event` name from [`event_names`] and a [`Stage`].

pub mod config;
pub mod events;

pub use config::{level_for, LogConfig};
pub use events::{event_names, Stage};

use std::io::IsTerminal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install a global subscriber.
///
/// `RUST_LOG` wins when set; otherwise this crate is filtered at
/// `config.level`. Returns false when a subscriber was already installed.
pub fn init_logging(config: &LogConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.directive()));
    let registry = tracing_subscriber::registry().with(filter);

    if config.json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()
            .is_ok()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .with_ansi(std::io::stderr().is_terminal()),
            )
            .try_init()
            .is_ok()
    }
}

/// Generate a unique id for one fit run.
pub fn generate_run_id() -> String {
    let uuid = uuid::Uuid::new_v4();
    // First 12 hex chars are plenty for correlating log lines.
    format!("run-{}", &uuid.simple().to_string()[..12])
}
