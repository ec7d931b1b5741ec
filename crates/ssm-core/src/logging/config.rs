//! Subscriber settings for fit runs.
//!
//! The level comes from the fit's [`Verbosity`]; `SSM_LOG` overrides it and
//! `SSM_LOG_FORMAT=json` switches to JSON lines.

use ssm_config::Verbosity;
use tracing_subscriber::filter::LevelFilter;

/// Level filter override for this crate.
pub const LOG_ENV: &str = "SSM_LOG";

/// `json` selects JSON lines, anything else the console format.
pub const LOG_FORMAT_ENV: &str = "SSM_LOG_FORMAT";

/// What [`super::init_logging`] installs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogConfig {
    pub level: LevelFilter,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::for_verbosity(Verbosity::default())
    }
}

/// `off` silences the crate, `quiet` keeps warnings, `loud` shows
/// per-iteration progress and `debug` shows per-step detail.
pub fn level_for(verbosity: Verbosity) -> LevelFilter {
    match verbosity {
        Verbosity::Off => LevelFilter::OFF,
        Verbosity::Quiet => LevelFilter::WARN,
        Verbosity::Loud => LevelFilter::INFO,
        Verbosity::Debug => LevelFilter::DEBUG,
    }
}

impl LogConfig {
    pub fn for_verbosity(verbosity: Verbosity) -> Self {
        Self {
            level: level_for(verbosity),
            json: false,
        }
    }

    /// [`Self::for_verbosity`] with the environment overrides applied.
    /// Unparseable values are ignored.
    pub fn from_env(verbosity: Verbosity) -> Self {
        Self::from_lookup(verbosity, |key| std::env::var(key).ok())
    }

    fn from_lookup(verbosity: Verbosity, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::for_verbosity(verbosity);
        if let Some(level) = lookup(LOG_ENV).and_then(|v| v.trim().parse::<LevelFilter>().ok()) {
            config.level = level;
        }
        if let Some(format) = lookup(LOG_FORMAT_ENV) {
            config.json = format.trim().eq_ignore_ascii_case("json");
        }
        config
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    /// `EnvFilter` directive scoping the level to this crate.
    pub fn directive(&self) -> String {
        format!("ssm_core={}", self.level)
    }
}
