//! Subscriber setup shared by every portacc crate, test and benchmark.
//!
//! A [`TracingConfig`] starts from a [`Profile`] preset and may be adjusted
//! from `PORTACC_TRACING_*` and `PORTACC_PERF_*` variables, so queue,
//! copy-engine and kernel-launch diagnostics look the same everywhere. The
//! [`performance`] module and the exported macros provide the timing
//! instrumentation used by the backends.
//!
//! ```rust
//! use portacc_tracing::{LogFormat, Profile, TracingConfig};
//!
//! let mut config = TracingConfig::for_profile(Profile::Ci);
//! config.set_format(LogFormat::Compact);
//! let _subscriber = portacc_tracing::build_subscriber(&config).unwrap();
//! ```

pub mod performance;

#[macro_use]
pub mod macros;

use std::env;
use std::str::FromStr;

pub use tracing::{debug, error, info, trace, warn};

use tracing::Subscriber;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Crates raised to `debug` by the performance profile.
const WORKSPACE_CRATES: &[&str] = &["portacc_backends", "portacc_core", "portacc_tracing"];

/// Formatting layer handed out by [`subscriber_layers`].
pub type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Errors raised while configuring or installing a subscriber.
#[derive(Debug, thiserror::Error)]
pub enum TracingSetupError {
    #[error("invalid tracing filter `{directives}`: {message}")]
    InvalidFilter { directives: String, message: String },

    #[error("unknown {key} value `{value}`")]
    UnknownValue { key: &'static str, value: String },

    /// Usually another subscriber is already installed.
    #[error("failed to install the global subscriber: {0}")]
    SubscriberInit(#[from] TryInitError),
}

/// Preset a configuration starts from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Profile {
    /// Pretty, coloured output; timing events in debug builds.
    #[default]
    Local,
    /// JSON for log collectors, no timing events.
    Ci,
    /// JSON with span lifecycle events and `debug` for the workspace crates.
    Performance,
}

impl FromStr for Profile {
    type Err = TracingSetupError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Profile::Local),
            "ci" => Ok(Profile::Ci),
            "performance" | "perf" => Ok(Profile::Performance),
            _ => Err(TracingSetupError::UnknownValue {
                key: "tracing profile",
                value: value.to_string(),
            }),
        }
    }
}

/// Output format of the formatting layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = TracingSetupError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(LogFormat::Compact),
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(TracingSetupError::UnknownValue {
                key: "log format",
                value: value.to_string(),
            }),
        }
    }
}

/// Settings for [`performance::PerformanceSpan`] completion events.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PerfOptions {
    pub enabled: bool,
    /// Spans shorter than this many microseconds stay silent.
    pub threshold_us: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct TracingConfig {
    pub profile: Profile,
    /// `EnvFilter` directives. When unset, `RUST_LOG` applies, then
    /// [`fallback_filter`](Self::fallback_filter).
    pub filter: Option<String>,
    pub fallback_filter: String,
    /// Print event targets (module paths).
    pub show_targets: bool,
    pub ansi: bool,
    pub span_events: FmtSpan,
    pub format: LogFormat,
    pub perf: PerfOptions,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::for_profile(Profile::default())
    }
}

impl TracingConfig {
    pub fn for_profile(profile: Profile) -> Self {
        let ci = Self {
            profile,
            filter: None,
            fallback_filter: "info".to_string(),
            show_targets: true,
            ansi: false,
            span_events: FmtSpan::NONE,
            format: LogFormat::Json,
            perf: PerfOptions::default(),
        };
        match profile {
            Profile::Ci => ci,
            Profile::Local => Self {
                ansi: true,
                format: LogFormat::Pretty,
                perf: PerfOptions {
                    enabled: cfg!(debug_assertions),
                    threshold_us: None,
                },
                ..ci
            },
            Profile::Performance => Self {
                filter: Some(workspace_filter("debug")),
                span_events: FmtSpan::ENTER | FmtSpan::EXIT | FmtSpan::CLOSE,
                perf: PerfOptions {
                    enabled: true,
                    threshold_us: None,
                },
                ..ci
            },
        }
    }

    pub fn for_local() -> Self {
        Self::for_profile(Profile::Local)
    }

    pub fn for_ci() -> Self {
        Self::for_profile(Profile::Ci)
    }

    pub fn for_performance() -> Self {
        Self::for_profile(Profile::Performance)
    }

    /// Configuration from the process environment.
    ///
    /// | Variable | Effect |
    /// |---|---|
    /// | `PORTACC_TRACING_PROFILE` | `local` (default), `ci` or `performance` |
    /// | `PORTACC_TRACING_FILTER` | replaces the profile's filter directives |
    /// | `PORTACC_TRACING_FORMAT` | `pretty`, `compact` or `json` |
    /// | `PORTACC_PERF_TRACING` | `true`/`1`/`yes` enables timing events |
    /// | `PORTACC_PERF_THRESHOLD_US` | minimum span duration to report |
    ///
    /// Values that do not parse leave the profile's setting in place.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let profile = lookup("PORTACC_TRACING_PROFILE")
            .and_then(|value| value.parse().ok())
            .unwrap_or_default();
        let mut config = Self::for_profile(profile);

        if let Some(filter) = lookup("PORTACC_TRACING_FILTER").filter(|f| !f.trim().is_empty()) {
            config.filter = Some(filter);
        }
        if let Some(format) = lookup("PORTACC_TRACING_FORMAT").and_then(|value| value.parse().ok()) {
            config.set_format(format);
        }
        if let Some(flag) = lookup("PORTACC_PERF_TRACING") {
            config.perf.enabled = matches!(flag.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(threshold) = lookup("PORTACC_PERF_THRESHOLD_US").and_then(|value| value.trim().parse().ok()) {
            config.perf.threshold_us = Some(threshold);
        }
        config
    }

    /// Switch the output format; JSON never carries ANSI codes.
    pub fn set_format(&mut self, format: LogFormat) {
        self.format = format;
        if format == LogFormat::Json {
            self.ansi = false;
        }
    }

    fn env_filter(&self) -> Result<EnvFilter, TracingSetupError> {
        match &self.filter {
            Some(directives) => EnvFilter::try_new(directives).map_err(|err| TracingSetupError::InvalidFilter {
                directives: directives.clone(),
                message: err.to_string(),
            }),
            None => Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.fallback_filter))),
        }
    }
}

fn workspace_filter(level: &str) -> String {
    WORKSPACE_CRATES
        .iter()
        .map(|krate| format!("{krate}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Filter and formatting layer, for callers composing their own subscriber.
pub fn subscriber_layers(config: &TracingConfig) -> Result<(EnvFilter, BoxedLayer), TracingSetupError> {
    let filter = config.env_filter()?;
    let base = fmt::layer::<Registry>()
        .with_target(config.show_targets)
        .with_thread_names(true)
        .with_span_events(config.span_events.clone());
    let layer = match config.format {
        LogFormat::Compact => base.compact().with_ansi(config.ansi).boxed(),
        LogFormat::Pretty => base.pretty().with_ansi(config.ansi).boxed(),
        LogFormat::Json => base.json().with_ansi(false).boxed(),
    };
    Ok((filter, layer))
}

/// Subscriber for `config`; also applies its [`PerfOptions`].
pub fn build_subscriber(config: &TracingConfig) -> Result<impl Subscriber + Send + Sync, TracingSetupError> {
    let (filter, layer) = subscriber_layers(config)?;
    performance::set_performance_options(config.perf.enabled, config.perf.threshold_us);
    Ok(Registry::default().with(layer).with(filter))
}

/// Install the subscriber for `config` as the process-wide default.
pub fn init_global_tracing(config: &TracingConfig) -> Result<(), TracingSetupError> {
    build_subscriber(config)?.try_init()?;
    Ok(())
}

/// Quiet compact subscriber for tests; a no-op when one is installed.
pub fn init_test_tracing() {
    let mut config = TracingConfig {
        fallback_filter: "warn".to_string(),
        ..TracingConfig::for_ci()
    };
    config.set_format(LogFormat::Compact);
    if let Ok(subscriber) = build_subscriber(&config) {
        let _ = subscriber.try_init();
    }
}
