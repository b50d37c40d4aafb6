//! Process-wide initialization of structured logging.
//!
//! Logging is configured from the environment:
//! * `TRACING_FILTER_DIRECTIVE` - an `EnvFilter` directive, `info` when unset.
//! * `LOGGING_FORMATTER` - one of `full`, `compact`, `pretty` or `json`, `pretty` when unset.
//! * `LOGGING_ANSI_ENABLED` - `true` or `false`, `false` when unset.
use serde::Deserialize;
use snafu::ResultExt;
use std::env;
use tracing::Subscriber;
use tracing_subscriber::{filter::LevelFilter, fmt, layer::SubscriberExt, EnvFilter, Registry};

const DEFAULT_TRACING_FILTER_DIRECTIVE: LevelFilter = LevelFilter::INFO;

const TRACING_FILTER_DIRECTIVE_ENV_VAR: &str = "TRACING_FILTER_DIRECTIVE";
const LOGGING_FORMATTER_ENV_VAR: &str = "LOGGING_FORMATTER";
const LOGGING_ANSI_ENABLED_ENV_VAR: &str = "LOGGING_ANSI_ENABLED";

/// The message format for logging tracing events.
///
/// See https://docs.rs/tracing-subscriber/latest/tracing_subscriber/fmt/format/index.html
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    /// Human-readable, single-line logs for each event.
    Full,
    /// A variant of the default formatter optimized for short line lengths.
    Compact,
    #[default]
    /// Pretty-formatted multi-line logs optimized for human readability.
    Pretty,
    /// Newline-delimited JSON logs.
    Json,
}

/// Logging settings, resolved from environment-like key lookups.
#[derive(Clone, Debug, Eq, PartialEq, Default)]
pub struct LogSettings {
    pub message_format: MessageFormat,
    pub ansi_enabled: bool,
}

impl LogSettings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Resolves settings using `lookup` in place of the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let message_format = match lookup(LOGGING_FORMATTER_ENV_VAR) {
            Some(formatter) => serde_plain::from_str(&formatter.to_lowercase())
                .context(error::LogFormatterEnvSnafu {
                    env_value: formatter,
                })?,
            None => MessageFormat::default(),
        };

        let ansi_enabled = match lookup(LOGGING_ANSI_ENABLED_ENV_VAR) {
            Some(ansi_enabled) => ansi_enabled
                .to_lowercase()
                .parse()
                .context(error::LogAnsiEnvSnafu {
                    env_value: ansi_enabled,
                })?,
            None => false,
        };

        Ok(LogSettings {
            message_format,
            ansi_enabled,
        })
    }

    /// Adds a formatting layer to a tracing event subscriber.
    fn add_format_layer<S>(&self, event_subscriber: S) -> Box<dyn Subscriber + Send + Sync>
    where
        S: SubscriberExt + Send + Sync + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    {
        // Each formatter is a distinct layer type, so the whole subscriber is boxed per arm.
        let layer = fmt::layer().with_ansi(self.ansi_enabled);
        match self.message_format {
            MessageFormat::Full => Box::new(event_subscriber.with(layer)),
            MessageFormat::Compact => Box::new(event_subscriber.with(layer.compact())),
            MessageFormat::Pretty => Box::new(event_subscriber.with(layer.pretty())),
            MessageFormat::Json => Box::new(event_subscriber.with(layer.json())),
        }
    }
}

/// Installs the global tracing subscriber according to the environment.
pub fn init_telemetry_from_env() -> Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(DEFAULT_TRACING_FILTER_DIRECTIVE.into())
        .with_env_var(TRACING_FILTER_DIRECTIVE_ENV_VAR)
        .from_env_lossy();

    let subscriber = Registry::default().with(env_filter);
    let subscriber = LogSettings::from_env()?.add_format_layer(subscriber);

    tracing::subscriber::set_global_default(subscriber)
        .context(error::TracingConfigurationSnafu)?;

    Ok(())
}

pub mod error {
    use std::str::ParseBoolError;

    use super::*;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum TelemetryConfigError {
        #[snafu(display("Error configuring tracing: '{}'", source))]
        TracingConfiguration {
            source: tracing::subscriber::SetGlobalDefaultError,
        },

        #[snafu(display(
            "Could not parse formatter from environment variable '{}={}': '{}'",
            LOGGING_FORMATTER_ENV_VAR,
            env_value,
            source
        ))]
        LogFormatterEnv {
            source: serde_plain::Error,
            env_value: String,
        },

        #[snafu(display(
            "Could not parse ANSI enablement from environment variable '{}={}': '{}'",
            LOGGING_ANSI_ENABLED_ENV_VAR,
            env_value,
            source
        ))]
        LogAnsiEnv {
            source: ParseBoolError,
            env_value: String,
        },
    }
}

type Result<T> = std::result::Result<T, TelemetryConfigError>;
pub use error::TelemetryConfigError;
