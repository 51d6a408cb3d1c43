//! Tracing subscriber setup.

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use crate::config::{LogFormat, LoggingSettings};

/// Crates that log connection chatter at `info` and below.
const NOISY_TARGETS: &[(&str, &str)] = &[("rumqttc", "warn"), ("rustls", "warn")];

/// Filter directives for a base level: the level itself plus overrides for
/// noisy dependencies.
#[must_use]
pub fn filter_directives(level: &str) -> String {
    std::iter::once(level.to_ascii_lowercase())
        .chain(NOISY_TARGETS.iter().map(|(target, lvl)| format!("{target}={lvl}")))
        .collect::<Vec<_>>()
        .join(",")
}

fn build_filter(settings: &LoggingSettings) -> EnvFilter {
    // RUST_LOG wins when set and valid.
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter_directives(&settings.level)))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber.
///
/// Returns false if a subscriber was already installed, in which case the
/// call has no effect.
pub fn init(settings: &LoggingSettings) -> bool {
    let filter = build_filter(settings);
    let registry = tracing_subscriber::registry().with(filter);

    let result = match settings.format {
        LogFormat::Compact => registry.with(fmt::layer().compact().with_target(true)).try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true).with_target(true))
            .try_init(),
    };
    result.is_ok()
}
