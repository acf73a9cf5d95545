//! Logging for `PromptStrike`.
//!
//! The engine emits `tracing` events from every component; an
//! embedding application usually installs its own subscriber and the
//! engine simply logs through it. [`init_logging`] covers standalone
//! use: a stderr subscriber whose filter is resolved from
//! `PROMPTSTRIKE_LOG_LEVEL`, the configured baseline directive, and
//! an optional campaign-events-only mode that mutes per-probe
//! machinery.

use std::io::IsTerminal;

use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines with ANSI colors on a terminal.
    #[default]
    Human,
    /// Newline-delimited JSON with flattened event fields.
    Json,
}

/// Options for the engine's standalone subscriber.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Output format.
    pub format: LogFormat,

    /// Baseline filter directive applied when `PROMPTSTRIKE_LOG_LEVEL`
    /// is unset, e.g. `"info"` or `"promptstrike=debug"`.
    pub directive: String,

    /// Mute per-probe machinery (worker leases, queue sweeps, governor
    /// waits) below `warn`, leaving campaign-level events untouched.
    /// Useful when a large campaign would otherwise flood the log at
    /// `debug`.
    pub campaign_events_only: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            format: LogFormat::Human,
            directive: "info".to_string(),
            campaign_events_only: false,
        }
    }
}

/// Targets that trace per-probe machinery.
const PROBE_NOISE_TARGETS: [&str; 3] = [
    "promptstrike::executor",
    "promptstrike::queue",
    "promptstrike::governor",
];

/// Resolves the effective filter: environment override first, then the
/// configured baseline, then the probe-noise mutes on top.
fn resolve_filter(options: &LogOptions) -> EnvFilter {
    let mut filter = EnvFilter::try_from_env("PROMPTSTRIKE_LOG_LEVEL")
        .unwrap_or_else(|_| EnvFilter::new(&options.directive));

    if options.campaign_events_only {
        for target in PROBE_NOISE_TARGETS {
            if let Ok(directive) = format!("{target}=warn").parse::<Directive>() {
                filter = filter.add_directive(directive);
            }
        }
    }

    filter
}

/// Installs the engine's standalone subscriber on stderr.
///
/// Returns whether this call installed the global subscriber. `false`
/// means one was already active (an embedding application's, or a
/// previous call in the same process); the engine logs through the
/// active subscriber either way.
pub fn init_logging(options: &LogOptions) -> bool {
    let sink = tracing_subscriber::fmt()
        .with_env_filter(resolve_filter(options))
        .with_writer(std::io::stderr);

    match options.format {
        LogFormat::Human => sink
            .compact()
            .with_ansi(std::io::stderr().is_terminal())
            .try_init()
            .is_ok(),
        LogFormat::Json => sink.json().flatten_event(true).try_init().is_ok(),
    }
}
