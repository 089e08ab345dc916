//! `tracing` subscriber setup.
//!
//! Logs always go to stderr: stdout carries the progress display in the
//! main process and the JSON-lines protocol in cluster workers.
//!
//! Filter precedence: `RUST_LOG`, then `-v`, then `[logging] level`.

use std::io::{self, IsTerminal};
use tracing_subscriber::EnvFilter;

/// Directive string for our crate at `level`, everything else at `warn`.
pub fn default_directives(level: &str, verbose: bool) -> String {
    let level = if verbose { "debug" } else { level.trim() };
    let level = if level.is_empty() { "info" } else { level };
    format!("photo_manifest={level},warn")
}

/// Install the global subscriber. Calling it twice is a no-op.
///
/// Worker processes pass their index; their records carry the `worker`
/// span and are never colored.
pub fn init(level: &str, verbose: bool, worker: Option<usize>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level, verbose)));
    let ansi = worker.is_none() && io::stderr().is_terminal();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(ansi)
        .with_target(verbose)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_level_used() {
        assert_eq!(default_directives("trace", false), "photo_manifest=trace,warn");
    }

    #[test]
    fn verbose_wins_over_config() {
        assert_eq!(default_directives("warn", true), "photo_manifest=debug,warn");
    }

    #[test]
    fn blank_level_defaults_to_info() {
        assert_eq!(default_directives("  ", false), "photo_manifest=info,warn");
    }

    #[test]
    fn directives_parse() {
        assert!(EnvFilter::try_new(default_directives("info", false)).is_ok());
    }
}
