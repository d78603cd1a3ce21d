//! Process-wide log output shared by every fortify binary.
//!
//! Each binary installs one `tracing` subscriber writing to stderr. The
//! level is `debug` when verbose was requested and `info` otherwise, and
//! `RUST_LOG` overrides both. Events are emitted inside a root span named
//! after the process tier so interleaved output from the launcher, shim
//! and init stays attributable.

use tracing::span::EnteredSpan;
use tracing_subscriber::EnvFilter;

/// Installs the subscriber and enters the root span for `tier`.
///
/// Keep the returned guard alive for the lifetime of the process. Calling
/// this more than once only re-enters a span; the first subscriber stays.
pub fn install(tier: &'static str, verbose: bool) -> EnteredSpan {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .try_init();
    tracing::info_span!("fortify", tier).entered()
}
