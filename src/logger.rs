//! Tracing subscriber setup for the referee's verbose log stream.

use time::{format_description, UtcOffset};
use tracing::{subscriber::set_global_default, Level};
use tracing_subscriber::FmtSubscriber;

/// Install a global subscriber writing the referee log to stderr.
///
/// `verbose` raises the level from `INFO` to `TRACE` (per-turn decisions).
/// Does nothing if a global subscriber is already set, so tests can call it
/// repeatedly.
pub fn init_logger(verbose: bool) {
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    let timer = tracing_subscriber::fmt::time::OffsetTime::new(
        offset,
        format_description::parse("[year]-[month]-[day] [hour]:[minute]:[second]")
            .expect("valid time format description"),
    );

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if verbose { Level::TRACE } else { Level::INFO })
        .with_ansi(false)
        .with_timer(timer)
        .with_writer(std::io::stderr)
        .finish();

    let _ = set_global_default(subscriber);
}
