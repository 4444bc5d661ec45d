//! Logging configuration for the scheduler
//!
//! Helpers for initializing the `log` facade with `env_logger`.
//!
//! # Usage
//!
//! ```rust,ignore
//! use scheduler::logging;
//!
//! // Initialize with default level (Warn)
//! logging::init();
//!
//! // Or initialize from RUST_LOG environment variable
//! logging::init_from_env();
//! ```
//!
//! # Log Levels
//!
//! - `info!` - One summary line per scheduled unit
//! - `debug!` - Per-phase progress (liveness, dead operations, verification)
//! - `trace!` - Every placement decision and every block order
//!
//! Filter by phase to follow a single decision:
//!
//! ```bash
//! RUST_LOG=scheduler::schedule::latest=trace cargo test diamond
//! ```

use env_logger::Builder;
use log::LevelFilter;
use std::io::Write;
use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize logging at Warn level.
///
/// This only initializes once; subsequent calls are no-ops.
pub fn init() {
    init_with_level(LevelFilter::Warn);
}

/// Initialize logging with a specific level.
///
/// This only initializes once; subsequent calls are no-ops.
pub fn init_with_level(level: LevelFilter) {
    INIT.call_once(|| {
        Builder::new()
            .filter_level(level)
            .format(|buf, record| {
                writeln!(
                    buf,
                    "[{:5}] {} - {}",
                    record.level(),
                    record.target(),
                    record.args()
                )
            })
            .init();
    });
}

/// Initialize logging from the RUST_LOG environment variable, Warn if unset.
pub fn init_from_env() {
    INIT.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    });
}

/// Initialize logging for tests.
///
/// Output is captured by the test harness and stays quiet unless RUST_LOG
/// asks for more.
pub fn init_test() {
    // try_init() doesn't panic if already initialized
    let _ = env_logger::builder()
        .parse_env(env_logger::Env::default().default_filter_or("warn"))
        .is_test(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_test_is_idempotent() {
        init_test();
        init_test();
        log::trace!("scheduler logging ready");
    }
}
