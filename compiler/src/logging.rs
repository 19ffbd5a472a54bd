//! Logging configuration for the Lumen compiler
//!
//! Thin setup layer over the `log` and `env_logger` crates. The macro
//! evaluator logs at these levels:
//!
//! - `error!` - actual failures that should always be shown
//! - `warn!` - suspicious macro behavior (e.g. redefined flags)
//! - `info!` - high-level progress (module registration, type loading)
//! - `debug!` - per-invocation detail (compilation, cache hits)
//! - `trace!` - very verbose (per-primitive dispatch)
//!
//! Set `RUST_LOG` to control output at runtime, e.g.
//! `RUST_LOG=compiler::interp=debug`.

use env_logger::Builder;
use log::LevelFilter;
use std::io::Write;
use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize logging with sensible defaults (Warn level).
///
/// Only initializes once; subsequent calls are no-ops.
pub fn init() {
    init_with_level(LevelFilter::Warn);
}

/// Initialize logging with a specific level.
///
/// Only initializes once; subsequent calls are no-ops.
pub fn init_with_level(level: LevelFilter) {
    INIT.call_once(|| {
        Builder::new()
            .filter_level(level)
            .format(|buf, record| {
                writeln!(
                    buf,
                    "[{:5}] {}:{} - {}",
                    record.level(),
                    record.file().unwrap_or("unknown"),
                    record.line().unwrap_or(0),
                    record.args()
                )
            })
            .init();
    });
}

/// Initialize logging from the RUST_LOG environment variable,
/// defaulting to Warn when unset.
pub fn init_from_env() {
    INIT.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    });
}

/// Initialize logging for tests; safe to call repeatedly.
pub fn init_test() {
    let _ = env_logger::builder()
        .filter_level(LevelFilter::Warn)
        .is_test(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_test();
        init_test();
    }
}
