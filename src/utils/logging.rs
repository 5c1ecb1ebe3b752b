//! Logging macros gated on a module-level `ENABLE_LOGS` const, so the
//! per-frame modules (run loop, frame source, regions) can be silenced without
//! touching `RUST_LOG` for the rest of the agent.
//!
//! State-changing errors go through `log::error!` directly and are never gated.

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::info!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::warn!($($arg)*);
        }
    };
}
