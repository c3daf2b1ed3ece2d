//! Logging macros for the SDK.
//!
//! All SDK diagnostics go through `tracing` under the `supportkit` target so
//! hosts can filter them with `RUST_LOG=supportkit=debug` without pulling in
//! their own crate names.

#[doc(hidden)]
pub use tracing as __tracing;

/// Target every SDK log line is emitted under.
pub const LOG_TARGET: &str = "supportkit";

/// Install a `fmt` subscriber filtered by `RUST_LOG`, or by `default_filter`
/// when the variable is unset. Meant for binaries; libraries never call it.
pub fn init_tracing(default_filter: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    // A host may already have installed a subscriber.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Log an info message
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logging::__tracing::info!(target: $crate::logging::LOG_TARGET, $($arg)*)
    };
}

/// Log an error message
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::logging::__tracing::error!(target: $crate::logging::LOG_TARGET, $($arg)*)
    };
}

/// Log a warning message
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::logging::__tracing::warn!(target: $crate::logging::LOG_TARGET, $($arg)*)
    };
}

/// Log a debug message
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::logging::__tracing::debug!(target: $crate::logging::LOG_TARGET, $($arg)*)
    };
}
