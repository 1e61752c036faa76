//! Logging infrastructure for forest observability.
//!
//! The crate uses `tracing` for structured logging. All events use target
//! "canopy" and include an `event` field for filtering.
//!
//! ## Library Integration
//!
//! The forest never initializes a global subscriber. Applications configure
//! tracing via `tracing_subscriber` or similar.
//!
//! ## Conventions
//!
//! - `event`: snake_case event name (required)
//! - `component`: module/subsystem (e.g., "forest", "pipeline")
//! - Use `%` for Display, `?` for Debug formatting
//! - Avoid high-cardinality fields without sampling

/// Target for all forest log events.
pub(crate) const CANOPY_TARGET: &str = "canopy";

/// Macro for info-level log events.
///
/// # Example
/// ```ignore
/// log_info!(
///     component = "forest",
///     event = "forest_open_complete",
///     tables = table_count,
/// );
/// ```
macro_rules! log_info {
    ($($field:tt)*) => {
        ::tracing::info!(target: $crate::observability::CANOPY_TARGET, $($field)*)
    };
}

/// Macro for debug-level log events.
macro_rules! log_debug {
    ($($field:tt)*) => {
        ::tracing::debug!(target: $crate::observability::CANOPY_TARGET, $($field)*)
    };
}

/// Macro for warn-level log events.
#[allow(unused_macros)]
macro_rules! log_warn {
    ($($field:tt)*) => {
        ::tracing::warn!(target: $crate::observability::CANOPY_TARGET, $($field)*)
    };
}

/// Macro for error-level log events.
#[allow(unused_macros)]
macro_rules! log_error {
    ($($field:tt)*) => {
        ::tracing::error!(target: $crate::observability::CANOPY_TARGET, $($field)*)
    };
}

pub(crate) use log_debug;
#[allow(unused_imports)]
pub(crate) use log_error;
pub(crate) use log_info;
#[allow(unused_imports)]
pub(crate) use log_warn;
