//! Domain-aware logging macros.
//!
//! Each macro injects a `domain` field automatically so callers never need
//! to remember the string literal. Domains: `sys`, `conn`, `pipe`, `task`,
//! `alert`, `conf`.
//!
//! ```ignore
//! td_info!(sys, tasks = n, "state restored");
//! td_warn!(alert, error = %e, topic = %id, "handler delivery failed");
//! ```
//!
//! The domain identifier is a bare identifier converted to a string by the
//! macro, not a string literal.

#[doc(hidden)]
#[macro_export]
macro_rules! td_log {
    ($level:ident, $domain:ident, $($field:tt)*) => {
        tracing::$level!(domain = stringify!($domain), $($field)*)
    };
}

/// Log at ERROR level with an automatic `domain` field.
#[macro_export]
macro_rules! td_error {
    ($domain:ident, $($rest:tt)*) => {
        $crate::td_log!(error, $domain, $($rest)*)
    };
}

/// Log at WARN level with an automatic `domain` field.
#[macro_export]
macro_rules! td_warn {
    ($domain:ident, $($rest:tt)*) => {
        $crate::td_log!(warn, $domain, $($rest)*)
    };
}

/// Log at INFO level with an automatic `domain` field.
#[macro_export]
macro_rules! td_info {
    ($domain:ident, $($rest:tt)*) => {
        $crate::td_log!(info, $domain, $($rest)*)
    };
}

/// Log at DEBUG level with an automatic `domain` field.
#[macro_export]
macro_rules! td_debug {
    ($domain:ident, $($rest:tt)*) => {
        $crate::td_log!(debug, $domain, $($rest)*)
    };
}

/// Log at TRACE level with an automatic `domain` field.
#[macro_export]
macro_rules! td_trace {
    ($domain:ident, $($rest:tt)*) => {
        $crate::td_log!(trace, $domain, $($rest)*)
    };
}
