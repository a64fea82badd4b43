//! Zero-OS kernel logging (`klog`).
//!
//! Profile-aware logging macros used by the network crates instead of
//! ungated prints.  The crate is a thin gate in front of the [`log`]
//! facade: filtering by hardening profile happens here, and the record
//! is then handed to whatever `log::Log` implementation the kernel (or a
//! test harness) installed.
//!
//! # Macro Overview
//!
//! | Macro | Release build | Profile-aware | Use case |
//! |-------|--------------|---------------|----------|
//! | [`kprintln!`] | Compiled out | No | Debug diagnostics |
//! | [`klog!`] | Active | Yes | Operational logging with level filter |
//! | [`klog_always!`] | Active | Secure-gated | Status messages |
//! | [`klog_force!`] | Active | No | Critical errors before a panic |
//!
//! # Hardening Profile Integration
//!
//! Log filtering is **runtime** and derived from the active profile.  The
//! boot path calls [`set_profile`]:
//!
//! - **Secure** : no output
//! - **Balanced**: `Error` + `Warn` only
//! - **Performance**: all levels
//!
//! The hot path is a single `Relaxed` atomic load + integer compare.

#![no_std]

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

// ============================================================================
// Log Levels
// ============================================================================

/// Severity level for [`klog!`] messages.
///
/// Ordered from least severe ([`Level::Trace`]) to most severe
/// ([`Level::Error`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    /// Extremely verbose tracing (compiled out in release).
    Trace = 0,
    /// Developer-oriented debug information (compiled out in release).
    Debug = 1,
    /// Normal operational information.
    Info = 2,
    /// Potential problems that merit attention.
    Warn = 3,
    /// Errors that affect correctness.
    Error = 4,
}

impl From<Level> for log::Level {
    fn from(level: Level) -> Self {
        match level {
            Level::Trace => log::Level::Trace,
            Level::Debug => log::Level::Debug,
            Level::Info => log::Level::Info,
            Level::Warn => log::Level::Warn,
            Level::Error => log::Level::Error,
        }
    }
}

// ============================================================================
// Profile Filter
// ============================================================================

/// Sentinel: all output suppressed.
const LEVEL_DISABLED: u8 = u8::MAX;

/// Runtime minimum level.  Messages with `level >= LOG_MIN_LEVEL` are emitted.
/// Initialised to DISABLED; the boot path must call [`set_profile`].
static LOG_MIN_LEVEL: AtomicU8 = AtomicU8::new(LEVEL_DISABLED);

/// Runtime gate for [`klog_always!`].  Fail-closed until [`set_profile`].
static LOG_ALWAYS_ENABLED: AtomicBool = AtomicBool::new(false);

/// Hardening profile identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KlogProfile {
    /// Maximum security, no klog output.
    Secure = 0,
    /// Balanced: errors and warnings only.
    Balanced = 1,
    /// Performance/debug: all levels.
    Performance = 2,
}

/// Set the klog filter from a profile.
///
/// Safe to call again if the profile changes at runtime.
#[inline]
pub fn set_profile(profile: KlogProfile) {
    let min = match profile {
        KlogProfile::Secure => LEVEL_DISABLED,
        KlogProfile::Balanced => Level::Warn as u8,
        KlogProfile::Performance => Level::Trace as u8,
    };
    LOG_MIN_LEVEL.store(min, Ordering::Release);
    LOG_ALWAYS_ENABLED.store(profile != KlogProfile::Secure, Ordering::Release);
}

/// Disable all klog output.  Does **not** affect [`klog_always!`].
#[inline]
pub fn disable() {
    LOG_MIN_LEVEL.store(LEVEL_DISABLED, Ordering::Release);
}

/// Returns `true` if a message at `level` would currently be emitted.
#[inline(always)]
pub fn enabled(level: Level) -> bool {
    level as u8 >= LOG_MIN_LEVEL.load(Ordering::Relaxed)
}

#[doc(hidden)]
#[inline(always)]
pub fn _klog_always_enabled() -> bool {
    LOG_ALWAYS_ENABLED.load(Ordering::Relaxed)
}

// ============================================================================
// Output Helpers (used by the macros, not public API)
// ============================================================================

#[doc(hidden)]
#[inline]
pub fn _klog_emit(level: Level, target: &'static str, args: core::fmt::Arguments) {
    log::logger().log(
        &log::Record::builder()
            .level(level.into())
            .target(target)
            .args(args)
            .build(),
    );
}

// ============================================================================
// Macros
// ============================================================================

/// Profile-gated status output.  Suppressed in [`KlogProfile::Secure`].
#[macro_export]
macro_rules! klog_always {
    ($($arg:tt)+) => {{
        if $crate::_klog_always_enabled() {
            $crate::_klog_emit($crate::Level::Info, module_path!(), format_args!($($arg)+));
        }
    }};
}

/// Unconditional output, never suppressed by any profile.
///
/// Only for messages that must appear right before a critical failure.
#[macro_export]
macro_rules! klog_force {
    ($($arg:tt)+) => {{
        $crate::_klog_emit($crate::Level::Error, module_path!(), format_args!($($arg)+));
    }};
}

/// Debug-only print, fully compiled out in release builds.
#[macro_export]
macro_rules! kprintln {
    ($($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        $crate::klog_always!($($arg)+);
    }};
}

/// Profile-aware kernel logging.
///
/// `Debug` and `Trace` are additionally compiled out in release builds.
///
/// ```ignore
/// klog!(Warn, "conn pool empty ({} in use)", used);
/// klog!(Debug, "tcp conn {} -> {:?}", id, state);
/// ```
#[macro_export]
macro_rules! klog {
    (Error, $($arg:tt)+) => {{
        if $crate::enabled($crate::Level::Error) {
            $crate::_klog_emit($crate::Level::Error, module_path!(), format_args!($($arg)+));
        }
    }};
    (Warn, $($arg:tt)+) => {{
        if $crate::enabled($crate::Level::Warn) {
            $crate::_klog_emit($crate::Level::Warn, module_path!(), format_args!($($arg)+));
        }
    }};
    (Info, $($arg:tt)+) => {{
        if $crate::enabled($crate::Level::Info) {
            $crate::_klog_emit($crate::Level::Info, module_path!(), format_args!($($arg)+));
        }
    }};
    (Debug, $($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        if $crate::enabled($crate::Level::Debug) {
            $crate::_klog_emit($crate::Level::Debug, module_path!(), format_args!($($arg)+));
        }
    }};
    (Trace, $($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        if $crate::enabled($crate::Level::Trace) {
            $crate::_klog_emit($crate::Level::Trace, module_path!(), format_args!($($arg)+));
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_filter() {
        set_profile(KlogProfile::Balanced);
        assert!(enabled(Level::Error));
        assert!(enabled(Level::Warn));
        assert!(!enabled(Level::Info));
        assert!(_klog_always_enabled());

        set_profile(KlogProfile::Secure);
        assert!(!enabled(Level::Error));
        assert!(!_klog_always_enabled());

        set_profile(KlogProfile::Performance);
        assert!(enabled(Level::Trace));
        disable();
        assert!(!enabled(Level::Error));
    }
}
