//! Opt-in byte-count and connection event tracing

use std::fmt;
use tracing::debug;

/// Log target for wire-level debug events
pub const WIRE_TARGET: &str = "h2tunnel::wire";

/// Explicit debug toggle handed to every component that reports byte counts
///
/// When disabled every call is a no-op and the format arguments are never
/// rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebugSink {
    enabled: bool,
}

impl DebugSink {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn enabled() -> Self {
        Self::new(true)
    }

    pub fn disabled() -> Self {
        Self::new(false)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn read(&self, bytes: usize, from: &dyn fmt::Display) {
        if self.enabled {
            debug!(target: WIRE_TARGET, bytes, "Read {} bytes from {}", bytes, from);
        }
    }

    pub fn wrote(&self, bytes: usize, to: &dyn fmt::Display) {
        if self.enabled {
            debug!(target: WIRE_TARGET, bytes, "Wrote {} bytes to {}", bytes, to);
        }
    }

    pub fn event(&self, args: fmt::Arguments<'_>) {
        if self.enabled {
            debug!(target: WIRE_TARGET, "{}", args);
        }
    }
}
