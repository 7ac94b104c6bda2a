//! Disconnect cause classification.
//!
//! Everything here is string matching against the extension runtime's error
//! text. The pattern lists are a heuristic and are expected to grow.

use std::time::Duration;

/// Errors after which the port can never work again without a rebuild.
pub const UNRECOVERABLE_PATTERNS: &[&str] = &[
    "Extension context invalidated",
    "Invalid extension id",
    "Extension not found",
    "net::ERR_FAILED",
    "net::ERR_INTERNET_DISCONNECTED",
];

/// Errors seen while the background worker is restarting or briefly absent.
pub const TRANSIENT_PATTERNS: &[&str] = &[
    "Receiving end does not exist",
    "message port closed before a response was received",
    "Could not establish connection",
    "Attempting to use a disconnected port object",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// No error text and the runtime id no longer resolves.
    RuntimeGone,
    Unrecoverable,
    /// A second disconnect arrived inside the flap window.
    Flapping,
    Transient,
    Unclassified,
}

impl Classification {
    pub fn is_context_invalidated(self) -> bool {
        matches!(
            self,
            Classification::RuntimeGone | Classification::Unrecoverable | Classification::Flapping
        )
    }
}

fn matches_any(text: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|pattern| text.contains(pattern))
}

/// `since_previous` is the gap to the previous disconnect, if there was one.
/// Open failures pass `None`.
pub fn classify_disconnect(
    error: Option<&str>,
    runtime_available: bool,
    since_previous: Option<Duration>,
    flap_window: Duration,
) -> Classification {
    if error.is_none() && !runtime_available {
        return Classification::RuntimeGone;
    }
    if error.is_some_and(|text| matches_any(text, UNRECOVERABLE_PATTERNS)) {
        return Classification::Unrecoverable;
    }
    if since_previous.is_some_and(|gap| gap < flap_window) {
        return Classification::Flapping;
    }
    if runtime_available && error.is_some_and(|text| matches_any(text, TRANSIENT_PATTERNS)) {
        return Classification::Transient;
    }
    Classification::Unclassified
}
