use serde::{Deserialize, Serialize};

/// Feature set a backend implements.
///
/// Consistent semantics across backends make storage migrations safe; the
/// capability struct lets composing layers refuse features a backend
/// cannot honour instead of degrading silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCapabilities {
    pub delayed: bool,
    pub priority: bool,
    pub idempotency: bool,
    pub dead_letter: bool,
    pub lease_extend: bool,
    pub cancel: bool,
    pub rate_limits: bool,
}

impl QueueCapabilities {
    pub const fn full() -> Self {
        Self {
            delayed: true,
            priority: true,
            idempotency: true,
            dead_letter: true,
            lease_extend: true,
            cancel: true,
            rate_limits: true,
        }
    }
}
