//! Runtime settings shared by both bridge endpoints.

use std::time::Duration;

use crate::frame::DEFAULT_MAX_MESSAGE_SIZE;

/// Timing and framing limits for one bridge endpoint.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Deadline for a host → sandbox engine call.
    pub call_timeout: Duration,
    /// Deadline for a sandbox → host storage call.
    pub storage_timeout: Duration,
    /// How long the host waits for the sandbox's `ready` signal.
    pub ready_timeout: Duration,
    /// Maximum size of one framed message in bytes.
    pub max_message_size: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            storage_timeout: Duration::from_secs(10),
            ready_timeout: Duration::from_secs(10),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}
