//! Link configuration.
//!
//! All timing knobs of the driver live here so that deployments can tune
//! them from a config file. Durations deserialize from human-readable
//! strings ("2s", "500ms") via `humantime-serde`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What discovery does when a validated candidate fails the subsequent
/// connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectPolicy {
    /// Discovery returns the connect error to the caller, who decides
    /// whether to re-invoke it.
    #[default]
    Manual,
    /// Discovery logs the failure and resumes enumerating/probing.
    Retry,
}

/// Tunable parameters of the serial link.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Baud rate for both probing and data traffic.
    pub baud_rate: u32,

    /// Upper bound on any single blocking read while streaming. Expiry is
    /// terminal for the session, so this must comfortably exceed one
    /// inter-frame gap at the slowest output data rate.
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,

    /// How long the probe waits after sending the handshake command before
    /// draining the response. The device needs this long to boot and reply;
    /// shortening it makes discovery miss real hardware.
    #[serde(with = "humantime_serde")]
    pub probe_settle: Duration,

    /// Window over which the probe drains whatever the device buffered.
    #[serde(with = "humantime_serde")]
    pub probe_drain_window: Duration,

    /// Idle period between enumeration passes when no ports exist at all.
    #[serde(with = "humantime_serde")]
    pub enumerate_backoff: Duration,

    /// Optional delay before the very first enumeration pass, for hosts
    /// where USB-serial adapters take a moment to register after boot.
    #[serde(with = "humantime_serde")]
    pub discovery_delay: Duration,

    /// Safety valve on the decoder's resync scan: at most this many reads
    /// are attempted per decode iteration before control returns to the
    /// streaming loop.
    pub max_skip_bytes: usize,

    /// Behavior after a failed connect during discovery.
    pub reconnect: ReconnectPolicy,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            read_timeout: Duration::from_secs(1),
            probe_settle: Duration::from_secs(2),
            probe_drain_window: Duration::from_millis(50),
            enumerate_backoff: Duration::from_secs(2),
            discovery_delay: Duration::ZERO,
            max_skip_bytes: 3000,
            reconnect: ReconnectPolicy::Manual,
        }
    }
}
