#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};

use crate::types::Channel;

const DEFAULT_DIAL_TIMEOUT_DURATION: Duration = Duration::from_secs(10);
const DEFAULT_WRITE_TIMEOUT_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_WRITE_BUFFER: usize = 256;
const DEFAULT_READ_BUFFER: usize = 1024;
const DEFAULT_MISSED_PONG_TOLERANCE: u32 = 1;
const DEFAULT_MAX_TOPIC_ARGS: usize = 100;
const DEFAULT_INITIAL_BACKOFF_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF_DURATION: Duration = Duration::from_secs(60);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
const DEFAULT_RANDOMIZATION_FACTOR: f64 = 0.5;

/// Configuration for WebSocket client behavior.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Config {
    /// Upper bound on opening the socket and receiving the welcome frame
    pub dial_timeout: Duration,
    /// Timeout applied to subscribe and unsubscribe requests
    pub write_timeout: Duration,
    /// Capacity of the outbound queue; writers suspend when it is full
    pub write_buffer: usize,
    /// Capacity of each subscription's delivery buffer
    pub read_buffer: usize,
    /// Overrides the token's ping interval
    pub heartbeat_interval: Option<Duration>,
    /// Overrides the token's ping timeout
    pub heartbeat_timeout: Option<Duration>,
    /// Consecutive missed PONGs tolerated before the connection is declared dead
    pub missed_pong_tolerance: u32,
    /// Maximum number of comma-joined args in one wire subscription
    pub max_topic_args: usize,
    /// Whether subscriptions are issued on the private channel
    pub channel: Channel,
    /// Reconnection strategy configuration
    pub reconnect: ReconnectConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT_DURATION,
            write_timeout: DEFAULT_WRITE_TIMEOUT_DURATION,
            write_buffer: DEFAULT_WRITE_BUFFER,
            read_buffer: DEFAULT_READ_BUFFER,
            heartbeat_interval: None,
            heartbeat_timeout: None,
            missed_pong_tolerance: DEFAULT_MISSED_PONG_TOLERANCE,
            max_topic_args: DEFAULT_MAX_TOPIC_ARGS,
            channel: Channel::Public,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Config {
    /// Configuration for a private-channel connection.
    #[must_use]
    pub fn private() -> Self {
        Self {
            channel: Channel::Private,
            ..Self::default()
        }
    }
}

/// Configuration for automatic reconnection behavior.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of consecutive failed rounds before giving up.
    /// `None` means infinite retries.
    pub max_attempts: Option<u32>,
    /// Initial backoff duration for first reconnection attempt
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Jitter applied to every delay, as a fraction of the delay
    pub randomization_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None, // Infinite reconnection by default
            initial_backoff: DEFAULT_INITIAL_BACKOFF_DURATION,
            max_backoff: DEFAULT_MAX_BACKOFF_DURATION,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            randomization_factor: DEFAULT_RANDOMIZATION_FACTOR,
        }
    }
}

impl From<ReconnectConfig> for ExponentialBackoff {
    fn from(config: ReconnectConfig) -> Self {
        ExponentialBackoffBuilder::default()
            .with_initial_interval(config.initial_backoff)
            .with_max_interval(config.max_backoff)
            .with_multiplier(config.backoff_multiplier)
            .with_randomization_factor(config.randomization_factor)
            .with_max_elapsed_time(None) // We handle max attempts separately
            .build()
    }
}
