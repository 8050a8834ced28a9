//! Configuration for the stream synchronizer and for big segment lookups.

use std::time::Duration;

use url::Url;

/// The default base URI of the streaming service.
pub const DEFAULT_STREAM_BASE_URL: &str = "https://stream.launchdarkly.com";

const STREAM_PATH: &str = "all";

/// Configuration for [crate::StreamProcessor].
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// # use launchdarkly_server_sdk_engine::StreamingConfig;
/// let config = StreamingConfig::new("sdk-key")
///     .with_base_url("https://stream.example.com/")
///     .with_initial_reconnect_delay(Duration::from_millis(500));
///
/// assert_eq!(
///     config.stream_url().unwrap().as_str(),
///     "https://stream.example.com/all"
/// );
/// ```
#[derive(Clone, Debug)]
pub struct StreamingConfig {
    pub(crate) sdk_key: String,
    pub(crate) base_url: String,
    pub(crate) initial_reconnect_delay: Duration,
    pub(crate) max_reconnect_delay: Duration,
    pub(crate) backoff_reset_interval: Duration,
    pub(crate) read_timeout: Duration,
}

impl StreamingConfig {
    /// Create a configuration with default settings for the given SDK key.
    pub fn new(sdk_key: impl Into<String>) -> Self {
        Self {
            sdk_key: sdk_key.into(),
            base_url: DEFAULT_STREAM_BASE_URL.to_owned(),
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            backoff_reset_interval: Duration::from_secs(60),
            read_timeout: Duration::from_secs(5 * 60),
        }
    }

    /// Set the base URL of the streaming service.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Set the delay before the first reconnect attempt. Later attempts back off exponentially from
    /// this value.
    pub fn with_initial_reconnect_delay(mut self, delay: Duration) -> Self {
        self.initial_reconnect_delay = delay;
        self
    }

    /// Set the upper bound for reconnect delays.
    pub fn with_max_reconnect_delay(mut self, delay: Duration) -> Self {
        self.max_reconnect_delay = delay;
        self
    }

    /// Set how long a connection has to stay healthy before the backoff starts over.
    pub fn with_backoff_reset_interval(mut self, interval: Duration) -> Self {
        self.backoff_reset_interval = interval;
        self
    }

    /// Set how long the stream may be silent before the connection is considered dead.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// The SDK key sent as the `Authorization` header.
    pub fn sdk_key(&self) -> &str {
        &self.sdk_key
    }

    /// The full URL of the flag data stream.
    pub fn stream_url(&self) -> Result<Url, url::ParseError> {
        let base = if self.base_url.ends_with('/') {
            Url::parse(&self.base_url)?
        } else {
            Url::parse(&format!("{}/", self.base_url))?
        };
        base.join(STREAM_PATH)
    }
}

/// Configuration for [crate::BigSegmentStoreWrapper].
#[derive(Clone, Debug)]
pub struct BigSegmentsConfig {
    pub(crate) stale_after: Duration,
}

impl BigSegmentsConfig {
    pub fn new() -> Self {
        Self {
            stale_after: Duration::from_secs(120),
        }
    }

    /// Set how old the store's last update may be before its data is reported as stale.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }
}

impl Default for BigSegmentsConfig {
    fn default() -> Self {
        Self::new()
    }
}
