// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Client configuration.

use crate::client::failure::FailMode;
use crate::client::router::{HashAlgorithm, RouterKind};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Maximum number of calls queued per server while it is connecting.
pub const DEFAULT_PENDING_SIZE: usize = 10000;
/// Delay between a graceful stop and closing every mailbox.
pub const DEFAULT_GRACE_TIMEOUT: Duration = Duration::from_millis(3000);
/// Failsafe retries per call.
pub const DEFAULT_RETRY_TIMES: u32 = 3;
/// Failsafe backoff unit.
pub const DEFAULT_RETRY_CONNECT_TIME: Duration = Duration::from_millis(5000);
/// Reply deadline of a request.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10000);
/// Flush period of a buffering mailbox.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(50);
/// Smallest non-zero keepalive idle time. The socket option has whole-second granularity.
pub const MIN_KEEPALIVE: Duration = Duration::from_secs(1);
/// TCP keepalive idle time.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_millis(10000);
/// Ring positions per node.
pub const DEFAULT_REPLICAS: usize = 100;

/// Invalid configuration values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A setting that must be positive is zero.
    #[error("`{0}` should be greater than zero")]
    Zero(&'static str),
    /// A duration is below the smallest value the transport accepts.
    #[error("`{field}` should be zero or at least {min:?}")]
    TooShort {
        /// Offending setting.
        field: &'static str,
        /// Smallest accepted non-zero value.
        min: Duration,
    },
    /// The configuration could not be parsed.
    #[error("invalid client config: {0}")]
    Parse(String),
}

/// Settings shared by the mail station, its mailboxes, the router and the failure processor.
///
/// Deserializes from camelCase JSON with durations in milliseconds, every field optional:
///
/// ```
/// let config = mailrpc::ClientConfig::from_json(r#"{"failMode": "failover", "bufferMsg": true, "interval": 20}"#).unwrap();
/// assert!(config.buffer_msg);
/// assert_eq!(config.interval, std::time::Duration::from_millis(20));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    /// How dispatch failures are handled.
    pub fail_mode: FailMode,
    /// Failsafe retries per call.
    pub retry_times: u32,
    /// Failsafe backoff unit; the n-th retry waits n times this.
    #[serde(with = "millis")]
    pub retry_connect_time: Duration,
    /// Calls queued per server while it connects.
    pub pending_size: usize,
    /// Batch outgoing messages and flush them every `interval`.
    pub buffer_msg: bool,
    /// Flush period when `buffer_msg` is set.
    #[serde(with = "millis")]
    pub interval: Duration,
    /// Default reply deadline.
    #[serde(with = "millis")]
    pub timeout: Duration,
    /// TCP keepalive idle time.
    #[serde(with = "millis")]
    pub keepalive: Duration,
    /// Delay before a graceful stop closes the mailboxes.
    #[serde(with = "millis")]
    pub grace_timeout: Duration,
    /// Largest frame payload accepted or sent. `None` means unlimited.
    pub pkg_size: Option<usize>,
    /// Strategy used by `RpcClient::invoke`.
    pub router: RouterKind,
    /// Ring positions per node for consistent hashing.
    pub replicas: usize,
    /// Digest used by the hash ring.
    pub algorithm: HashAlgorithm,
    /// Index of the argument used as consistent hash key. The whole message is hashed when unset
    /// or out of range.
    pub hash_field_index: Option<usize>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            fail_mode: FailMode::default(),
            retry_times: DEFAULT_RETRY_TIMES,
            retry_connect_time: DEFAULT_RETRY_CONNECT_TIME,
            pending_size: DEFAULT_PENDING_SIZE,
            buffer_msg: false,
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            keepalive: DEFAULT_KEEPALIVE,
            grace_timeout: DEFAULT_GRACE_TIMEOUT,
            pkg_size: None,
            router: RouterKind::default(),
            replicas: DEFAULT_REPLICAS,
            algorithm: HashAlgorithm::default(),
            hash_field_index: None,
        }
    }
}

impl ClientConfig {
    /// Returns the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON document and validates it.
    pub fn from_json(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the settings that must be positive.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pending_size == 0 {
            return Err(ConfigError::Zero("pendingSize"));
        }
        if self.replicas == 0 {
            return Err(ConfigError::Zero("replicas"));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::Zero("timeout"));
        }
        if self.buffer_msg && self.interval.is_zero() {
            return Err(ConfigError::Zero("interval"));
        }
        if !self.keepalive.is_zero() && self.keepalive < MIN_KEEPALIVE {
            return Err(ConfigError::TooShort {
                field: "keepalive",
                min: MIN_KEEPALIVE,
            });
        }
        Ok(())
    }

    /// Sets the failure mode.
    /// Default is [`FailMode::FailFast`].
    pub fn with_fail_mode(mut self, fail_mode: FailMode) -> Self {
        self.fail_mode = fail_mode;
        self
    }

    /// Sets the failsafe retries per call.
    /// Default is 3.
    pub fn with_retry_times(mut self, retry_times: u32) -> Self {
        self.retry_times = retry_times;
        self
    }

    /// Sets the failsafe backoff unit.
    /// Default is 5s.
    pub fn with_retry_connect_time(mut self, retry_connect_time: Duration) -> Self {
        self.retry_connect_time = retry_connect_time;
        self
    }

    /// Sets how many calls may wait per connecting server.
    /// Default is 10000.
    pub fn with_pending_size(mut self, pending_size: usize) -> Self {
        self.pending_size = pending_size;
        self
    }

    /// Enables micro-batching of outgoing messages.
    /// Default is false.
    pub fn with_buffer_msg(mut self, buffer_msg: bool) -> Self {
        self.buffer_msg = buffer_msg;
        self
    }

    /// Sets the flush period of buffered messages.
    /// Default is 50ms.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the default reply deadline.
    /// Default is 10s.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the TCP keepalive idle time. Zero turns keepalive off, other values must be at least 1s.
    /// Default is 10s.
    pub fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Sets the delay between a graceful stop and closing the mailboxes.
    /// Default is 3s.
    pub fn with_grace_timeout(mut self, grace_timeout: Duration) -> Self {
        self.grace_timeout = grace_timeout;
        self
    }

    /// Sets the largest frame payload.
    /// Default is unlimited.
    pub fn with_pkg_size(mut self, pkg_size: Option<usize>) -> Self {
        self.pkg_size = pkg_size;
        self
    }

    /// Sets the router strategy used by `invoke`.
    /// Default is [`RouterKind::Random`].
    pub fn with_router(mut self, router: RouterKind) -> Self {
        self.router = router;
        self
    }

    /// Sets the ring positions per node.
    /// Default is 100.
    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }

    /// Sets the hash ring digest.
    /// Default is [`HashAlgorithm::Md5`].
    pub fn with_algorithm(mut self, algorithm: HashAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Sets the argument index used as consistent hash key.
    /// Default is unset.
    pub fn with_hash_field_index(mut self, hash_field_index: Option<usize>) -> Self {
        self.hash_field_index = hash_field_index;
        self
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.pending_size, 10000);
        assert_eq!(config.grace_timeout, Duration::from_secs(3));
        assert_eq!(config.retry_times, 3);
        assert_eq!(config.replicas, 100);
        assert_eq!(config.fail_mode, FailMode::FailFast);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_camel_case() {
        let config = ClientConfig::from_json(
            r#"{"failMode":"failsafe","retryTimes":2,"retryConnectTime":100,"router":"ch","algorithm":"sha256","hashFieldIndex":0,"pkgSize":1024}"#,
        )
        .unwrap();
        assert_eq!(config.fail_mode, FailMode::FailSafe);
        assert_eq!(config.retry_connect_time, Duration::from_millis(100));
        assert_eq!(config.router, RouterKind::ConsistentHash);
        assert_eq!(config.algorithm, HashAlgorithm::Sha256);
        assert_eq!(config.hash_field_index, Some(0));
        assert_eq!(config.pkg_size, Some(1024));
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn rejects_zero_sizes() {
        assert_eq!(ClientConfig::from_json(r#"{"pendingSize":0}"#), Err(ConfigError::Zero("pendingSize")));
        assert_eq!(ClientConfig::default().with_buffer_msg(true).with_interval(Duration::ZERO).validate(), Err(ConfigError::Zero("interval")));
    }

    #[test]
    fn keepalive_is_off_or_at_least_a_second() {
        assert!(ClientConfig::default().with_keepalive(Duration::ZERO).validate().is_ok());
        assert!(ClientConfig::default().with_keepalive(Duration::from_secs(1)).validate().is_ok());
        assert_eq!(
            ClientConfig::from_json(r#"{"keepalive":500}"#),
            Err(ConfigError::TooShort {
                field: "keepalive",
                min: Duration::from_secs(1)
            })
        );
    }
}
