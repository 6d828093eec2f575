//! Broker configuration, loaded from TOML.
//!
//! Every section and every key has a default, so an empty document is a valid configuration.
//! Buffer sizes accept either an integer or a suffixed string such as `"10K"` or `"1M"`.
//!
//! ```toml
//! [selector]
//! selector_threads = 4
//!
//! [tcp]
//! server_read_buffer_size = "64K"
//! fragmentation_limit = 5
//!
//! [mqtt_sn]
//! predefined_topics = [{ id = 1, topic = "sensors/temperature" }]
//! ```
use serde::{Deserialize, Deserializer};
use std::path::Path;
use std::time::Duration;

use crate::error::{BrokerError, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub selector: SelectorConfig,
    pub tcp: TcpConfig,
    pub udp: UdpConfig,
    pub mqtt: MqttConfig,
    pub mqtt_sn: MqttSnConfig,
}

impl BrokerConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: BrokerConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.selector.selector_threads == 0 {
            return Err(BrokerError::Config(
                "selector.selector_threads must be at least 1".to_owned(),
            ));
        }
        if self.tcp.server_read_buffer_size == 0 || self.tcp.server_write_buffer_size == 0 {
            return Err(BrokerError::Config(
                "tcp server buffers must not be empty".to_owned(),
            ));
        }
        if self.udp.buffer_size == 0 {
            return Err(BrokerError::Config("udp.buffer_size must not be 0".to_owned()));
        }
        if self.tcp.coalesce_size == 0 {
            return Err(BrokerError::Config("tcp.coalesce_size must not be 0".to_owned()));
        }
        Ok(())
    }
}

/// Selector pool settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// Number of selector loops, each on its own thread.
    pub selector_threads: usize,
    /// Upper bound of one poller wait when no deferred task is due earlier.
    pub poll_interval_ms: u64,
    /// Bound of the wait for a registration change applied by the owning loop.
    pub registration_timeout_ms: u64,
    /// Requests drained per loop cycle, so sockets and timers are not starved.
    pub max_requests_per_cycle: usize,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            selector_threads: 2,
            poll_interval_ms: 10,
            registration_timeout_ms: 50,
            max_requests_per_cycle: 256,
        }
    }
}

impl SelectorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
    pub fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// SO_RCVBUF applied to accepted sockets.
    #[serde(deserialize_with = "deserialize_size")]
    pub receive_buffer_size: usize,
    /// SO_SNDBUF applied to accepted sockets.
    #[serde(deserialize_with = "deserialize_size")]
    pub send_buffer_size: usize,
    #[serde(deserialize_with = "deserialize_size")]
    pub server_read_buffer_size: usize,
    #[serde(deserialize_with = "deserialize_size")]
    pub server_write_buffer_size: usize,
    pub backlog: u32,
    pub read_delay_on_fragmentation_ms: u64,
    pub enable_read_delay_on_fragmentation: bool,
    /// Consecutive underflowing reads tolerated before read interest is paused.
    pub fragmentation_limit: u32,
    /// Initial upper bound of frames packed into one write.
    pub coalesce_size: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            receive_buffer_size: 128_000,
            send_buffer_size: 128_000,
            server_read_buffer_size: 10 * 1024,
            server_write_buffer_size: 10 * 1024,
            backlog: 100,
            read_delay_on_fragmentation_ms: 100,
            enable_read_delay_on_fragmentation: true,
            fragmentation_limit: 5,
            coalesce_size: 100,
        }
    }
}

impl TcpConfig {
    /// Zero when the fragmentation delay is disabled.
    pub fn read_delay(&self) -> Duration {
        if self.enable_read_delay_on_fragmentation {
            Duration::from_millis(self.read_delay_on_fragmentation_ms)
        } else {
            Duration::ZERO
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UdpConfig {
    /// Age after which a partially reassembled datagram is discarded.
    pub packet_reuse_timeout_ms: u64,
    #[serde(deserialize_with = "deserialize_size")]
    pub buffer_size: usize,
    /// Datagrams received per readiness event before yielding to other connections.
    pub max_datagrams_per_cycle: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            packet_reuse_timeout_ms: 1000,
            buffer_size: 1500,
            max_datagrams_per_cycle: 64,
        }
    }
}

impl UdpConfig {
    pub fn packet_reuse_timeout(&self) -> Duration {
        Duration::from_millis(self.packet_reuse_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Only `[0-9a-zA-Z]` client ids up to `max_client_id_len` characters are accepted.
    pub strict_client_id: bool,
    pub max_client_id_len: usize,
    pub min_keep_alive_secs: u16,
    pub max_keep_alive_secs: u16,
    /// Delay between a rejecting CONNACK and the close, so the reply is flushed first.
    pub close_delay_ms: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            strict_client_id: true,
            max_client_id_len: 23,
            min_keep_alive_secs: 0,
            max_keep_alive_secs: u16::MAX,
            close_delay_ms: 100,
        }
    }
}

impl MqttConfig {
    pub fn close_delay(&self) -> Duration {
        Duration::from_millis(self.close_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttSnConfig {
    pub gateway_id: u8,
    /// Peers silent for longer than this lose their gateway state.
    pub idle_session_timeout_secs: u64,
    /// Maximum number of topic ids registered per peer.
    pub max_registered_size: usize,
    pub predefined_topics: Vec<PredefinedTopic>,
}

impl Default for MqttSnConfig {
    fn default() -> Self {
        Self {
            gateway_id: 1,
            idle_session_timeout_secs: 600,
            max_registered_size: 1024,
            predefined_topics: Vec::new(),
        }
    }
}

impl MqttSnConfig {
    pub fn idle_session_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_session_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PredefinedTopic {
    pub id: u16,
    pub topic: String,
}

/// Parse "1500", "10K", "10KB", "2M", "1G" (binary multiples, case insensitive).
pub fn parse_size(text: &str) -> Result<usize> {
    let trimmed = text.trim();
    let upper = trimmed.to_ascii_uppercase();
    let digits = upper.strip_suffix('B').unwrap_or(&upper);
    let (number, multiplier) = match digits.chars().last() {
        Some('K') => (&digits[..digits.len() - 1], 1024usize),
        Some('M') => (&digits[..digits.len() - 1], 1024 * 1024),
        Some('G') => (&digits[..digits.len() - 1], 1024 * 1024 * 1024),
        _ => (digits, 1),
    };
    let value: usize = number
        .trim()
        .parse()
        .map_err(|_| BrokerError::Config(format!("invalid size: {trimmed:?}")))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| BrokerError::Config(format!("size overflows: {trimmed:?}")))
}

fn deserialize_size<'de, D>(deserializer: D) -> std::result::Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeValue {
        Number(usize),
        Text(String),
    }
    match SizeValue::deserialize(deserializer)? {
        SizeValue::Number(n) => Ok(n),
        SizeValue::Text(s) => parse_size(&s).map_err(serde::de::Error::custom),
    }
}
