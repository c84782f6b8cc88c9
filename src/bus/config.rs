use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Broker connection settings for the event bus client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Broker address as `host` or `host:port` (port defaults to 1883).
    pub address: String,
    pub client_id: String,
    /// Inbound topic carrying emotion-classification events.
    pub topic: String,
    /// Outbound topic for decision changes; `None` disables republishing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub reconnect: ReconnectBackoff,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            address: "localhost:1883".to_string(),
            client_id: "drivestate".to_string(),
            topic: "driver/mood".to_string(),
            publish_topic: Some("drive.mode/2/0/4/8001".to_string()),
            username: None,
            password: None,
            reconnect: ReconnectBackoff::default(),
        }
    }
}

/// Exponential backoff schedule for broker reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectBackoff {
    pub base_ms: u64,
    pub cap_ms: u64,
    /// Jitter as a fraction of the computed delay, applied in both directions.
    pub jitter_factor: f64,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            cap_ms: 30_000,
            jitter_factor: 0.2,
        }
    }
}

impl ReconnectBackoff {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let raw = self.base_ms as f64 * 2.0_f64.powi(exponent as i32);
        let clamped = raw.min(self.cap_ms as f64);

        let jitter_range = clamped * self.jitter_factor;
        let jitter: f64 = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((clamped + jitter).max(0.0) as u64)
    }
}
