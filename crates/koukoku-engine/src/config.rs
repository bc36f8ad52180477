use std::time::Duration;

use koukoku_core::errors::EngineError;

pub const DEFAULT_HOST: &str = "koukoku.shadan.open.ad.jp";
pub const DEFAULT_PORT: u16 = 992;

/// How a self-echo settles sends awaiting confirmation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EchoPolicy {
    /// Only the oldest awaiting send with the same text.
    #[default]
    Single,
    /// The oldest match and every send queued after it.
    MatchAndYounger,
}

/// Engine tunables. `Default` matches the remote service's expectations.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub host: String,
    pub port: u16,
    /// Line written once after every connect.
    pub identification: String,
    pub keepalive_interval: Duration,
    /// Minimum gap between two dequeued writes.
    pub pacing_interval: Duration,
    /// Delay before re-checking an empty send queue.
    pub idle_interval: Duration,
    /// Silence required before buffered broadcast lines are parsed.
    pub quiet_period: Duration,
    pub echo_policy: EchoPolicy,
    /// `None` waits for an echo forever.
    pub echo_timeout: Option<Duration>,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// Cap for each inbound accumulator.
    pub max_buffer_bytes: usize,
    /// Capacity of the public event channel.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.into(),
            port: DEFAULT_PORT,
            identification: "nobody".into(),
            keepalive_interval: Duration::from_millis(15_000),
            pacing_interval: Duration::from_millis(992),
            idle_interval: Duration::from_millis(3_000),
            quiet_period: Duration::from_millis(125),
            echo_policy: EchoPolicy::Single,
            echo_timeout: None,
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(60),
            max_buffer_bytes: 64 * 1024,
            event_capacity: 256,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.host.trim().is_empty() {
            return Err(EngineError::InvalidHost(self.host.clone()));
        }
        if self.identification.contains(['\r', '\n']) {
            return Err(EngineError::InvalidConfig(
                "identification must be a single line".into(),
            ));
        }
        let timers = [
            ("keepalive_interval", self.keepalive_interval),
            ("pacing_interval", self.pacing_interval),
            ("idle_interval", self.idle_interval),
            ("quiet_period", self.quiet_period),
            ("reconnect_base_delay", self.reconnect_base_delay),
        ];
        for (name, value) in timers {
            if value.is_zero() {
                return Err(EngineError::InvalidConfig(format!("{name} must be non-zero")));
            }
        }
        if self.reconnect_max_delay < self.reconnect_base_delay {
            return Err(EngineError::InvalidConfig(
                "reconnect_max_delay is shorter than reconnect_base_delay".into(),
            ));
        }
        if matches!(self.echo_timeout, Some(t) if t.is_zero()) {
            return Err(EngineError::InvalidConfig("echo_timeout must be non-zero".into()));
        }
        if self.max_buffer_bytes == 0 || self.event_capacity == 0 {
            return Err(EngineError::InvalidConfig(
                "buffer and channel sizes must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.port, 992);
        assert_eq!(config.pacing_interval, Duration::from_millis(992));
        assert_eq!(config.echo_policy, EchoPolicy::Single);
        assert!(config.echo_timeout.is_none());
    }

    #[test]
    fn rejects_empty_host() {
        let config = EngineConfig {
            host: " ".into(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::InvalidHost(_))));
    }

    #[test]
    fn rejects_zero_timers() {
        let config = EngineConfig {
            keepalive_interval: Duration::ZERO,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("keepalive_interval"));
    }

    #[test]
    fn rejects_multiline_identification() {
        let config = EngineConfig {
            identification: "nobody\r\nping".into(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_inverted_backoff() {
        let config = EngineConfig {
            reconnect_base_delay: Duration::from_secs(10),
            reconnect_max_delay: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
