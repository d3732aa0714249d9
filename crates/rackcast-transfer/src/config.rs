//! Bridge configuration: defaults plus `RACKCAST_*` environment overrides.

use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;

use crate::error::BridgeError;
use crate::osc::EMPTY_BUNDLE_SIZE;
use crate::registry::RegistryConfig;
use crate::transfer::MAX_SENDS;

/// Port the companion listens on.
pub const DEFAULT_TX_PORT: u16 = 7746;
/// Port we listen on (first candidate).
pub const DEFAULT_RX_PORT: u16 = 7225;
pub const DEFAULT_MAX_BIND_RETRIES: u16 = 10;
/// Scratch buffer size; one datagram never exceeds it.
pub const DEFAULT_DATAGRAM_CAPACITY: usize = 1452;
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(200);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_MAX_MISSED_HEARTBEATS: u32 = 5;

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM_CAPACITY: usize = 65_507;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub bind_addr: IpAddr,
    pub tx_port: u16,
    pub rx_port: u16,
    pub max_bind_retries: u16,
    pub broadcast_addr: IpAddr,
    pub datagram_capacity: usize,
    pub retry_interval: Duration,
    pub max_sends: u8,
    pub heartbeat_interval: Duration,
    pub max_missed_heartbeats: u32,
    pub chunk_post_send_delay: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            tx_port: DEFAULT_TX_PORT,
            rx_port: DEFAULT_RX_PORT,
            max_bind_retries: DEFAULT_MAX_BIND_RETRIES,
            broadcast_addr: IpAddr::V4(Ipv4Addr::BROADCAST),
            datagram_capacity: DEFAULT_DATAGRAM_CAPACITY,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            max_sends: MAX_SENDS,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_missed_heartbeats: DEFAULT_MAX_MISSED_HEARTBEATS,
            chunk_post_send_delay: Duration::ZERO,
        }
    }
}

impl BridgeConfig {
    /// Defaults overridden by whatever `RACKCAST_*` variables are set.
    pub fn from_env() -> Result<Self, BridgeError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, BridgeError> {
        let d = Self::default();
        let config = Self {
            bind_addr: parse_var(&lookup, "RACKCAST_BIND_ADDR", d.bind_addr)?,
            tx_port: parse_var(&lookup, "RACKCAST_TX_PORT", d.tx_port)?,
            rx_port: parse_var(&lookup, "RACKCAST_RX_PORT", d.rx_port)?,
            max_bind_retries: parse_var(&lookup, "RACKCAST_MAX_BIND_RETRIES", d.max_bind_retries)?,
            broadcast_addr: parse_var(&lookup, "RACKCAST_BROADCAST_ADDR", d.broadcast_addr)?,
            datagram_capacity: parse_var(&lookup, "RACKCAST_DATAGRAM_CAPACITY", d.datagram_capacity)?,
            retry_interval: parse_millis(&lookup, "RACKCAST_RETRY_INTERVAL_MS", d.retry_interval)?,
            max_sends: parse_var(&lookup, "RACKCAST_MAX_SENDS", d.max_sends)?,
            heartbeat_interval: parse_millis(&lookup, "RACKCAST_HEARTBEAT_MS", d.heartbeat_interval)?,
            max_missed_heartbeats: parse_var(
                &lookup,
                "RACKCAST_MAX_MISSED_HEARTBEATS",
                d.max_missed_heartbeats,
            )?,
            chunk_post_send_delay: parse_millis(
                &lookup,
                "RACKCAST_CHUNK_DELAY_MS",
                d.chunk_post_send_delay,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.datagram_capacity <= EMPTY_BUNDLE_SIZE || self.datagram_capacity > MAX_DATAGRAM_CAPACITY {
            return Err(BridgeError::Config {
                key: "RACKCAST_DATAGRAM_CAPACITY",
                reason: format!(
                    "{} is outside {}..={}",
                    self.datagram_capacity,
                    EMPTY_BUNDLE_SIZE + 1,
                    MAX_DATAGRAM_CAPACITY
                ),
            });
        }
        if self.max_sends == 0 {
            return Err(BridgeError::Config {
                key: "RACKCAST_MAX_SENDS",
                reason: "retry budget must be at least 1".into(),
            });
        }
        if self.retry_interval.is_zero() {
            return Err(BridgeError::Config {
                key: "RACKCAST_RETRY_INTERVAL_MS",
                reason: "must be positive".into(),
            });
        }
        if self.heartbeat_interval.is_zero() {
            return Err(BridgeError::Config {
                key: "RACKCAST_HEARTBEAT_MS",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            datagram_capacity: self.datagram_capacity,
            retry_interval: self.retry_interval,
            max_sends: self.max_sends,
            chunk_delay: self.chunk_post_send_delay,
        }
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, BridgeError>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| BridgeError::Config {
            key,
            reason: format!("{:?}: {}", raw, e),
        }),
    }
}

fn parse_millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: Duration,
) -> Result<Duration, BridgeError> {
    let ms: u64 = parse_var(lookup, key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_overrides() {
        let config = BridgeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.tx_port, 7746);
        assert_eq!(config.rx_port, 7225);
        assert_eq!(config.datagram_capacity, 1452);
        assert_eq!(config.retry_interval, Duration::from_millis(200));
    }

    #[test]
    fn overrides_apply() {
        let config = BridgeConfig::from_lookup(lookup(&[
            ("RACKCAST_TX_PORT", "9000"),
            ("RACKCAST_BROADCAST_ADDR", "192.168.1.255"),
            ("RACKCAST_RETRY_INTERVAL_MS", " 50 "),
            ("RACKCAST_MAX_SENDS", "3"),
            ("RACKCAST_CHUNK_DELAY_MS", "2"),
        ]))
        .unwrap();
        assert_eq!(config.tx_port, 9000);
        assert_eq!(config.broadcast_addr, "192.168.1.255".parse::<IpAddr>().unwrap());
        assert_eq!(config.retry_interval, Duration::from_millis(50));
        let registry = config.registry_config();
        assert_eq!(registry.max_sends, 3);
        assert_eq!(registry.chunk_delay, Duration::from_millis(2));
    }

    #[test]
    fn unparsable_value_names_key() {
        let err = BridgeConfig::from_lookup(lookup(&[("RACKCAST_RX_PORT", "seventy")])).unwrap_err();
        match err {
            BridgeError::Config { key, .. } => assert_eq!(key, "RACKCAST_RX_PORT"),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn rejects_degenerate_values() {
        for (key, value) in [
            ("RACKCAST_DATAGRAM_CAPACITY", "0"),
            ("RACKCAST_DATAGRAM_CAPACITY", "16"),
            ("RACKCAST_DATAGRAM_CAPACITY", "70000"),
            ("RACKCAST_MAX_SENDS", "0"),
            ("RACKCAST_RETRY_INTERVAL_MS", "0"),
        ] {
            assert!(
                BridgeConfig::from_lookup(lookup(&[(key, value)])).is_err(),
                "{}={} accepted",
                key,
                value
            );
        }
    }
}
