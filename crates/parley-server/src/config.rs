use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;

use parley_gateway::connection::ConnectionConfig;

/// Process configuration, read from the environment (and `.env` if present).
#[derive(Debug, Clone)]
pub struct Config {
    pub addr: SocketAddr,
    pub connection: ConnectionConfig,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = ConnectionConfig::default();

        let host = lookup("PARLEY_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = parse_or(&lookup, "PARLEY_PORT", 3000)?;
        let heartbeat_secs: u64 = parse_or(
            &lookup,
            "PARLEY_HEARTBEAT_SECS",
            defaults.heartbeat_interval.as_secs(),
        )?;
        let max_missed_pongs: u8 =
            parse_or(&lookup, "PARLEY_MAX_MISSED_PONGS", defaults.max_missed_pongs)?;
        let max_frame_bytes: usize =
            parse_or(&lookup, "PARLEY_MAX_FRAME_BYTES", defaults.max_frame_bytes)?;

        if heartbeat_secs == 0 {
            anyhow::bail!("PARLEY_HEARTBEAT_SECS must be at least 1");
        }

        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", host, port))?;

        Ok(Self {
            addr,
            connection: ConnectionConfig {
                heartbeat_interval: Duration::from_secs(heartbeat_secs),
                max_missed_pongs,
                max_frame_bytes,
            },
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has invalid value {:?}", key, raw)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.addr.port(), 3000);
        assert_eq!(cfg.connection.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(cfg.connection.max_missed_pongs, 2);
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = config(&[
            ("PARLEY_HOST", "127.0.0.1"),
            ("PARLEY_PORT", "8787"),
            ("PARLEY_HEARTBEAT_SECS", "5"),
            ("PARLEY_MAX_FRAME_BYTES", "1024"),
        ])
        .unwrap();
        assert_eq!(cfg.addr.to_string(), "127.0.0.1:8787");
        assert_eq!(cfg.connection.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(cfg.connection.max_frame_bytes, 1024);
    }

    #[test]
    fn bad_values_are_errors() {
        assert!(config(&[("PARLEY_PORT", "http")]).is_err());
        assert!(config(&[("PARLEY_HEARTBEAT_SECS", "0")]).is_err());
    }
}
