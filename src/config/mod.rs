//! Loads the `gateway.ini`-style configuration file: listen address,
//! worker thread count, peer reconnect interval, holding-queue
//! timeout, the max allowed frame size, whether cluster mode (the
//! shared cache) is enabled, the static peer-agency table, and the
//! cache connection parameters.
//!
//! Mirrors the original `PPCConfig`/`GatewayConfigContext` split: a
//! plain data struct plus a loader that validates everything fatally
//! at startup rather than letting a malformed value surface later as
//! a confusing runtime error.

use std::time::Duration;

use ini::Ini;

use crate::cache::CacheConfig;
use crate::error::*;
use crate::peer::{clamp_max_msg_size, DEFAULT_MAX_MSG_SIZE, DEFAULT_RECONNECT_INTERVAL};

/// Default holding-queue timeout: 30 minutes.
pub const DEFAULT_HOLDING_MSG_MINUTES: u64 = 30;

/// Fully validated gateway configuration, ready to build the runtime
/// and every long-lived component from.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// This gateway's own agency id, announced in the TCP handshake so
    /// a peer's accept loop can bind the inbound socket to the right
    /// `PeerSession` — it must match the `agency.<id>` key the peer
    /// uses to refer to us.
    pub agency_id: String,
    pub listen_ip: String,
    pub listen_port: u16,
    pub thread_count: usize,
    pub reconnect_time: Duration,
    pub holding_msg_timeout: Duration,
    pub max_allow_msg_size: usize,
    pub disable_cache: bool,
    /// `(agency_id, endpoints)` pairs, in the order they appear in the
    /// file.
    pub agencies: Vec<(String, Vec<String>)>,
    pub cache: CacheConfig,
}

impl GatewayConfig {
    /// Parses and validates a configuration from INI-formatted text.
    pub fn from_str(text: &str) -> Result<Self> {
        let ini = Ini::load_from_str(text)
            .wrapped_msg(ErrorKind::Configuration, "failed to parse configuration")?;
        Self::from_ini(&ini)
    }

    fn from_ini(ini: &Ini) -> Result<Self> {
        let gateway = ini.section(Some("gateway"));

        let agency_id = gateway
            .and_then(|s| s.get("agency_id"))
            .ok_or("gateway.agency_id is required")
            .simple(ErrorKind::Configuration)?
            .to_owned();
        if agency_id.is_empty() {
            return Err("gateway.agency_id must not be empty").simple(ErrorKind::Configuration);
        }

        let listen_ip = gateway
            .and_then(|s| s.get("listen_ip"))
            .unwrap_or("0.0.0.0")
            .to_owned();

        let listen_port: u16 = gateway
            .and_then(|s| s.get("listen_port"))
            .ok_or("gateway.listen_port is required")
            .simple(ErrorKind::Configuration)?
            .parse()
            .simple_msg(ErrorKind::Configuration, "gateway.listen_port must be a u16")?;
        if listen_port == 0 {
            return Err("gateway.listen_port must be in (0, 65535]").simple(ErrorKind::Configuration);
        }

        let thread_count = match gateway.and_then(|s| s.get("thread_count")) {
            Some(v) => v
                .parse()
                .simple_msg(ErrorKind::Configuration, "gateway.thread_count must be a positive integer")?,
            None => crate::async_runtime::Runtime::default_thread_count(),
        };

        let reconnect_time = match gateway.and_then(|s| s.get("reconnect_time")) {
            Some(v) => {
                let ms: u64 = v
                    .parse()
                    .simple_msg(ErrorKind::Configuration, "gateway.reconnect_time must be milliseconds")?;
                Duration::from_millis(ms)
            }
            None => DEFAULT_RECONNECT_INTERVAL,
        };

        let holding_msg_timeout = match gateway.and_then(|s| s.get("holding_msg_minutes")) {
            Some(v) => {
                let minutes: u64 = v
                    .parse()
                    .simple_msg(ErrorKind::Configuration, "gateway.holding_msg_minutes must be an integer")?;
                Duration::from_secs(minutes * 60)
            }
            None => Duration::from_secs(DEFAULT_HOLDING_MSG_MINUTES * 60),
        };

        let max_allow_msg_size = match gateway.and_then(|s| s.get("max_allow_msg_size")) {
            Some(v) => {
                let mib: usize = v
                    .parse()
                    .simple_msg(ErrorKind::Configuration, "gateway.max_allow_msg_size must be MiB")?;
                clamp_max_msg_size(mib * 1024 * 1024)
            }
            None => DEFAULT_MAX_MSG_SIZE,
        };

        let disable_cache = match gateway.and_then(|s| s.get("disable_cache")) {
            Some(v) => parse_bool(v)?,
            None => false,
        };

        // peer agencies are flat `agency.<id> = host:port,host:port` keys
        // inside a single `[agency]` section, not one section per agency
        let mut agencies = Vec::new();
        if let Some(props) = ini.section(Some("agency")) {
            for (key, value) in props.iter() {
                let Some(agency_id) = key.strip_prefix("agency.") else { continue };
                if agency_id.is_empty() {
                    return Err("agency key must be in the form agency.<id>")
                        .simple(ErrorKind::Configuration);
                }
                let endpoints = parse_endpoint_list(value)?;
                agencies.push((agency_id.to_owned(), endpoints));
            }
        }

        let cache_section = ini.section(Some("cache"));
        let cache = CacheConfig {
            host: cache_section
                .and_then(|s| s.get("host"))
                .unwrap_or("127.0.0.1")
                .to_owned(),
            port: match cache_section.and_then(|s| s.get("port")) {
                Some(v) => v
                    .parse()
                    .simple_msg(ErrorKind::Configuration, "cache.port must be a u16")?,
                None => 6379,
            },
            password: cache_section
                .and_then(|s| s.get("password"))
                .filter(|p| !p.is_empty())
                .map(|p| p.to_owned()),
            database: match cache_section.and_then(|s| s.get("database")) {
                Some(v) => v
                    .parse()
                    .simple_msg(ErrorKind::Configuration, "cache.database must be a u16")?,
                None => 0,
            },
            pool_size: match cache_section.and_then(|s| s.get("pool_size")) {
                Some(v) => v
                    .parse()
                    .simple_msg(ErrorKind::Configuration, "cache.pool_size must be a u16")?,
                None => 8,
            },
            connection_timeout_ms: match cache_section.and_then(|s| s.get("connection_timeout")) {
                Some(v) => v
                    .parse()
                    .simple_msg(ErrorKind::Configuration, "cache.connection_timeout must be milliseconds")?,
                None => 500,
            },
            socket_timeout_ms: match cache_section.and_then(|s| s.get("socket_timeout")) {
                Some(v) => v
                    .parse()
                    .simple_msg(ErrorKind::Configuration, "cache.socket_timeout must be milliseconds")?,
                None => 500,
            },
        };

        Ok(GatewayConfig {
            agency_id,
            listen_ip,
            listen_port,
            thread_count,
            reconnect_time,
            holding_msg_timeout,
            max_allow_msg_size,
            disable_cache,
            agencies,
            cache,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_ip, self.listen_port)
    }
}

fn parse_bool(v: &str) -> Result<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err("expected a boolean value").simple(ErrorKind::Configuration),
    }
}

/// Parses a comma-separated `host:port` list per the endpoint string
/// grammar: `host` is a DNS name or IPv4/IPv6 literal, `port` is in
/// `(0, 65535]`. Any other form is rejected.
fn parse_endpoint_list(raw: &str) -> Result<Vec<String>> {
    let mut endpoints = Vec::new();
    for candidate in raw.split(',') {
        let candidate = candidate.trim();
        if candidate.is_empty() {
            continue;
        }
        validate_endpoint(candidate)?;
        endpoints.push(candidate.to_owned());
    }
    if endpoints.is_empty() {
        return Err("agency entry has no usable endpoints").simple(ErrorKind::Configuration);
    }
    Ok(endpoints)
}

fn validate_endpoint(endpoint: &str) -> Result<()> {
    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or("endpoint must be in host:port form")
        .simple(ErrorKind::Configuration)?;
    if host.is_empty() {
        return Err("endpoint host must not be empty").simple(ErrorKind::Configuration);
    }
    let port: u32 = port
        .parse()
        .simple_msg(ErrorKind::Configuration, "endpoint port must be numeric")?;
    if port == 0 || port > 65535 {
        return Err("endpoint port must be in (0, 65535]").simple(ErrorKind::Configuration);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_in_defaults() {
        let cfg = GatewayConfig::from_str("[gateway]\nagency_id = A\nlisten_port = 8080\n").unwrap();
        assert_eq!(cfg.listen_ip, "0.0.0.0");
        assert_eq!(cfg.listen_port, 8080);
        assert_eq!(cfg.reconnect_time, DEFAULT_RECONNECT_INTERVAL);
        assert_eq!(cfg.holding_msg_timeout, Duration::from_secs(30 * 60));
        assert_eq!(cfg.max_allow_msg_size, DEFAULT_MAX_MSG_SIZE);
        assert!(!cfg.disable_cache);
    }

    #[test]
    fn missing_agency_id_is_a_configuration_error() {
        let err = GatewayConfig::from_str("[gateway]\nlisten_port = 8080\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn missing_listen_port_is_a_configuration_error() {
        let err = GatewayConfig::from_str("[gateway]\nagency_id = A\nlisten_ip = 127.0.0.1\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn max_allow_msg_size_clamps_below_the_floor() {
        let cfg = GatewayConfig::from_str(
            "[gateway]\nagency_id = A\nlisten_port = 1\nmax_allow_msg_size = 5\n",
        )
        .unwrap();
        assert_eq!(cfg.max_allow_msg_size, 10 * 1024 * 1024);
    }

    #[test]
    fn max_allow_msg_size_clamps_above_the_ceiling() {
        let cfg = GatewayConfig::from_str(
            "[gateway]\nagency_id = A\nlisten_port = 1\nmax_allow_msg_size = 2048\n",
        )
        .unwrap();
        assert_eq!(cfg.max_allow_msg_size, 1024 * 1024 * 1024);
    }

    #[test]
    fn agency_endpoints_are_parsed_as_comma_separated_host_port_pairs() {
        let cfg = GatewayConfig::from_str(
            "[gateway]\nagency_id = A\nlisten_port = 1\n[agency]\nagency.B = host1:1000,host2:1001\n",
        )
        .unwrap();
        assert_eq!(cfg.agencies.len(), 1);
        assert_eq!(cfg.agencies[0].0, "B");
        assert_eq!(cfg.agencies[0].1, vec!["host1:1000", "host2:1001"]);
    }

    #[test]
    fn agency_endpoint_missing_port_is_rejected() {
        let err = GatewayConfig::from_str(
            "[gateway]\nagency_id = A\nlisten_port = 1\n[agency]\nagency.B = host1\n",
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn agency_endpoint_port_zero_is_rejected() {
        let err = GatewayConfig::from_str(
            "[gateway]\nagency_id = A\nlisten_port = 1\n[agency]\nagency.B = host1:0\n",
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}
