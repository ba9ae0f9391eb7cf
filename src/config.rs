use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::{Result, StubError};
use crate::listener::ExtraListener;

/// Runtime configuration for the stub server. Values come from the
/// defaults, then an optional TOML file, then `MIMIR_*` environment
/// overrides, in that order.
#[derive(Clone, Debug)]
pub struct StubConfig {
    /// Serve the primary loopback stub endpoint.
    pub stub_listener: bool,

    /// Additional listener endpoints.
    pub extra_listeners: Vec<ExtraListener>,

    /// Upstream DNS servers the forwarding resolver sends queries to.
    pub upstream_servers: Vec<SocketAddr>,

    /// Per-attempt timeout for upstream queries.
    pub upstream_timeout: Duration,

    /// Upstream attempts per server before giving up.
    pub upstream_attempts: usize,
}

impl Default for StubConfig {
    fn default() -> Self {
        Self {
            stub_listener: true,
            extra_listeners: Vec::new(),
            upstream_servers: vec![
                "1.1.1.1:53".parse().expect("static address is valid"),
                "8.8.8.8:53".parse().expect("static address is valid"),
            ],
            upstream_timeout: Duration::from_secs(2),
            upstream_attempts: 2,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    stub_listener: Option<bool>,
    extra_listeners: Option<Vec<String>>,
    upstream_servers: Option<Vec<String>>,
    upstream_timeout_ms: Option<u64>,
    upstream_attempts: Option<usize>,
}

impl StubConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let file: FileConfig = toml::from_str(&text)
            .map_err(|err| StubError::ConfigParse(format!("{}: {err}", path.display())))?;

        let mut config = Self::default();
        if let Some(value) = file.stub_listener {
            config.stub_listener = value;
        }
        if let Some(specs) = file.extra_listeners {
            config.extra_listeners = parse_extra_listeners(&specs)?;
        }
        if let Some(servers) = file.upstream_servers {
            config.upstream_servers = parse_upstreams(&servers)?;
        }
        if let Some(ms) = file.upstream_timeout_ms {
            config.upstream_timeout = Duration::from_millis(ms);
        }
        if let Some(attempts) = file.upstream_attempts {
            config.upstream_attempts = attempts.max(1);
        }
        Ok(config)
    }

    /// Apply `MIMIR_*` environment overrides on top of the current
    /// values.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(value) = std::env::var("MIMIR_STUB_LISTENER") {
            self.stub_listener = parse_bool(&value, self.stub_listener);
        }
        if let Ok(value) = std::env::var("MIMIR_EXTRA_LISTENERS") {
            let specs: Vec<String> = value
                .split(',')
                .map(str::trim)
                .filter(|spec| !spec.is_empty())
                .map(str::to_string)
                .collect();
            self.extra_listeners = parse_extra_listeners(&specs)?;
        }
        if let Ok(value) = std::env::var("MIMIR_UPSTREAM_SERVERS") {
            let servers: Vec<String> = value
                .split(',')
                .map(str::trim)
                .filter(|server| !server.is_empty())
                .map(str::to_string)
                .collect();
            self.upstream_servers = parse_upstreams(&servers)?;
        }
        if let Ok(value) = std::env::var("MIMIR_UPSTREAM_TIMEOUT_MS") {
            match value.parse::<u64>() {
                Ok(ms) => self.upstream_timeout = Duration::from_millis(ms),
                Err(_) => warn!("ignoring invalid MIMIR_UPSTREAM_TIMEOUT_MS: {value}"),
            }
        }
        Ok(())
    }
}

fn parse_bool(value: &str, default: bool) -> bool {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

fn parse_extra_listeners(specs: &[String]) -> Result<Vec<ExtraListener>> {
    let mut listeners: Vec<ExtraListener> = Vec::with_capacity(specs.len());
    for spec in specs {
        let listener: ExtraListener = spec.parse()?;
        // Endpoint uniqueness is by (mode, family, address, port).
        if listeners.contains(&listener) {
            warn!("ignoring duplicate extra listener: {spec}");
            continue;
        }
        listeners.push(listener);
    }
    Ok(listeners)
}

fn parse_upstreams(servers: &[String]) -> Result<Vec<SocketAddr>> {
    servers
        .iter()
        .map(|server| {
            server
                .parse::<SocketAddr>()
                .or_else(|_| {
                    server
                        .parse::<std::net::IpAddr>()
                        .map(|ip| SocketAddr::new(ip, crate::constants::DNS_PORT))
                })
                .map_err(|_| StubError::InvalidUpstreamServer(server.clone()))
        })
        .collect()
}
