//! Client configuration

use crate::error::{Error, Result};
use crate::multichannel::{LoadBalancing, PromotionPolicy};
use crate::protocol::smb2_constants::{SecurityMode, Smb2Capabilities, Smb2Dialect, SMB_PORT};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// SMB client configuration. Read-only once handed to the client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Client GUID
    pub client_guid: Uuid,
    /// Offered dialects
    pub dialects: Vec<Smb2Dialect>,
    /// Security mode
    pub security_mode: SecurityMode,
    /// Capabilities
    pub capabilities: Smb2Capabilities,
    /// Server port
    pub port: u16,
    /// Socket connect plus negotiate
    pub connect_timeout: Duration,
    /// Bounded wait for a correlated response
    pub response_timeout: Duration,
    /// Lifetime of session key material before it is considered stale
    pub session_timeout: Duration,
    /// How long an unreferenced transport stays open
    pub idle_grace: Duration,
    /// Transparent retries after a recoverable send failure
    pub send_retries: u32,
    /// Log every acquire/release at debug level
    pub trace_resource_usage: bool,
    /// Share connected right after logon, if any
    pub logon_share: Option<String>,
    pub multi_channel: MultiChannelConfig,
    pub dfs: DfsConfig,
}

#[derive(Debug, Clone)]
pub struct MultiChannelConfig {
    pub enabled: bool,
    /// Upper bound on secondary channels per session
    pub max_channels: usize,
    pub load_balancing: LoadBalancing,
    pub promotion: PromotionPolicy,
    pub health_check_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct DfsConfig {
    pub enabled: bool,
    /// Replaces the server supplied TTL when set
    pub ttl_override: Option<Duration>,
    /// Serve an expired referral when re-resolution fails
    pub serve_stale: bool,
    /// Expired entries older than this are dropped instead of served
    pub max_stale: Duration,
    /// Bound on redirects followed while connecting one tree
    pub max_redirects: usize,
}

impl Default for MultiChannelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_channels: 4,
            load_balancing: LoadBalancing::RoundRobin,
            promotion: PromotionPolicy::FirstCreated,
            health_check_interval: Duration::from_secs(30),
        }
    }
}

impl Default for DfsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_override: None,
            serve_stale: true,
            max_stale: Duration::from_secs(3600),
            max_redirects: 8,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_guid: Uuid::new_v4(),
            dialects: vec![
                Smb2Dialect::Smb210,
                Smb2Dialect::Smb300,
                Smb2Dialect::Smb302,
            ],
            security_mode: SecurityMode::SIGNING_ENABLED,
            capabilities: Smb2Capabilities::DFS
                | Smb2Capabilities::LARGE_MTU
                | Smb2Capabilities::MULTI_CHANNEL,
            port: SMB_PORT,
            connect_timeout: Duration::from_secs(35),
            response_timeout: Duration::from_secs(30),
            session_timeout: Duration::from_secs(35 * 60),
            idle_grace: Duration::from_secs(5),
            send_retries: 1,
            trace_resource_usage: false,
            logon_share: None,
            multi_channel: MultiChannelConfig::default(),
            dfs: DfsConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Build a configuration from flat `smb.client.*` properties.
    /// Missing keys keep their defaults; unknown keys are ignored.
    pub fn from_properties(props: &HashMap<String, String>) -> Result<Self> {
        let mut config = Self::default();
        let mut min_dialect = None;
        let mut max_dialect = None;

        for (key, value) in props {
            let value = value.trim();
            match key.as_str() {
                "smb.client.port" => config.port = parse_number(key, value)?,
                "smb.client.connTimeout" => config.connect_timeout = parse_millis(key, value)?,
                "smb.client.responseTimeout" => config.response_timeout = parse_millis(key, value)?,
                "smb.client.sessionTimeout" => config.session_timeout = parse_millis(key, value)?,
                "smb.client.transportIdleGrace" => config.idle_grace = parse_millis(key, value)?,
                "smb.client.retries" => config.send_retries = parse_number(key, value)?,
                "smb.client.traceResourceUsage" => {
                    config.trace_resource_usage = parse_bool(key, value)?
                }
                "smb.client.logonShare" => {
                    config.logon_share = (!value.is_empty()).then(|| value.to_string())
                }
                "smb.client.minVersion" => min_dialect = Some(parse_dialect(key, value)?),
                "smb.client.maxVersion" => max_dialect = Some(parse_dialect(key, value)?),
                "smb.client.useMultiChannel" => {
                    config.multi_channel.enabled = parse_bool(key, value)?
                }
                "smb.client.maxChannels" => {
                    config.multi_channel.max_channels = parse_number(key, value)?
                }
                "smb.client.channelLoadBalancing" => {
                    config.multi_channel.load_balancing = value.parse()?
                }
                "smb.client.channelPromotion" => config.multi_channel.promotion = value.parse()?,
                "smb.client.channelHealthCheck" => {
                    config.multi_channel.health_check_interval = parse_secs(key, value)?
                }
                "smb.client.dfs.disabled" => config.dfs.enabled = !parse_bool(key, value)?,
                "smb.client.dfs.ttl" => config.dfs.ttl_override = Some(parse_secs(key, value)?),
                "smb.client.dfs.serveStale" => config.dfs.serve_stale = parse_bool(key, value)?,
                "smb.client.dfs.maxStale" => config.dfs.max_stale = parse_secs(key, value)?,
                "smb.client.dfs.maxRedirects" => {
                    config.dfs.max_redirects = parse_number(key, value)?
                }
                _ => debug!(key = %key, "Ignoring unknown configuration property"),
            }
        }

        if min_dialect.is_some() || max_dialect.is_some() {
            let min = min_dialect.unwrap_or(Smb2Dialect::Smb202);
            let max = max_dialect.unwrap_or(Smb2Dialect::Smb311);
            if min > max {
                return Err(Error::InvalidParameter(format!(
                    "smb.client.minVersion {:?} is above maxVersion {:?}",
                    min, max
                )));
            }
            config.dialects = ALL_DIALECTS
                .iter()
                .copied()
                .filter(|d| *d >= min && *d <= max)
                .collect();
        }
        Ok(config)
    }
}

const ALL_DIALECTS: [Smb2Dialect; 5] = [
    Smb2Dialect::Smb202,
    Smb2Dialect::Smb210,
    Smb2Dialect::Smb300,
    Smb2Dialect::Smb302,
    Smb2Dialect::Smb311,
];

fn invalid(key: &str, value: &str) -> Error {
    Error::InvalidParameter(format!("{} = {:?}", key, value))
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| invalid(key, value))
}

fn parse_millis(key: &str, value: &str) -> Result<Duration> {
    parse_number::<u64>(key, value).map(Duration::from_millis)
}

fn parse_secs(key: &str, value: &str) -> Result<Duration> {
    parse_number::<u64>(key, value).map(Duration::from_secs)
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn parse_dialect(key: &str, value: &str) -> Result<Smb2Dialect> {
    match value.to_ascii_uppercase().replace(['.', '_'], "").as_str() {
        "SMB202" => Ok(Smb2Dialect::Smb202),
        "SMB210" => Ok(Smb2Dialect::Smb210),
        "SMB300" => Ok(Smb2Dialect::Smb300),
        "SMB302" => Ok(Smb2Dialect::Smb302),
        "SMB311" => Ok(Smb2Dialect::Smb311),
        _ => Err(invalid(key, value)),
    }
}
