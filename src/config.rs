//! Configuration file structures and parsing.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::proxy::ProxyOptions;
use crate::routing::{RouteTarget, RoutingTable};
use crate::upstream::{address_to_upstream, UpstreamOptions};

/// Root configuration structure
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamSettings,
    #[serde(default, rename = "route")]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
}

/// Server listening configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Addresses serving plain DNS over UDP and TCP
    /// Can be a single address string or an array of addresses
    #[serde(default = "default_listen", deserialize_with = "deserialize_listen_addrs")]
    pub listen: Vec<SocketAddr>,
    /// DNS-over-TLS listener address (requires tls_cert and tls_key)
    pub tls_listen: Option<SocketAddr>,
    /// DNS-over-HTTPS listener address (plain HTTP without tls_cert/tls_key)
    pub https_listen: Option<SocketAddr>,
    /// PEM certificate chain for the TLS listeners
    pub tls_cert: Option<PathBuf>,
    /// PEM private key for the TLS listeners
    pub tls_key: Option<PathBuf>,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            tls_listen: None,
            https_listen: None,
            tls_cert: None,
            tls_key: None,
            log_level: default_log_level(),
        }
    }
}

impl ServerConfig {
    /// Certificate and key paths, or an error when either is missing
    pub fn tls_material(&self) -> Result<(&Path, &Path)> {
        match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => Ok((cert, key)),
            _ => anyhow::bail!("tls_cert and tls_key must both be configured"),
        }
    }
}

fn default_listen() -> Vec<SocketAddr> {
    vec!["127.0.0.1:53".parse().expect("valid default listen address")]
}

/// Deserialize listen addresses from either a single string or an array
fn deserialize_listen_addrs<'de, D>(deserializer: D) -> std::result::Result<Vec<SocketAddr>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{self, SeqAccess, Visitor};
    use std::fmt;

    struct ListenAddrsVisitor;

    impl<'de> Visitor<'de> for ListenAddrsVisitor {
        type Value = Vec<SocketAddr>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or array of socket addresses")
        }

        fn visit_str<E>(self, value: &str) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            let addr: SocketAddr = value.parse().map_err(de::Error::custom)?;
            Ok(vec![addr])
        }

        fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: SeqAccess<'de>,
        {
            let mut addrs = Vec::new();
            while let Some(s) = seq.next_element::<String>()? {
                let addr: SocketAddr = s.parse().map_err(de::Error::custom)?;
                addrs.push(addr);
            }
            if addrs.is_empty() {
                return Err(de::Error::custom("listen address list cannot be empty"));
            }
            Ok(addrs)
        }
    }

    deserializer.deserialize_any(ListenAddrsVisitor)
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Upstream resolver configuration
#[derive(Debug, Deserialize)]
pub struct UpstreamSettings {
    /// Default resolvers, tried for every name without a matching route
    pub servers: Vec<String>,
    /// Resolvers of last resort, tried in order once every server failed
    #[serde(default)]
    pub fallbacks: Vec<String>,
    /// Per-exchange timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    10
}

/// Reserved-domain routing entry
#[derive(Debug, Default, Deserialize)]
pub struct RouteConfig {
    /// Domain suffixes this route applies to; "" reserves the root
    pub domains: Vec<String>,
    /// Resolvers for names under these suffixes
    #[serde(default)]
    pub upstreams: Vec<String>,
    /// Answer names under these suffixes with an empty response instead of
    /// forwarding them anywhere
    #[serde(default)]
    pub unresolvable: bool,
}

/// DNS cache configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Enable DNS caching (default: true)
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    /// Maximum number of cached entries per tier (default: 10000)
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: u64,
    /// Minimum TTL in seconds; 0 disables the bound
    #[serde(default)]
    pub min_ttl: u32,
    /// Maximum TTL in seconds; 0 disables the bound
    #[serde(default)]
    pub max_ttl: u32,
}

fn default_cache_enabled() -> bool {
    true
}

fn default_cache_max_entries() -> u64 {
    10000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            max_entries: default_cache_max_entries(),
            min_ttl: 0,
            max_ttl: 0,
        }
    }
}

/// Resolution policy knobs
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyConfig {
    /// Refuse ANY queries with NotImp instead of forwarding them
    #[serde(default)]
    pub refuse_any: bool,
    /// Forward the client subnet upstream and partition the cache by it
    #[serde(default)]
    pub enable_edns_client_subnet: bool,
    /// Trust the X-Forwarded-For chain received on the DoH listener
    #[serde(default)]
    pub trust_x_forwarded_for: bool,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML string
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse TOML config")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.upstream.servers.is_empty() {
            anyhow::bail!("upstream.servers cannot be empty");
        }
        if self.upstream.timeout_secs == 0 {
            anyhow::bail!("upstream.timeout_secs must be positive");
        }

        for (idx, route) in self.routes.iter().enumerate() {
            if route.domains.is_empty() {
                anyhow::bail!("Route #{} has no domains", idx + 1);
            }
            if route.unresolvable && !route.upstreams.is_empty() {
                anyhow::bail!(
                    "Route #{} is marked unresolvable but also lists upstreams",
                    idx + 1
                );
            }
            if !route.unresolvable && route.upstreams.is_empty() {
                anyhow::bail!("Route #{} has no upstreams", idx + 1);
            }
        }

        if self.server.tls_listen.is_some() {
            self.server
                .tls_material()
                .context("tls_listen requires TLS material")?;
        }
        if self.server.tls_cert.is_some() != self.server.tls_key.is_some() {
            anyhow::bail!("tls_cert and tls_key must be configured together");
        }

        Ok(())
    }

    /// Build the runtime options for the resolution engine
    pub fn proxy_options(&self) -> Result<ProxyOptions> {
        let options = UpstreamOptions {
            timeout: Duration::from_secs(self.upstream.timeout_secs),
        };

        let upstreams = self
            .upstream
            .servers
            .iter()
            .map(|addr| {
                address_to_upstream(addr, &options)
                    .with_context(|| format!("Invalid upstream '{}'", addr))
            })
            .collect::<Result<Vec<_>>>()?;

        let fallbacks = self
            .upstream
            .fallbacks
            .iter()
            .map(|addr| {
                address_to_upstream(addr, &options)
                    .with_context(|| format!("Invalid fallback '{}'", addr))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut reserved: HashMap<String, RouteTarget> = HashMap::new();
        for route in &self.routes {
            for domain in &route.domains {
                let key = RoutingTable::normalize(domain);

                if route.unresolvable {
                    match reserved.entry(key) {
                        Entry::Occupied(_) => {
                            anyhow::bail!("Conflicting routes for domain '{}'", domain);
                        }
                        Entry::Vacant(slot) => {
                            slot.insert(RouteTarget::Unresolvable);
                        }
                    }
                    continue;
                }

                let route_upstreams = route
                    .upstreams
                    .iter()
                    .map(|addr| {
                        address_to_upstream(addr, &options)
                            .with_context(|| format!("Invalid upstream '{}'", addr))
                    })
                    .collect::<Result<Vec<_>>>()?;

                match reserved.entry(key) {
                    // Reservations for the same suffix accumulate in
                    // configuration order
                    Entry::Occupied(mut slot) => match slot.get_mut() {
                        RouteTarget::Reserved(existing) => existing.extend(route_upstreams),
                        RouteTarget::Unresolvable => {
                            anyhow::bail!("Conflicting routes for domain '{}'", domain);
                        }
                    },
                    Entry::Vacant(slot) => {
                        slot.insert(RouteTarget::Reserved(route_upstreams));
                    }
                }
            }
        }

        Ok(ProxyOptions {
            upstreams,
            fallbacks,
            reserved,
            cache_enabled: self.cache.enabled,
            cache_max_entries: self.cache.max_entries,
            cache_min_ttl: self.cache.min_ttl,
            cache_max_ttl: self.cache.max_ttl,
            enable_edns_client_subnet: self.policy.enable_edns_client_subnet,
            refuse_any: self.policy.refuse_any,
            trust_x_forwarded_for: self.policy.trust_x_forwarded_for,
            timeout: Duration::from_secs(self.upstream.timeout_secs),
        })
    }
}
