//! The request-resolution engine: policy checks, cache lookups, routing,
//! upstream dispatch and response shaping, plus listener lifecycle.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::RecordType;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cache::{DnsCache, SubnetCache, TtlBounds};
use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::ecs;
use crate::error::ResolveError;
use crate::routing::{RouteTarget, RoutingTable};
use crate::upstream::Upstream;
use crate::{http, server};

/// How long `stop` waits for listeners and in-flight requests to drain
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Listener protocol a request arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Udp,
    Tcp,
    Tls,
    Https,
}

/// An in-flight request and its client metadata
pub struct DnsContext {
    /// The decoded query
    pub req: Message,
    /// Response slot, filled by `Proxy::resolve`
    pub res: Option<Message>,
    /// Socket peer the query arrived from
    pub addr: SocketAddr,
    pub transport: Transport,
    /// Parsed X-Forwarded-For chain, oldest first; HTTPS listeners only
    pub forwarded_for: Vec<IpAddr>,
}

impl DnsContext {
    pub fn new(req: Message, addr: SocketAddr, transport: Transport) -> Self {
        Self {
            req,
            res: None,
            addr,
            transport,
            forwarded_for: Vec::new(),
        }
    }
}

/// Runtime knobs for the resolution engine
pub struct ProxyOptions {
    /// Default resolvers, in configured order
    pub upstreams: Vec<Arc<dyn Upstream>>,
    /// Resolvers of last resort, tried once every primary failed
    pub fallbacks: Vec<Arc<dyn Upstream>>,
    /// Reserved-domain routing entries, keyed by suffix
    pub reserved: HashMap<String, RouteTarget>,
    pub cache_enabled: bool,
    pub cache_max_entries: u64,
    /// TTL clamping bounds in seconds; 0 disables a bound
    pub cache_min_ttl: u32,
    pub cache_max_ttl: u32,
    /// Partition the cache by client subnet and forward ECS upstream
    pub enable_edns_client_subnet: bool,
    /// Refuse ANY queries with NotImp instead of forwarding them
    pub refuse_any: bool,
    /// Trust the X-Forwarded-For chain on HTTPS listeners
    pub trust_x_forwarded_for: bool,
    /// Per-upstream exchange timeout
    pub timeout: Duration,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            upstreams: Vec::new(),
            fallbacks: Vec::new(),
            reserved: HashMap::new(),
            cache_enabled: false,
            cache_max_entries: 10_000,
            cache_min_ttl: 0,
            cache_max_ttl: 0,
            enable_edns_client_subnet: false,
            refuse_any: false,
            trust_x_forwarded_for: false,
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Default)]
struct RunState {
    shutdown: Option<broadcast::Sender<()>>,
    listeners: JoinSet<Result<()>>,
    addrs: HashMap<Transport, SocketAddr>,
}

/// Multi-protocol DNS forwarding proxy.
///
/// Quiescent after construction; `resolve` works immediately, `start` binds
/// the configured listeners and `stop` drains them again.
pub struct Proxy {
    table: RoutingTable,
    fallbacks: Vec<Arc<dyn Upstream>>,
    dispatcher: Dispatcher,
    pub(crate) cache: Option<DnsCache>,
    pub(crate) subnet_cache: Option<SubnetCache>,
    enable_ecs: bool,
    refuse_any: bool,
    trust_xff: bool,
    state: Mutex<RunState>,
}

impl Proxy {
    pub fn new(options: ProxyOptions) -> Self {
        let bounds = TtlBounds {
            min_ttl: options.cache_min_ttl,
            max_ttl: options.cache_max_ttl,
        };

        let (cache, subnet_cache) = if options.cache_enabled {
            (
                Some(DnsCache::new(options.cache_max_entries, bounds)),
                Some(SubnetCache::new(options.cache_max_entries, bounds)),
            )
        } else {
            (None, None)
        };

        let table = RoutingTable::new(options.upstreams, options.reserved);
        if table.is_empty() && options.fallbacks.is_empty() {
            warn!("No upstreams configured; every query will fail");
        }

        Self {
            table,
            fallbacks: options.fallbacks,
            dispatcher: Dispatcher::new(options.timeout),
            cache,
            subnet_cache,
            enable_ecs: options.enable_edns_client_subnet,
            refuse_any: options.refuse_any,
            trust_xff: options.trust_x_forwarded_for,
            state: Mutex::new(RunState::default()),
        }
    }

    /// Resolve one request, filling the context's response slot.
    ///
    /// Terminal errors are also reported as a DNS response with the matching
    /// response code, so listeners can always answer resolvable clients.
    pub async fn resolve(&self, d: &mut DnsContext) -> Result<(), ResolveError> {
        let Some(query) = d.req.queries().first().cloned() else {
            d.res = Some(response_with_code(&d.req, ResponseCode::ServFail));
            return Err(ResolveError::Malformed("query carries no question"));
        };

        // Only EDNS version 0 exists; anything else means the OPT record is
        // malformed
        if let Some(edns) = d.req.extensions() {
            if edns.version() != 0 {
                d.res = Some(response_with_code(&d.req, ResponseCode::ServFail));
                return Err(ResolveError::Malformed("unsupported OPT version"));
            }
        }

        if self.refuse_any && query.query_type() == RecordType::ANY {
            debug!("Refusing ANY request from {}", d.addr);
            d.res = Some(response_with_code(&d.req, ResponseCode::NotImp));
            return Err(ResolveError::PolicyRefused("ANY queries are refused"));
        }

        let client_ip = self.effective_client_ip(d);
        // Local clients never carry a routable subnet; they share the
        // general cache even when ECS is on.
        let use_subnet = self.enable_ecs && ecs::is_public_ip(client_ip);
        let source_prefix = ecs::source_prefix_for(client_ip);

        if use_subnet {
            if let Some(cache) = &self.subnet_cache {
                if let Some((answer, mask)) =
                    cache.get_with_subnet(&d.req, client_ip, source_prefix).await
                {
                    debug!(
                        "Serving {} from the subnet cache (/{} for {})",
                        query.name(),
                        mask,
                        client_ip
                    );
                    return self.finish(d, answer);
                }
            }
        } else if let Some(cache) = &self.cache {
            if let Some(answer) = cache.get(&d.req).await {
                debug!("Serving {} from cache", query.name());
                return self.finish(d, answer);
            }
        }

        let qname = query.name().to_string();
        let (upstreams, resolvable) = self.table.upstreams_for(&qname);
        if !resolvable {
            debug!("{} is reserved as unresolvable, returning an empty answer", qname);
            return self.finish(d, response_with_code(&d.req, ResponseCode::NoError));
        }
        if upstreams.is_empty() && self.fallbacks.is_empty() {
            d.res = Some(response_with_code(&d.req, ResponseCode::ServFail));
            return Err(ResolveError::NoRoute);
        }

        let mut outgoing = d.req.clone();
        let mut sent_subnet = None;
        if use_subnet {
            let (network, mask) = ecs::set_ecs(&mut outgoing, client_ip, 0);
            sent_subnet = Some((network, mask));
        }

        let answer = match self
            .dispatcher
            .exchange(&outgoing, &upstreams, &self.fallbacks)
            .await
        {
            Ok(answer) => answer,
            Err(e) => {
                d.res = Some(response_with_code(&d.req, e.rcode()));
                return Err(e);
            }
        };

        debug!(
            "{} {:?} => {:?}",
            qname.trim_end_matches('.'),
            query.query_type(),
            ecs::response_ips(&answer)
        );

        if use_subnet {
            if let Some(cache) = &self.subnet_cache {
                // Key under the scope the upstream answered for; aggregated
                // answers then serve every client inside the wider network.
                // Without an ECS echo, fall back to the source we sent.
                let (network, mask) = match ecs::parse_ecs(&answer) {
                    Some((ip, _source, scope)) => (ecs::mask_ip(ip, scope), scope),
                    None => sent_subnet.unwrap_or((client_ip, source_prefix)),
                };
                cache.set_with_subnet(&answer, network, mask).await;
            }
        } else if let Some(cache) = &self.cache {
            cache.set(&answer).await;
        }

        self.finish(d, answer)
    }

    /// Response shaping: preserve the client's id and hide our ECS use from
    /// clients that did not ask for it.
    fn finish(&self, d: &mut DnsContext, mut answer: Message) -> Result<(), ResolveError> {
        answer.set_id(d.req.id());
        if !ecs::has_ecs(&d.req) {
            ecs::strip_ecs(&mut answer);
        }
        d.res = Some(answer);
        Ok(())
    }

    /// Effective client address for cache partitioning and ECS.
    ///
    /// HTTPS requests may arrive through a reverse proxy; when the forwarded
    /// chain is trusted, the last public hop in it is the real client.
    fn effective_client_ip(&self, d: &DnsContext) -> IpAddr {
        if d.transport == Transport::Https && self.trust_xff {
            if let Some(ip) = d
                .forwarded_for
                .iter()
                .rev()
                .find(|ip| ecs::is_public_ip(**ip))
            {
                return *ip;
            }
        }
        d.addr.ip()
    }

    /// Bind the configured listeners and transition to running.
    ///
    /// Fails if the proxy is already running or a listener cannot bind.
    pub async fn start(self: Arc<Self>, server: &ServerConfig) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.shutdown.is_some() {
            anyhow::bail!("proxy is already running");
        }

        let (shutdown, _) = broadcast::channel(1);
        let mut listeners = JoinSet::new();
        let mut addrs = HashMap::new();

        for addr in &server.listen {
            let udp = UdpSocket::bind(*addr)
                .await
                .with_context(|| format!("failed to bind UDP listener on {}", addr))?;
            addrs.insert(Transport::Udp, udp.local_addr()?);
            info!("UDP DNS server listening on {}", udp.local_addr()?);
            listeners.spawn(server::serve_udp(
                Arc::new(udp),
                self.clone(),
                shutdown.clone(),
            ));

            let tcp = TcpListener::bind(*addr)
                .await
                .with_context(|| format!("failed to bind TCP listener on {}", addr))?;
            addrs.insert(Transport::Tcp, tcp.local_addr()?);
            info!("TCP DNS server listening on {}", tcp.local_addr()?);
            listeners.spawn(server::serve_tcp(tcp, self.clone(), shutdown.clone(), None));
        }

        if let Some(addr) = server.tls_listen {
            let (cert, key) = server
                .tls_material()
                .context("tls_listen requires tls_cert and tls_key")?;
            let acceptor = server::tls_acceptor(cert, key, &["dot"])?;
            let tcp = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind DoT listener on {}", addr))?;
            addrs.insert(Transport::Tls, tcp.local_addr()?);
            info!("DoT server listening on {}", tcp.local_addr()?);
            listeners.spawn(server::serve_tcp(
                tcp,
                self.clone(),
                shutdown.clone(),
                Some(acceptor),
            ));
        }

        if let Some(addr) = server.https_listen {
            let acceptor = match server.tls_material() {
                Ok((cert, key)) => Some(server::tls_acceptor(cert, key, &["h2", "http/1.1"])?),
                // Plain HTTP: TLS is terminated by a fronting reverse proxy
                Err(_) => None,
            };
            let tcp = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind DoH listener on {}", addr))?;
            addrs.insert(Transport::Https, tcp.local_addr()?);
            info!("DoH server listening on {}", tcp.local_addr()?);
            listeners.spawn(http::serve_doh(tcp, self.clone(), acceptor, shutdown.clone()));
        }

        listeners.spawn(self.clone().log_cache_stats(shutdown.subscribe()));

        state.shutdown = Some(shutdown);
        state.listeners = listeners;
        state.addrs = addrs;
        Ok(())
    }

    /// Signal shutdown, then wait for listeners and in-flight requests to
    /// drain within a grace period.
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(shutdown) = state.shutdown.take() else {
            anyhow::bail!("proxy is not running");
        };

        let _ = shutdown.send(());
        state.addrs.clear();

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, state.listeners.join_next()).await {
                Ok(Some(joined)) => {
                    if let Ok(Err(e)) = joined {
                        debug!("Listener finished with error: {:#}", e);
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    state.listeners.abort_all();
                    break;
                }
            }
        }

        info!("Proxy stopped");
        Ok(())
    }

    /// Bound address of a running listener
    #[allow(dead_code)]
    pub async fn local_addr(&self, transport: Transport) -> Option<SocketAddr> {
        self.state.lock().await.addrs.get(&transport).copied()
    }

    /// Background maintenance: periodic cache statistics
    async fn log_cache_stats(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    if let Some(cache) = &self.cache {
                        let stats = cache.stats();
                        debug!(
                            "General cache: {} entries, {:.1}% hit rate ({} hits / {} misses)",
                            stats.entries, stats.hit_rate(), stats.hits, stats.misses
                        );
                    }
                    if let Some(cache) = &self.subnet_cache {
                        let stats = cache.stats();
                        debug!(
                            "Subnet cache: {} entries, {:.1}% hit rate ({} hits / {} misses)",
                            stats.entries, stats.hit_rate(), stats.hits, stats.misses
                        );
                    }
                }
            }
        }

        Ok(())
    }
}

/// Build a response that carries only the request's question and an rcode
pub(crate) fn response_with_code(request: &Message, rcode: ResponseCode) -> Message {
    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(request.op_code());
    response.set_recursion_desired(request.recursion_desired());
    response.set_recursion_available(true);
    response.set_response_code(rcode);

    for query in request.queries() {
        response.add_query(query.clone());
    }

    response
}
