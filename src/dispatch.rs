//! Upstream dispatch: RTT-ordered attempts with a fallback pool.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use hickory_proto::op::Message;
use tracing::{debug, warn};

use crate::error::ResolveError;
use crate::upstream::Upstream;

/// Observed round-trip times per upstream address, in milliseconds.
///
/// A missing entry means "unknown" and sorts before any measured value, so
/// fresh upstreams get probed first. Each successful exchange overwrites the
/// previous measurement; stale overlapping writes under load are harmless.
#[derive(Default)]
pub struct RttStats {
    times: RwLock<HashMap<String, u32>>,
}

impl RttStats {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, u32>> {
        match self.times.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, u32>> {
        match self.times.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Last observed RTT for an address; 0 when unknown
    pub fn millis(&self, address: &str) -> u32 {
        self.read().get(address).copied().unwrap_or(0)
    }

    /// Record a measurement, replacing the previous one
    pub fn record(&self, address: &str, millis: u32) {
        self.write().insert(address.to_string(), millis);
    }

    /// Forget all measurements
    #[allow(dead_code)]
    pub fn clear(&self) {
        self.write().clear();
    }
}

/// Dispatches one query across an upstream set
pub struct Dispatcher {
    rtt: RttStats,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            rtt: RttStats::default(),
            timeout,
        }
    }

    pub fn rtt(&self) -> &RttStats {
        &self.rtt
    }

    /// Stable sort by ascending observed RTT; unknown upstreams come first
    /// and keep their configured order.
    pub fn sorted_by_rtt(&self, upstreams: &[Arc<dyn Upstream>]) -> Vec<Arc<dyn Upstream>> {
        let mut sorted = upstreams.to_vec();
        sorted.sort_by_key(|u| self.rtt.millis(u.address()));
        sorted
    }

    /// Try every primary upstream in RTT order, then every fallback in
    /// configured order. The first successful exchange wins and updates the
    /// RTT stats; fallbacks are only contacted once every primary failed.
    pub async fn exchange(
        &self,
        query: &Message,
        upstreams: &[Arc<dyn Upstream>],
        fallbacks: &[Arc<dyn Upstream>],
    ) -> Result<Message, ResolveError> {
        for upstream in self.sorted_by_rtt(upstreams) {
            let started = Instant::now();
            match tokio::time::timeout(self.timeout, upstream.exchange(query)).await {
                Ok(Ok(response)) => {
                    let elapsed = started.elapsed().as_millis() as u32;
                    self.rtt.record(upstream.address(), elapsed);
                    debug!("Upstream {} replied in {}ms", upstream.address(), elapsed);
                    return Ok(response);
                }
                Ok(Err(e)) => {
                    let e = ResolveError::UpstreamFailed(
                        upstream.address().to_string(),
                        format!("{:#}", e),
                    );
                    debug!("{}", e);
                }
                Err(_) => {
                    let e = ResolveError::UpstreamFailed(
                        upstream.address().to_string(),
                        format!("no response within {:?}", self.timeout),
                    );
                    debug!("{}", e);
                }
            }
        }

        for fallback in fallbacks {
            match tokio::time::timeout(self.timeout, fallback.exchange(query)).await {
                Ok(Ok(response)) => {
                    debug!("Fallback {} replied", fallback.address());
                    return Ok(response);
                }
                Ok(Err(e)) => {
                    warn!("Fallback {} failed: {:#}", fallback.address(), e);
                }
                Err(_) => {
                    warn!(
                        "Fallback {} gave no response within {:?}",
                        fallback.address(),
                        self.timeout
                    );
                }
            }
        }

        Err(ResolveError::AllUpstreamsFailed)
    }
}
