use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::error::RpcError;

/// How long resolved address sets are reused before a fresh lookup.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Maps an `ip:port`, `host:port` or `:port` string to one concrete
/// address per call. FQDNs with several A records yield a different record
/// per call according to the strategy.
pub trait Resolver: Send {
    fn resolve(&mut self, addr: &str) -> Result<SocketAddr, RpcError>;
}

/// `":port"` means bind-any.
fn normalize(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

fn lookup(addr: &str) -> Result<Vec<SocketAddr>, RpcError> {
    let addrs: Vec<SocketAddr> = normalize(addr)
        .to_socket_addrs()
        .map_err(|_| RpcError::Resolve(addr.to_string()))?
        .collect();
    // The wire format carries IPv4 endpoints; prefer A records when the
    // host has both.
    let v4: Vec<SocketAddr> = addrs.iter().copied().filter(|a| a.is_ipv4()).collect();
    let chosen = if v4.is_empty() { addrs } else { v4 };
    if chosen.is_empty() {
        return Err(RpcError::Resolve(addr.to_string()));
    }
    Ok(chosen)
}

struct CacheEntry {
    addrs: Vec<SocketAddr>,
    next: usize,
    refreshed_at: Instant,
}

/// The default strategy: rotate through a host's records, refreshing the
/// lookup periodically.
pub struct RoundRobinResolver {
    refresh_interval: Duration,
    cache: HashMap<String, CacheEntry>,
}

impl RoundRobinResolver {
    pub fn new(refresh_interval: Duration) -> Self {
        Self {
            refresh_interval,
            cache: HashMap::new(),
        }
    }
}

impl Default for RoundRobinResolver {
    fn default() -> Self {
        Self::new(DEFAULT_REFRESH_INTERVAL)
    }
}

impl Resolver for RoundRobinResolver {
    fn resolve(&mut self, addr: &str) -> Result<SocketAddr, RpcError> {
        let now = Instant::now();
        let stale = self
            .cache
            .get(addr)
            .is_none_or(|e| now.saturating_duration_since(e.refreshed_at) >= self.refresh_interval);
        if stale {
            let addrs = lookup(addr)?;
            self.cache.insert(
                addr.to_string(),
                CacheEntry {
                    addrs,
                    next: 0,
                    refreshed_at: now,
                },
            );
        }
        let entry = self.cache.get_mut(addr).expect("entry inserted above");
        let chosen = entry.addrs[entry.next % entry.addrs.len()];
        entry.next = entry.next.wrapping_add(1);
        Ok(chosen)
    }
}

/// Alternative strategy picking a uniformly random record per call.
#[derive(Default)]
pub struct RandomResolver;

impl Resolver for RandomResolver {
    fn resolve(&mut self, addr: &str) -> Result<SocketAddr, RpcError> {
        let addrs = lookup(addr)?;
        let idx = rand::thread_rng().gen_range(0..addrs.len());
        Ok(addrs[idx])
    }
}
