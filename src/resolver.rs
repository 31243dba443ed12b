//! Hostname to IPv4 cache. Entries are re-resolved after their TTL expires,
//! individual addresses can be blacklisted for a while, and hosts nobody asks
//! about are aged out periodically.

use std::net::{Ipv4Addr, ToSocketAddrs};
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::Mutex;
use rand::Rng;
use serde_derive::{Deserialize, Serialize};

use crate::logging::{self, Logger};

/// How a single address is picked out of a resolved set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum ResolvePolicy {
    /// Always the first address.
    First,
    /// A uniformly random address.
    Random,
    /// Round-robin over the addresses.
    Sequential,
}

/// How long resolved addresses are served from cache by default.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// How long an invalidated address stays blacklisted by default.
pub const DEFAULT_BLACKLIST: Duration = Duration::from_secs(60);

// Hosts nobody resolved for this long are purged.
const CACHE_EXPIRE: Duration = Duration::from_secs(300);
const AGING_INTERVAL: Duration = Duration::from_secs(60);

struct HostEntry {
    addrs: Vec<Ipv4Addr>,
    bad: Vec<(Ipv4Addr, Instant)>,
    resolved: Instant,
    ttl: Duration,
    active: Instant,
    cursor: usize,
}

struct Inner {
    hosts: HashMap<String, HostEntry>,
    last_aging: Instant,
}

pub struct Resolver {
    inner: Mutex<Inner>,
    log: Logger,
}

lazy_static::lazy_static! {
    static ref GLOBAL: Resolver = Resolver::new(None);
}

/// The process-wide resolver instance used by outgoing connections.
#[inline]
pub fn global() -> &'static Resolver {
    &GLOBAL
}

impl Resolver {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> Resolver {
        Resolver {
            inner: Mutex::new(Inner {
                hosts: HashMap::new(),
                last_aging: Instant::now(),
            }),
            log: logging::child(log, logging::o!("subsystem" => "resolver")),
        }
    }

    /// Resolves `hostname` and picks one address per `policy`. The TTL only
    /// takes effect the first time a host is resolved or after its cache
    /// entry expired.
    pub fn resolve(&self, hostname: &str, policy: ResolvePolicy, ttl: Duration) -> Option<Ipv4Addr> {
        self.resolve_at(hostname, policy, ttl, Instant::now(), system_lookup)
    }

    /// Removes one address from rotation until `duration` elapses.
    pub fn invalidate(&self, hostname: &str, ip: Ipv4Addr, duration: Duration) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.hosts.get_mut(hostname) {
            entry.addrs.retain(|addr| *addr != ip);
            entry.bad.retain(|(addr, _)| *addr != ip);
            entry.bad.push((ip, Instant::now() + duration));

            logging::debug!(self.log, "address invalidated";
                            "host" => hostname, "ip" => %ip);
        }
    }

    /// Drops the whole cache.
    pub fn clear(&self) {
        self.inner.lock().hosts.clear();
    }

    /// Drops the cache entry of one host.
    pub fn clear_host(&self, hostname: &str) {
        self.inner.lock().hosts.remove(hostname);
    }

    fn resolve_at<F>(
        &self,
        hostname: &str,
        policy: ResolvePolicy,
        ttl: Duration,
        now: Instant,
        lookup: F,
    ) -> Option<Ipv4Addr>
    where
        F: Fn(&str) -> Vec<Ipv4Addr>,
    {
        // Literal addresses bypass the cache entirely.
        if let Ok(ip) = hostname.parse::<Ipv4Addr>() {
            return Some(ip);
        }

        let mut inner = self.inner.lock();
        inner.age(now);

        let stale = match inner.hosts.get(hostname) {
            Some(entry) => now.duration_since(entry.resolved) >= entry.ttl,
            None => true,
        };

        if stale {
            let addrs = lookup(hostname);
            if addrs.is_empty() {
                logging::warn!(self.log, "resolution failed"; "host" => hostname);
                inner.hosts.remove(hostname);
                return None;
            }

            logging::debug!(self.log, "host resolved";
                            "host" => hostname, "count" => addrs.len());

            inner.hosts.insert(
                hostname.to_string(),
                HostEntry {
                    addrs,
                    bad: Vec::new(),
                    resolved: now,
                    ttl,
                    active: now,
                    cursor: 0,
                },
            );
        }

        let entry = inner.hosts.get_mut(hostname).expect("entry just ensured");

        entry.active = now;

        // Restore blacklisted addresses whose penalty expired.
        let mut restored = Vec::new();
        entry.bad.retain(|(addr, until)| {
            if now >= *until {
                restored.push(*addr);
                false
            } else {
                true
            }
        });
        entry.addrs.extend(restored);

        if entry.addrs.is_empty() {
            // Everything is blacklisted; better a suspect address than none.
            entry.addrs.extend(entry.bad.drain(..).map(|(addr, _)| addr));
        }

        match policy {
            ResolvePolicy::First => entry.addrs.first().copied(),
            ResolvePolicy::Random => {
                let index = rand::thread_rng().gen_range(0..entry.addrs.len());
                entry.addrs.get(index).copied()
            }
            ResolvePolicy::Sequential => {
                let index = entry.cursor % entry.addrs.len();
                entry.cursor = entry.cursor.wrapping_add(1);
                entry.addrs.get(index).copied()
            }
        }
    }
}

impl Inner {
    fn age(&mut self, now: Instant) {
        if now.duration_since(self.last_aging) < AGING_INTERVAL {
            return;
        }

        self.last_aging = now;
        self.hosts
            .retain(|_, entry| now.duration_since(entry.active) < CACHE_EXPIRE);
    }
}

fn system_lookup(hostname: &str) -> Vec<Ipv4Addr> {
    match (hostname, 0u16).to_socket_addrs() {
        Ok(addrs) => addrs
            .filter_map(|addr| match addr {
                std::net::SocketAddr::V4(v4) => Some(*v4.ip()),
                _ => None,
            })
            .collect(),
        Err(_) => Vec::new(),
    }
}
