use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

enum Lookup {
    /// A background lookup has been started and has not finished.
    Pending,
    Done {
        hostname: Option<String>,
        expires_at: Instant,
    },
}

/// Reverse-DNS names for source addresses.
///
/// Callers never wait on the resolver: [`DnsCache::hostname`] answers from
/// the cache and starts a background lookup on a miss, so a listing shows
/// names once they have been resolved. Failed lookups are cached as `None`
/// for the same TTL, so an unresolvable sender costs one query per TTL.
pub struct DnsCache {
    cache: DashMap<IpAddr, Lookup>,
    ttl: Duration,
    timeout: Duration,
}

impl DnsCache {
    pub fn new(ttl: Duration, timeout: Duration) -> Self {
        Self {
            cache: DashMap::new(),
            ttl,
            timeout,
        }
    }

    /// Cached name of `ip`. A missing or expired entry is looked up in the
    /// background and `None` is returned for now.
    pub fn hostname(self: &Arc<Self>, ip: IpAddr) -> Option<String> {
        match self.cache.entry(ip) {
            Entry::Occupied(mut entry) => {
                match entry.get() {
                    Lookup::Pending => return None,
                    Lookup::Done {
                        hostname,
                        expires_at,
                    } => {
                        if Instant::now() < *expires_at {
                            return hostname.clone();
                        }
                    }
                }
                entry.insert(Lookup::Pending);
            }
            Entry::Vacant(entry) => {
                entry.insert(Lookup::Pending);
            }
        }
        self.spawn_lookup(ip);
        None
    }

    fn spawn_lookup(self: &Arc<Self>, ip: IpAddr) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            cache.resolve(ip).await;
        });
    }

    /// Queries the resolver for `ip` and stores the answer.
    pub async fn resolve(&self, ip: IpAddr) -> Option<String> {
        // getnameinfo blocks; keep it off the runtime threads.
        let result = tokio::time::timeout(
            self.timeout,
            tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&ip).ok()),
        )
        .await
        .ok()
        .and_then(|joined| joined.ok().flatten());

        // getnameinfo falls back to the numeric form when there is no PTR.
        let hostname = result.filter(|name| name.parse::<IpAddr>() != Ok(ip));

        self.cache.insert(
            ip,
            Lookup::Done {
                hostname: hostname.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        hostname
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 5737 TEST-NET: no PTR record on any real resolver.
    const UNRESOLVABLE: &str = "192.0.2.1";

    #[tokio::test]
    async fn test_numeric_answer_is_not_a_hostname() {
        let cache = DnsCache::new(Duration::from_secs(300), Duration::from_secs(2));
        let ip: IpAddr = UNRESOLVABLE.parse().unwrap();
        assert_eq!(cache.resolve(ip).await, None);
        assert!(matches!(
            cache.cache.get(&ip).as_deref(),
            Some(Lookup::Done { hostname: None, .. })
        ));
    }

    #[tokio::test]
    async fn test_miss_starts_one_background_lookup() {
        let cache = Arc::new(DnsCache::new(
            Duration::from_secs(300),
            Duration::from_secs(2),
        ));
        let ip: IpAddr = UNRESOLVABLE.parse().unwrap();

        assert_eq!(cache.hostname(ip), None);
        assert!(matches!(
            cache.cache.get(&ip).as_deref(),
            Some(Lookup::Pending)
        ));
        // A second miss while pending does not queue another lookup.
        assert_eq!(cache.hostname(ip), None);
        assert_eq!(cache.cache.len(), 1);
    }

    #[tokio::test]
    async fn test_fresh_entry_is_served_from_cache() {
        let cache = Arc::new(DnsCache::new(
            Duration::from_secs(300),
            Duration::from_secs(2),
        ));
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        cache.cache.insert(
            ip,
            Lookup::Done {
                hostname: Some("gw.example".to_string()),
                expires_at: Instant::now() + Duration::from_secs(60),
            },
        );
        assert_eq!(cache.hostname(ip).as_deref(), Some("gw.example"));
    }

    #[tokio::test]
    async fn test_expired_entry_is_refreshed() {
        let cache = Arc::new(DnsCache::new(Duration::ZERO, Duration::from_secs(2)));
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        cache.cache.insert(
            ip,
            Lookup::Done {
                hostname: Some("old.example".to_string()),
                expires_at: Instant::now(),
            },
        );
        assert_eq!(cache.hostname(ip), None);
        assert!(matches!(
            cache.cache.get(&ip).as_deref(),
            Some(Lookup::Pending)
        ));
    }
}
