use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

/// Cache of currently authorized hosts, keyed by dotted-quad address with
/// the instant of the last registration or renewal. Expiry uses the
/// monotonic clock so wall-clock adjustments never shorten or extend an
/// authorization.
#[derive(Debug)]
pub struct AuthorizedHosts {
    ttl: i64,
    hosts: Mutex<HashMap<String, Instant>>,
}

impl AuthorizedHosts {
    /// A negative `ttl` disables expiry entirely.
    pub fn new(ttl: i64) -> Self {
        Self {
            ttl,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> i64 {
        self.ttl
    }

    pub fn exists(&self, host: &str) -> bool {
        self.hosts.lock().unwrap().contains_key(host)
    }

    /// Insert the host if absent. Returns whether it was inserted; exactly
    /// one of several concurrent callers for the same host observes `true`.
    pub fn register(&self, host: &str) -> bool {
        let mut hosts = self.hosts.lock().unwrap();
        if hosts.contains_key(host) {
            return false;
        }
        hosts.insert(host.to_string(), Instant::now());
        true
    }

    /// Reset the host's registration time, inserting it if absent.
    pub fn renew(&self, host: &str) {
        self.hosts
            .lock()
            .unwrap()
            .insert(host.to_string(), Instant::now());
    }

    pub fn delete(&self, host: &str) {
        self.hosts.lock().unwrap().remove(host);
    }

    /// Hosts whose registration is older than the TTL. Empty when expiry is
    /// disabled. Holds the cache lock for the duration of the scan.
    pub fn expired(&self) -> Vec<String> {
        if self.ttl < 0 {
            return Vec::new();
        }
        let ttl = Duration::from_secs(self.ttl as u64);
        self.hosts
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, at)| at.elapsed() > ttl)
            .map(|(host, _)| host.clone())
            .collect()
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.hosts.lock().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.hosts.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.lock().unwrap().is_empty()
    }

    /// Copy live entries into a fresh map, shedding the capacity the old map
    /// accumulated at its peak size.
    pub fn compact(&self) {
        let mut hosts = self.hosts.lock().unwrap();
        let mut fresh = HashMap::with_capacity(hosts.len());
        fresh.extend(hosts.drain());
        *hosts = fresh;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn register_is_insert_if_absent() {
        let cache = AuthorizedHosts::new(60);
        assert!(cache.register("93.184.216.34"));
        assert!(!cache.register("93.184.216.34"));
        assert!(cache.exists("93.184.216.34"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn delete_removes_the_host() {
        let cache = AuthorizedHosts::new(60);
        cache.register("10.0.0.5");
        cache.delete("10.0.0.5");
        assert!(!cache.exists("10.0.0.5"));
        cache.delete("10.0.0.5");
    }

    #[test]
    fn negative_ttl_never_expires() {
        let cache = AuthorizedHosts::new(-1);
        cache.register("10.0.0.5");
        assert!(cache.expired().is_empty());
    }

    #[test]
    fn entries_older_than_ttl_are_reported() {
        let cache = AuthorizedHosts::new(0);
        cache.register("10.0.0.5");
        sleep(Duration::from_millis(20));
        assert_eq!(cache.expired(), vec!["10.0.0.5".to_string()]);
    }

    #[test]
    fn renew_resets_the_clock() {
        let cache = AuthorizedHosts::new(1);
        cache.register("10.0.0.5");
        sleep(Duration::from_millis(1100));
        assert_eq!(cache.expired(), vec!["10.0.0.5".to_string()]);
        cache.renew("10.0.0.5");
        assert!(cache.expired().is_empty());
        // Renew also inserts when absent.
        cache.renew("10.0.0.6");
        assert!(cache.exists("10.0.0.6"));
    }

    #[test]
    fn compact_preserves_entries() {
        let cache = AuthorizedHosts::new(60);
        for i in 0..100 {
            cache.register(&format!("10.0.0.{i}"));
        }
        cache.compact();
        assert_eq!(cache.len(), 100);
        assert!(cache.exists("10.0.0.42"));
    }
}
