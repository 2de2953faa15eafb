// ============================================================================
// File: packages/core/src/cache.rs
// ----------------------------------------------------------------------------
// ReadWriteCache: optional per-pool overlay distinguishing read requests
// (results cacheable) from write requests (not cached, invalidate conflicting
// cached reads). One mutex covers the value map, in-flight claim table, and
// read/write registrations; single-flight signal objects live outside it.
// ============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;

/// djb2, required verbatim (not the runtime's own hasher) for reproducible
/// keys across processes/restarts.
pub fn djb2(s: &str) -> u64 {
    let mut hash: u64 = 5381;
    for b in s.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(b as u64);
    }
    hash
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    Lru,
    Lfu,
    Weight,
    Useless,
    Old,
    Random,
}

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

/// One cached value. Deep-copied (via `Value::clone`) on both `put` and
/// `get` so callers mutating a returned value cannot corrupt the cache.
#[derive(Debug, Clone)]
pub struct CachedValue {
    pub key: u64,
    pub value: Value,
    pub ttl_deadline: Option<Instant>,
    pub weight: Option<f64>,
    pub group: Option<String>,
    pub last_used: Instant,
    pub hit_count: u64,
}

impl CachedValue {
    fn new(value: Value, ttl: Option<Duration>, weight: Option<f64>, group: Option<String>) -> Self {
        Self {
            key: NEXT_KEY.fetch_add(1, Ordering::Relaxed),
            value,
            ttl_deadline: ttl.map(|d| Instant::now() + d),
            weight,
            group,
            last_used: Instant::now(),
            hit_count: 0,
        }
    }

    pub fn expired(&self) -> bool {
        self.ttl_deadline.is_some_and(|d| Instant::now() >= d)
    }

    fn remaining_ttl(&self) -> Duration {
        match self.ttl_deadline {
            Some(d) => d.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        }
    }
}

/// Outcome of `ReadWriteCache::get`.
#[derive(Debug)]
pub enum GetOutcome {
    /// A cached value, already deep-copied for the caller.
    Hit(Value),
    /// No value cached; caller should proceed to execute and, if it led,
    /// eventually call `put`.
    Proceed,
    /// `timeout` elapsed waiting on a single-flight leader.
    TimedOut,
}

struct SingleFlightSlot {
    state: Mutex<Option<Value>>,
    ready: Condvar,
    signaled: Mutex<bool>,
}

impl SingleFlightSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(None),
            ready: Condvar::new(),
            signaled: Mutex::new(false),
        }
    }

    fn publish(&self, value: Option<Value>) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = value;
        *self.signaled.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.ready.notify_all();
    }

    fn wait(&self, timeout: Duration) -> Option<Option<Value>> {
        let mut signaled = self.signaled.lock().unwrap_or_else(|e| e.into_inner());
        let deadline = Instant::now() + timeout;
        while !*signaled {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .ready
                .wait_timeout(signaled, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            signaled = guard;
        }
        Some(self.state.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

struct ReadRegistration {
    read_keys: HashSet<String>,
    claimed_key: Option<u64>,
}

struct Inner {
    values: HashMap<u64, CachedValue>,
    /// key -> in-flight leader slot, while the leader has not yet published.
    claims: HashMap<u64, (Arc<SingleFlightSlot>, String)>,
    /// xid -> read registration, for write-conflict checks and for knowing
    /// which read_keys map to which cache key once the value is known.
    read_registrations: HashMap<String, ReadRegistration>,
    /// xid -> write_keys, live only for the duration of the write call.
    write_registrations: HashMap<String, HashSet<String>>,
    /// read_keys -> cache key, so a later write can find and drop entries.
    key_by_read_keys: HashMap<u64, HashSet<String>>,
    size: usize,
    policy: EvictionPolicy,
    default_ttl: Option<Duration>,
    evict_period: Duration,
    group_interval: Duration,
    last_evict: Instant,
    group_hits: Vec<(String, f64, Instant)>,
}

/// Optional per-pool cache overlay. See spec §4.5.
pub struct ReadWriteCache {
    inner: Mutex<Inner>,
}

impl ReadWriteCache {
    pub fn new(size: usize, policy: EvictionPolicy, default_ttl: Option<Duration>, evict_period: Duration, group_interval: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                values: HashMap::new(),
                claims: HashMap::new(),
                read_registrations: HashMap::new(),
                write_registrations: HashMap::new(),
                key_by_read_keys: HashMap::new(),
                size,
                policy,
                default_ttl,
                evict_period,
                group_interval,
                last_evict: Instant::now(),
                group_hits: Vec::new(),
            }),
        }
    }

    fn hashed_key(keys: &HashSet<String>) -> u64 {
        let mut sorted: Vec<&str> = keys.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        djb2(&sorted.join("\u{0}"))
    }

    /// Write-path `get`: registers the write, drops conflicting in-flight
    /// read registrations, and always returns `Proceed` (writes bypass
    /// cache entirely).
    pub fn get_write(&self, xid: &str, write_keys: HashSet<String>) -> GetOutcome {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let conflicting: Vec<String> = inner
            .read_registrations
            .iter()
            .filter(|(_, reg)| !reg.read_keys.is_disjoint(&write_keys))
            .map(|(xid, _)| xid.clone())
            .collect();
        for xid in conflicting {
            inner.read_registrations.remove(&xid);
        }
        inner.write_registrations.insert(xid.to_string(), write_keys);
        GetOutcome::Proceed
    }

    /// Write-path `put`: removes every cached entry keyed by any of this
    /// write's keys, then de-registers.
    pub fn put_write(&self, xid: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(write_keys) = inner.write_registrations.remove(xid) else {
            return;
        };
        let stale: Vec<u64> = inner
            .key_by_read_keys
            .iter()
            .filter(|(_, rk)| !rk.is_disjoint(&write_keys))
            .map(|(k, _)| *k)
            .collect();
        for key in stale {
            inner.values.remove(&key);
            inner.key_by_read_keys.remove(&key);
        }
    }

    /// Read-path `get`. Blocks up to `timeout` on a concurrent single-flight
    /// leader for the same key.
    pub fn get_read(&self, xid: &str, read_keys: HashSet<String>, timeout: Duration) -> GetOutcome {
        let key = Self::hashed_key(&read_keys);
        let slot = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

            let conflicts = inner
                .write_registrations
                .values()
                .any(|wk| !wk.is_disjoint(&read_keys));
            if !conflicts {
                inner.read_registrations.insert(
                    xid.to_string(),
                    ReadRegistration { read_keys: read_keys.clone(), claimed_key: None },
                );
            }

            if let Some(cv) = inner.values.get_mut(&key) {
                if !cv.expired() {
                    cv.hit_count += 1;
                    cv.last_used = Instant::now();
                    let value = cv.value.clone();
                    let weight = cv.weight.unwrap_or(0.0);
                    if let Some(group) = cv.group.clone() {
                        inner.group_hits.push((group, weight, Instant::now()));
                    }
                    // A hit never claims anything; drop the registration just
                    // added above so it doesn't outlive this call.
                    inner.read_registrations.remove(xid);
                    return GetOutcome::Hit(value);
                }
            }

            if let Some((slot, _leader)) = inner.claims.get(&key) {
                Arc::clone(slot)
            } else {
                let slot = Arc::new(SingleFlightSlot::new());
                inner.claims.insert(key, (Arc::clone(&slot), xid.to_string()));
                if let Some(reg) = inner.read_registrations.get_mut(xid) {
                    reg.claimed_key = Some(key);
                }
                return GetOutcome::Proceed;
            }
        };

        match slot.wait(timeout) {
            Some(Some(value)) => GetOutcome::Hit(value),
            Some(None) => GetOutcome::Proceed,
            None => GetOutcome::TimedOut,
        }
    }

    /// Read-path `put`. Only the claiming xid's value is actually stored;
    /// everyone else (cache-hit or waiter) is a no-op. Records
    /// `read_keys -> cache key` so a later write can invalidate it.
    pub fn put_read(
        &self,
        xid: &str,
        value: Option<Value>,
        ttl: Option<Duration>,
        weight: Option<f64>,
        group: Option<String>,
    ) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let Some(reg) = inner.read_registrations.remove(xid) else {
            // not registered (lost a race with a conflicting write); still
            // release any claim this xid might hold so waiters don't hang.
            if let Some(key) = inner.claims.iter().find(|(_, (_, leader))| leader == xid).map(|(k, _)| *k) {
                if let Some((slot, _)) = inner.claims.remove(&key) {
                    slot.publish(None);
                }
            }
            return;
        };

        let Some(claimed_key) = reg.claimed_key else {
            return;
        };

        let Some((slot, leader)) = inner.claims.remove(&claimed_key) else {
            return;
        };
        debug_assert_eq!(leader, xid);

        match value {
            Some(v) => {
                let ttl = ttl.or(inner.default_ttl);
                let cv = CachedValue::new(v.clone(), ttl, weight, group);
                let key = cv.key;
                inner.key_by_read_keys.insert(key, reg.read_keys);
                inner.values.insert(key, cv);
                slot.publish(Some(v));
            }
            None => {
                slot.publish(None);
            }
        }

        self.maybe_evict(&mut inner);
    }

    fn maybe_evict(&self, inner: &mut Inner) {
        if inner.last_evict.elapsed() < inner.evict_period {
            return;
        }
        inner.last_evict = Instant::now();
        if inner.values.len() <= inner.size {
            return;
        }
        let overflow = inner.values.len() - inner.size;

        let group_totals: HashMap<String, f64> = if inner.group_interval > Duration::ZERO {
            let cutoff = Instant::now().checked_sub(inner.group_interval);
            let mut totals: HashMap<String, f64> = HashMap::new();
            inner.group_hits.retain(|(_, _, at)| cutoff.is_none_or(|c| *at >= c));
            for (g, w, _) in &inner.group_hits {
                *totals.entry(g.clone()).or_insert(0.0) += w;
            }
            totals
        } else {
            HashMap::new()
        };
        let grand_total: f64 = group_totals.values().sum();

        let policy = inner.policy;
        let mut scored: Vec<(u64, f64)> = inner
            .values
            .iter()
            .map(|(k, cv)| {
                let base = match policy {
                    EvictionPolicy::Lru => cv.last_used.elapsed().as_secs_f64(),
                    EvictionPolicy::Lfu => cv.hit_count as f64,
                    EvictionPolicy::Weight => cv.weight.unwrap_or(0.0),
                    EvictionPolicy::Useless => cv.weight.unwrap_or(0.0) * cv.hit_count as f64,
                    EvictionPolicy::Old => {
                        let ttl = cv.remaining_ttl();
                        if ttl == Duration::MAX { f64::MAX } else { -ttl.as_secs_f64() }
                    }
                    EvictionPolicy::Random => {
                        use rand::Rng;
                        rand::rng().random::<f64>()
                    }
                };
                let scaled = if grand_total > 0.0 {
                    if let Some(group) = &cv.group {
                        let group_weight = group_totals.get(group).copied().unwrap_or(0.0);
                        base * (group_weight / grand_total)
                    } else {
                        base
                    }
                } else {
                    base
                };
                (*k, scaled)
            })
            .collect();

        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        for (key, _) in scored.into_iter().take(overflow) {
            inner.values.remove(&key);
            inner.key_by_read_keys.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn djb2_is_deterministic() {
        assert_eq!(djb2("hello"), djb2("hello"));
        assert_ne!(djb2("hello"), djb2("world"));
    }

    #[test]
    fn first_reader_proceeds_second_reader_hits_after_put() {
        let cache = ReadWriteCache::new(8, EvictionPolicy::Lru, None, Duration::from_secs(60), Duration::ZERO);
        match cache.get_read("t1", keys(&["k1"]), Duration::from_millis(10)) {
            GetOutcome::Proceed => {}
            _ => panic!("first reader should proceed"),
        }
        cache.put_read("t1", Some(Value::String("v1".into())), None, Some(1.0), None);

        match cache.get_read("t2", keys(&["k1"]), Duration::from_millis(10)) {
            GetOutcome::Hit(v) => assert_eq!(v, Value::String("v1".into())),
            _ => panic!("second reader should hit cache"),
        }
    }

    #[test]
    fn write_invalidates_conflicting_read() {
        let cache = ReadWriteCache::new(8, EvictionPolicy::Lru, None, Duration::from_secs(60), Duration::ZERO);
        let _ = cache.get_read("r1", keys(&["X"]), Duration::from_millis(10));
        cache.put_read("r1", Some(Value::String("v1".into())), None, None, None);

        matches!(cache.get_write("w1", keys(&["X"])), GetOutcome::Proceed);
        cache.put_write("w1");

        match cache.get_read("r2", keys(&["X"]), Duration::from_millis(10)) {
            GetOutcome::Proceed => {}
            GetOutcome::Hit(_) => panic!("entry should have been invalidated by write"),
            GetOutcome::TimedOut => panic!("unexpected timeout"),
        }
    }

    #[test]
    fn concurrent_single_flight_second_waiter_sees_leader_result() {
        use std::sync::Arc;
        use std::thread;

        let cache = Arc::new(ReadWriteCache::new(8, EvictionPolicy::Lru, None, Duration::from_secs(60), Duration::ZERO));
        matches!(cache.get_read("leader", keys(&["k"]), Duration::from_millis(10)), GetOutcome::Proceed);

        let cache2 = Arc::clone(&cache);
        let waiter = thread::spawn(move || cache2.get_read("waiter", keys(&["k"]), Duration::from_secs(2)));

        thread::sleep(Duration::from_millis(30));
        cache.put_read("leader", Some(Value::String("leader-value".into())), None, None, None);

        match waiter.join().unwrap() {
            GetOutcome::Hit(v) => assert_eq!(v, Value::String("leader-value".into())),
            _ => panic!("waiter should observe leader's published value"),
        }
    }

    #[test]
    fn eviction_respects_size_bound() {
        let cache = ReadWriteCache::new(2, EvictionPolicy::Lru, None, Duration::ZERO, Duration::ZERO);
        for i in 0..5 {
            let k = format!("k{i}");
            let _ = cache.get_read(&format!("t{i}"), keys(&[&k]), Duration::from_millis(5));
            cache.put_read(&format!("t{i}"), Some(Value::from(i)), None, None, None);
        }
        let inner = cache.inner.lock().unwrap();
        assert!(inner.values.len() <= 2);
    }
}
