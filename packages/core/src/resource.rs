// ============================================================================
// File: packages/core/src/resource.rs
// ----------------------------------------------------------------------------
// ResourceInstance: one connectable, expiring endpoint living inside a
// ResourcePool. Subclasses (concrete resource types) override connect,
// disconnect, begin_transaction, commit, rollback and the actual operation
// methods; this module enforces only the lifecycle state machine.
// ============================================================================

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::ResourceError;
use crate::request_context::RequestContext;

/// Lifecycle states of a `ResourceInstance`.
///
/// ```text
///   created ──connect──▶ idle ──begin_transaction──▶ in_xa
///      │                  │ ▲                           │
///      │                  │ └───reset_idle──── commit/rollback
///      │                  │                         │
///      └──expire──▶ expired ◀──────────────────────┘
///                     │
///                     └──disconnect──▶ gone
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Created,
    Idle,
    InTransaction,
    Expired,
    Gone,
}

/// Transaction-scoped state attached to an instance while it is enrolled in
/// a transaction (cleared again by commit/rollback).
#[derive(Debug, Clone)]
pub struct TransactionContext {
    pub xid: String,
    pub source_module: String,
    pub options: serde_json::Map<String, serde_json::Value>,
}

/// The hand-rolled lifecycle state machine shared by every resource
/// instance. Concrete resources embed this and drive it from their own
/// `connect`/`disconnect`/`begin_transaction`/`commit`/`rollback` overrides;
/// it holds none of the resource-specific connection state itself.
#[derive(Debug)]
pub struct Lifecycle {
    state: Mutex<State>,
    expired: AtomicBool,
    created_at: Instant,
    idle_since: Mutex<Instant>,
    idle_timeout: Duration,
    max_age: Duration,
    min_time: Duration,
    max_time: Option<Duration>,
}

impl Lifecycle {
    pub fn new(idle_timeout: Duration, max_age: Duration, min_time: Duration, max_time: Option<Duration>) -> Self {
        let now = Instant::now();
        Self {
            state: Mutex::new(State::Created),
            expired: AtomicBool::new(false),
            created_at: now,
            idle_since: Mutex::new(now),
            idle_timeout,
            max_age,
            min_time,
            max_time,
        }
    }

    pub fn state(&self) -> State {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn min_time(&self) -> Duration {
        self.min_time
    }

    pub fn max_time(&self) -> Option<Duration> {
        self.max_time
    }

    /// Idempotent, irreversible. Callable from any thread at any state other
    /// than `Gone`.
    pub fn expire(&self) {
        self.expired.store(true, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != State::Gone {
            *state = State::Expired;
        }
    }

    /// True if the latch was set, idle_timeout has elapsed since the last
    /// reset, or max_age has elapsed since creation. Once true, this latch
    /// alone is sufficient; the derived checks below only matter before the
    /// latch is ever set.
    pub fn expired(&self) -> bool {
        if self.expired.load(Ordering::SeqCst) {
            return true;
        }
        if self.created_at.elapsed() >= self.max_age {
            return true;
        }
        let idle_since = *self.idle_since.lock().unwrap_or_else(|e| e.into_inner());
        idle_since.elapsed() >= self.idle_timeout
    }

    /// `min(idle_remaining, max_age_remaining)`.
    pub fn ttl(&self) -> Duration {
        let idle_since = *self.idle_since.lock().unwrap_or_else(|e| e.into_inner());
        let idle_remaining = self.idle_timeout.saturating_sub(idle_since.elapsed());
        let age_remaining = self.max_age.saturating_sub(self.created_at.elapsed());
        idle_remaining.min(age_remaining)
    }

    fn reset_idle(&self) {
        *self.idle_since.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub fn mark_connected(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == State::Created {
            *state = State::Idle;
            drop(state);
            self.reset_idle();
        }
    }

    /// Must be called by `begin_transaction` overrides after recording
    /// transaction context.
    pub fn mark_in_transaction(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == State::Idle {
            *state = State::InTransaction;
        }
    }

    /// Called by `commit`/`rollback` overrides on their non-expiring path.
    pub fn mark_idle(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == State::InTransaction {
            *state = State::Idle;
            drop(state);
            self.reset_idle();
        }
    }

    pub fn mark_gone(&self) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = State::Gone;
    }
}

/// Process-wide monotonic counter used to mint `pool_name/N` instance names.
static INSTANCE_COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn next_instance_name(pool_name: &str) -> String {
    let n = INSTANCE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{pool_name}/{n}")
}

/// One connectable, expiring endpoint. All overrides are pure delegation
/// points; the lifecycle state machine above is the only thing enforced by
/// this trait's contract.
///
/// Any error escaping `connect` must leave the instance `Gone` (never
/// returned to the pool); any error escaping `commit` must expire the
/// instance. Implementations are responsible for driving `Lifecycle`
/// accordingly; the pool only consults `lifecycle().expired()`.
pub trait ResourceInstance: Send + Sync + Debug {
    fn name(&self) -> &str;
    fn pool_name(&self) -> &str;
    fn lifecycle(&self) -> &Lifecycle;

    /// Establish the underlying connection. On error the pool discards this
    /// instance immediately (never returns it to free).
    fn connect(&self) -> Result<(), ResourceError>;

    /// Tear down the underlying connection. Never returns the instance to
    /// any pool afterward.
    fn disconnect(&self);

    /// Record transaction context on the instance ahead of a call. Must not
    /// perform network I/O if this resource type can skip a no-op
    /// transaction.
    fn begin_transaction(&self, ctx: TransactionContext) -> Result<(), ResourceError>;

    /// Best-effort final step. On error, the instance must be expired by
    /// the caller (the pool's release path enforces this regardless of
    /// what the override does internally).
    fn commit(&self) -> Result<(), ResourceError>;

    /// Best-effort final step; failures also expire the instance.
    fn rollback(&self) -> Result<(), ResourceError>;

    /// Invoke a named method (the resolved end of an attribute chain) with
    /// JSON-encoded args/kwargs, under the given ambient context.
    fn call(
        &self,
        method: &str,
        args: &[serde_json::Value],
        kwargs: &serde_json::Map<String, serde_json::Value>,
        ctx: &RequestContext,
    ) -> Result<serde_json::Value, ResourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_lifecycle_is_not_expired() {
        let lc = Lifecycle::new(Duration::from_secs(60), Duration::from_secs(3600), Duration::ZERO, None);
        assert!(!lc.expired());
        assert_eq!(lc.state(), State::Created);
    }

    #[test]
    fn explicit_expire_is_sticky() {
        let lc = Lifecycle::new(Duration::from_secs(60), Duration::from_secs(3600), Duration::ZERO, None);
        lc.mark_connected();
        lc.expire();
        assert!(lc.expired());
        assert_eq!(lc.state(), State::Expired);
        // calling expire again must not panic or change anything observable
        lc.expire();
        assert!(lc.expired());
    }

    #[test]
    fn idle_timeout_drives_expiry() {
        let lc = Lifecycle::new(Duration::from_millis(10), Duration::from_secs(3600), Duration::ZERO, None);
        lc.mark_connected();
        assert!(!lc.expired());
        std::thread::sleep(Duration::from_millis(30));
        assert!(lc.expired());
    }

    #[test]
    fn max_age_drives_expiry_even_if_recently_idle_reset() {
        let lc = Lifecycle::new(Duration::from_secs(3600), Duration::from_millis(10), Duration::ZERO, None);
        lc.mark_connected();
        std::thread::sleep(Duration::from_millis(30));
        assert!(lc.expired());
    }

    #[test]
    fn state_transitions_follow_the_machine() {
        let lc = Lifecycle::new(Duration::from_secs(60), Duration::from_secs(3600), Duration::ZERO, None);
        assert_eq!(lc.state(), State::Created);
        lc.mark_connected();
        assert_eq!(lc.state(), State::Idle);
        lc.mark_in_transaction();
        assert_eq!(lc.state(), State::InTransaction);
        lc.mark_idle();
        assert_eq!(lc.state(), State::Idle);
        lc.mark_gone();
        assert_eq!(lc.state(), State::Gone);
    }

    #[test]
    fn expire_never_reanimates_from_gone() {
        let lc = Lifecycle::new(Duration::from_secs(60), Duration::from_secs(3600), Duration::ZERO, None);
        lc.mark_gone();
        lc.expire();
        assert_eq!(lc.state(), State::Gone);
    }

    #[test]
    fn instance_names_are_unique_and_prefixed() {
        let a = next_instance_name("pool_a");
        let b = next_instance_name("pool_a");
        assert_ne!(a, b);
        assert!(a.starts_with("pool_a/"));
        assert!(b.starts_with("pool_a/"));
    }
}
