// ============================================================================
// File: packages/core/src/request_context.rs
// ----------------------------------------------------------------------------
// Ambient per-operation state: deadline, description, auth tokens, log level
// override. Installed on the thread handling a request, cloned (deep copy of
// parameters, same deadline) when a transaction fans a request out to its
// participant worker threads.
// ============================================================================

use std::cell::RefCell;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::Level;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::sync::{DeadlineRwLock, RwReadGuard, RwWriteGuard};

thread_local! {
    static CURRENT: RefCell<Option<RequestContext>> = const { RefCell::new(None) };
}

/// Ambient per-request state carried on the thread that handles a request,
/// and on any worker thread a transaction spawns to service a participant.
#[derive(Debug, Clone)]
pub struct RequestContext {
    unique_id: String,
    interface: String,
    protocol: String,
    description: String,
    deadline: Instant,
    parameters: Map<String, Value>,
    log_level_stack: VecDeque<Level>,
}

/// Wire form of a `RequestContext`, exchanged across an RPC hop.
///
/// `deadline` here is the *remaining* time in seconds at the moment of
/// serialization, not an absolute timestamp: `RequestContext::deadline` is
/// built on `Instant`, which is monotonic per-process and meaningless once
/// compared against another process's clock. See DESIGN.md for the
/// alternative considered (wall-clock timestamp) and why it was rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContextRecord {
    pub unique_id: String,
    pub interface: String,
    pub protocol: String,
    pub description: String,
    pub remaining_secs: f64,
    pub parameters: Map<String, Value>,
    pub log_levels: Vec<i32>,
}

fn level_to_i32(level: Level) -> i32 {
    match level {
        Level::Error => 0,
        Level::Warn => 1,
        Level::Info => 2,
        Level::Debug => 3,
        Level::Trace => 4,
    }
}

fn level_from_i32(v: i32) -> Level {
    match v {
        0 => Level::Error,
        1 => Level::Warn,
        2 => Level::Info,
        3 => Level::Debug,
        _ => Level::Trace,
    }
}

impl RequestContext {
    /// Create a new context at the edge of the system (an interface adapter
    /// accepting a message).
    pub fn new(
        unique_id: impl Into<String>,
        interface: impl Into<String>,
        protocol: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            unique_id: unique_id.into(),
            interface: interface.into(),
            protocol: protocol.into(),
            description: String::new(),
            deadline: Instant::now() + timeout,
            parameters: Map::new(),
            log_level_stack: VecDeque::new(),
        }
    }

    /// A synthetic context for background tasks (sweeper, warmer, …) that
    /// have no inbound request to inherit a deadline from.
    pub fn fake(timeout: Duration) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), "__background__", "n/a", timeout)
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = description.into();
    }

    pub fn parameters(&self) -> &Map<String, Value> {
        &self.parameters
    }

    pub fn parameters_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.parameters
    }

    pub fn auth_tokens(&self) -> Option<&Map<String, Value>> {
        self.parameters.get("auth_tokens").and_then(Value::as_object)
    }

    /// `max(0, deadline - now())`.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Move the deadline to `now() + d`, but only if that tightens it: a
    /// caller that already has a shorter deadline is never granted more
    /// time.
    pub fn set_remaining(&mut self, d: Duration) {
        let candidate = Instant::now() + d;
        if candidate < self.deadline {
            self.deadline = candidate;
        }
    }

    /// Deep copy of `parameters`, same deadline/description. Used when a
    /// transaction fans out to participant worker threads so participants
    /// cannot mutate the caller's view of the request.
    pub fn fork(&self) -> Self {
        self.clone()
    }

    pub fn push_log_level(&mut self, level: Level) {
        self.log_level_stack.push_back(level);
    }

    pub fn pop_log_level(&mut self) -> Option<Level> {
        self.log_level_stack.pop_back()
    }

    /// The effective log level for this request: the topmost override, or
    /// `default` if the stack is empty.
    pub fn effective_log_level(&self, default: Level) -> Level {
        self.log_level_stack.back().copied().unwrap_or(default)
    }

    /// Whether a message at `level` would actually be emitted, so call
    /// sites can skip building an expensive message:
    /// `if ctx.log_enabled(Level::Debug) { ... }`.
    pub fn log_enabled(&self, level: Level, default: Level) -> bool {
        level <= self.effective_log_level(default)
    }

    /// Deadline-aware acquisition of a shared lock. Fails (returns `None`)
    /// if the deadline would elapse before the lock is granted. This is the
    /// only supported way to wait on shared mutable state.
    pub fn acquire_read<'a, T>(&self, lock: &'a DeadlineRwLock<T>) -> Option<RwReadGuard<'a, T>> {
        lock.read(self.remaining())
    }

    /// Deadline-aware acquisition of an exclusive lock.
    pub fn acquire_write<'a, T>(&self, lock: &'a DeadlineRwLock<T>) -> Option<RwWriteGuard<'a, T>> {
        lock.write(self.remaining())
    }

    /// Serialize for an RPC hop.
    pub fn to_record(&self) -> RequestContextRecord {
        RequestContextRecord {
            unique_id: self.unique_id.clone(),
            interface: self.interface.clone(),
            protocol: self.protocol.clone(),
            description: self.description.clone(),
            remaining_secs: self.remaining().as_secs_f64(),
            parameters: self.parameters.clone(),
            log_levels: self.log_level_stack.iter().copied().map(level_to_i32).collect(),
        }
    }

    /// Reconstruct from an RPC record. `override_timeout` is the receiving
    /// cage's own configured request timeout; the incoming deadline is
    /// clamped to `min(incoming_remaining, override_timeout)` so downstream
    /// cages can impose their own ceiling while still honoring a shorter
    /// upstream deadline.
    pub fn from_record(record: RequestContextRecord, override_timeout: Duration) -> Self {
        let incoming = Duration::from_secs_f64(record.remaining_secs.max(0.0));
        let bounded = incoming.min(override_timeout);
        Self {
            unique_id: record.unique_id,
            interface: record.interface,
            protocol: record.protocol,
            description: record.description,
            deadline: Instant::now() + bounded,
            parameters: record.parameters,
            log_level_stack: record.log_levels.into_iter().map(level_from_i32).collect(),
        }
    }

    /// Install this context as the ambient context for the current thread,
    /// returning a guard that restores the previous context (if any) on
    /// drop. Supports nested installs across a fan-out.
    pub fn install(self) -> InstallGuard {
        let previous = CURRENT.with(|cell| cell.borrow_mut().replace(self));
        InstallGuard { previous }
    }

    /// The context installed on the current thread, if any.
    pub fn try_current() -> Option<RequestContext> {
        CURRENT.with(|cell| cell.borrow().clone())
    }
}

/// Restores the previous thread-local `RequestContext` on drop.
pub struct InstallGuard {
    previous: Option<RequestContext>,
}

impl Drop for InstallGuard {
    fn drop(&mut self) {
        CURRENT.with(|cell| {
            *cell.borrow_mut() = self.previous.take();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_never_negative() {
        let ctx = RequestContext::new("u1", "test", "n/a", Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(ctx.remaining(), Duration::ZERO);
    }

    #[test]
    fn set_remaining_only_tightens() {
        let mut ctx = RequestContext::new("u1", "test", "n/a", Duration::from_secs(10));
        let before = ctx.remaining();
        ctx.set_remaining(Duration::from_secs(100));
        assert!(ctx.remaining() <= before);
    }

    #[test]
    fn log_level_stack_is_lifo() {
        let mut ctx = RequestContext::new("u1", "test", "n/a", Duration::from_secs(1));
        assert_eq!(ctx.effective_log_level(Level::Info), Level::Info);
        ctx.push_log_level(Level::Debug);
        assert_eq!(ctx.effective_log_level(Level::Info), Level::Debug);
        ctx.push_log_level(Level::Trace);
        assert_eq!(ctx.effective_log_level(Level::Info), Level::Trace);
        ctx.pop_log_level();
        assert_eq!(ctx.effective_log_level(Level::Info), Level::Debug);
    }

    #[test]
    fn round_trip_clamped() {
        let ctx = RequestContext::new("u1", "test", "n/a", Duration::from_secs(5));
        let record = ctx.to_record();
        let restored = RequestContext::from_record(record, Duration::from_secs(60));
        assert_eq!(restored.unique_id(), "u1");
        assert!(restored.remaining() <= Duration::from_secs(5));
    }

    #[test]
    fn from_record_clamps_to_shorter_override() {
        let ctx = RequestContext::new("u1", "test", "n/a", Duration::from_secs(60));
        let record = ctx.to_record();
        let restored = RequestContext::from_record(record, Duration::from_secs(1));
        assert!(restored.remaining() <= Duration::from_secs(1));
    }

    #[test]
    fn install_restores_previous_on_drop() {
        assert!(RequestContext::try_current().is_none());
        let outer = RequestContext::new("outer", "test", "n/a", Duration::from_secs(1));
        let outer_guard = outer.install();
        assert_eq!(RequestContext::try_current().unwrap().unique_id(), "outer");
        {
            let inner = RequestContext::new("inner", "test", "n/a", Duration::from_secs(1));
            let _inner_guard = inner.install();
            assert_eq!(RequestContext::try_current().unwrap().unique_id(), "inner");
        }
        assert_eq!(RequestContext::try_current().unwrap().unique_id(), "outer");
        drop(outer_guard);
        assert!(RequestContext::try_current().is_none());
    }
}
