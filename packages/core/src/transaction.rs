// ============================================================================
// File: packages/core/src/transaction.rs
// ----------------------------------------------------------------------------
// TransactionCoordinator: fans N participants out to per-resource worker
// thread pools, collects intermediate results under a caller-supplied accept
// predicate, then drives commit or rollback. Best-effort, not 2PC (§4.4).
//
// Worker pools follow the same execution-pool shape used elsewhere in this
// codebase (mpsc::channel work queue behind Arc<Mutex<Receiver>>, N worker
// threads, a second channel carrying results back), generalized from
// "language dispatch" to "the 13-step per-participant protocol". Each
// participant worker carries its unit through steps 1-13 itself, including
// blocking on the transaction's shared decision signal (step 11) and
// performing its own commit/rollback (step 12) before releasing the
// instance (step 13), rather than handing the instance back to the
// coordinator thread to finish.
// ============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde_json::Value;

use crate::cache::GetOutcome;
use crate::error::{CoordinatorError, ResourceError};
use crate::pool::ResourcePool;
use crate::request_context::RequestContext;
use crate::resource::TransactionContext;

/// One participant attached to a transaction: `resource_name.attr_chain(args,
/// kwargs)`, plus the reserved `pool__cache_*` pseudo-kwargs the coordinator
/// strips before the resource method sees the remaining kwargs.
#[derive(Clone)]
pub struct Participant {
    pub resource_name: String,
    pub attr_chain: String,
    pub args: Vec<Value>,
    pub kwargs: serde_json::Map<String, Value>,
    pub cache_key: Option<String>,
    pub cache_ttl: Option<Duration>,
    pub cache_weight: Option<f64>,
    pub cache_group: Option<String>,
    pub read_keys: Option<HashSet<String>>,
    pub write_keys: Option<HashSet<String>>,
}

/// One participant's outcome as observed by the coordinator's drain loop.
#[derive(Clone)]
pub enum ParticipantOutcome {
    Value(Value),
    Error(ResourceError),
}

/// What the caller-supplied `accept` predicate decided after looking at the
/// results gathered so far.
pub enum AcceptDecision {
    /// Not enough information yet; keep waiting for more results.
    WaitForMore,
    /// Transaction's final result; triggers the commit path.
    Commit(Value),
    /// Transaction's final error; triggers the rollback path.
    Rollback(CoordinatorError),
}

pub type AcceptFn = dyn Fn(&[Option<ParticipantOutcome>]) -> AcceptDecision + Send + Sync;

/// "If any result is an exception, raise it; else once all results are
/// present, return the tuple of results."
pub fn accept_default(results: &[Option<ParticipantOutcome>]) -> AcceptDecision {
    for (index, outcome) in results.iter().enumerate() {
        if let Some(ParticipantOutcome::Error(e)) = outcome {
            return AcceptDecision::Rollback(CoordinatorError::Resource(e.clone().with_participant(index)));
        }
    }
    if results.iter().all(Option::is_some) {
        let values: Vec<Value> = results
            .iter()
            .map(|o| match o {
                Some(ParticipantOutcome::Value(v)) => v.clone(),
                _ => Value::Null,
            })
            .collect();
        AcceptDecision::Commit(Value::Array(values))
    } else {
        AcceptDecision::WaitForMore
    }
}

/// Decision signal broadcast to every participant worker exactly once: did
/// the transaction as a whole decide to commit.
struct Decision {
    state: Mutex<Option<bool>>,
    signaled: Condvar,
}

impl Decision {
    fn new() -> Self {
        Self { state: Mutex::new(None), signaled: Condvar::new() }
    }

    fn broadcast(&self, commit: bool) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = Some(commit);
        self.signaled.notify_all();
    }

    /// Blocks until a decision is broadcast or `timeout` elapses. A timeout
    /// is treated as rollback, per §4.4 step 11.
    fn wait(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let deadline = Instant::now() + timeout;
        while state.is_none() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.signaled.wait_timeout(state, deadline - now).unwrap_or_else(|e| e.into_inner());
            state = guard;
        }
        state.unwrap_or(false)
    }
}

/// What a worker ultimately reports back for its participant, once steps
/// 11-13 complete. `Transaction::execute`'s `sync_commit` wait polls this.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FinalOutcome {
    Committed,
    RolledBack,
    CommitFailed,
    RollbackFailed,
}

type ReportMap = Arc<Mutex<HashMap<usize, FinalOutcome>>>;

struct PendingUnit {
    participant_index: usize,
    participant: Participant,
    pool: Arc<ResourcePool>,
    ctx: RequestContext,
    source_module: String,
    started_at: Instant,
    decision: Arc<Decision>,
    reports: ReportMap,
    /// Sender for *this transaction's* result channel. Not bound at worker
    /// pool construction time: the same pool of threads serves many
    /// transactions over its lifetime, each with its own drain loop in
    /// `Transaction::execute`, so the destination channel travels with the
    /// unit instead.
    results_tx: mpsc::Sender<(usize, ParticipantOutcome)>,
}

enum WorkerMessage {
    Unit(PendingUnit),
    Shutdown,
}

/// A worker pool bound to one resource name, running the full per-participant
/// protocol (§4.4 steps 1-13) for every unit submitted to it.
pub struct ParticipantWorkerPool {
    sender: mpsc::Sender<WorkerMessage>,
}

impl ParticipantWorkerPool {
    pub fn new(worker_count: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<WorkerMessage>();
        let receiver = Arc::new(Mutex::new(receiver));

        for worker_id in 0..worker_count.max(1) {
            let receiver = Arc::clone(&receiver);
            thread::spawn(move || loop {
                let message = {
                    let rx = receiver.lock().unwrap_or_else(|e| e.into_inner());
                    rx.recv()
                };
                match message {
                    Ok(WorkerMessage::Unit(unit)) => {
                        debug!("participant worker {worker_id} picked up unit {}", unit.participant_index);
                        run_participant(unit);
                    }
                    Ok(WorkerMessage::Shutdown) | Err(_) => break,
                }
            });
        }

        Self { sender }
    }

    fn submit(&self, unit: PendingUnit) {
        let _ = self.sender.send(WorkerMessage::Unit(unit));
    }
}

/// Runs the full §4.4 per-participant protocol for one unit, start to
/// finish, entirely on this worker thread.
fn run_participant(unit: PendingUnit) {
    let PendingUnit { participant_index, participant, pool, ctx, source_module, started_at, decision, reports, results_tx } = unit;

    // Step 1: late-arrival check.
    if ctx.remaining() == Duration::ZERO {
        debug!("participant {participant_index} arrived with an already-expired request; dropping");
        return;
    }
    // Step 2: pending-time accounting (available for metrics; logged here).
    debug!("participant {participant_index} picked up after {:?} pending", started_at.elapsed());

    // Step 3: allocate.
    let instance = match pool.allocate() {
        Ok(i) => i,
        Err(e) => {
            let _ = results_tx.send((
                participant_index,
                ParticipantOutcome::Error(ResourceError::new(e.to_string(), true, false).with_participant(participant_index)),
            ));
            return;
        }
    };

    // Step 4: deadline clamp (temporarily tighten for the duration of the call).
    let mut call_ctx = ctx.fork();
    if let Some(max_time) = instance.lifecycle().max_time() {
        if call_ctx.remaining() > max_time {
            call_ctx.set_remaining(max_time);
        }
    }

    // Cache transaction id: unique per participant call, independent of the
    // cache key itself, so two concurrent participants on the same key never
    // collide in the cache's registration tables.
    let xid = uuid::Uuid::new_v4().to_string();

    // Step 5: cache probe.
    if let (Some(cache), Some(_)) = (pool.cache(), participant.cache_key.as_ref()) {
        let timeout = call_ctx.remaining();
        if let Some(read_keys) = participant.read_keys.clone() {
            match cache.get_read(&xid, read_keys, timeout) {
                GetOutcome::Hit(value) => {
                    // Cached result: acknowledge commit without touching the
                    // instance, still participate in the decision handshake.
                    let _ = results_tx.send((participant_index, ParticipantOutcome::Value(value)));
                    let commit = decision.wait(ctx.remaining());
                    let _ = commit; // nothing to commit/rollback for a cache hit
                    reports.lock().unwrap_or_else(|e| e.into_inner()).insert(participant_index, FinalOutcome::Committed);
                    pool.release(instance);
                    return;
                }
                GetOutcome::TimedOut => {
                    let _ = results_tx.send((
                        participant_index,
                        ParticipantOutcome::Error(
                            ResourceError::new("cache single-flight wait timed out", true, false).with_participant(participant_index),
                        ),
                    ));
                    let _ = decision.wait(ctx.remaining());
                    reports.lock().unwrap_or_else(|e| e.into_inner()).insert(participant_index, FinalOutcome::RolledBack);
                    pool.release(instance);
                    return;
                }
                GetOutcome::Proceed => {}
            }
        } else if let Some(write_keys) = participant.write_keys.clone() {
            let _ = cache.get_write(&xid, write_keys);
        }
    }

    // Step 6: min-time check.
    if call_ctx.remaining() < instance.lifecycle().min_time() {
        let _ = results_tx.send((
            participant_index,
            ParticipantOutcome::Error(
                ResourceError::new("insufficient remaining time for resource's min_time", true, false).with_participant(participant_index),
            ),
        ));
        let _ = decision.wait(ctx.remaining());
        reports.lock().unwrap_or_else(|e| e.into_inner()).insert(participant_index, FinalOutcome::RolledBack);
        pool.release(instance);
        return;
    }

    // Step 7: begin transaction. Reuses the cache transaction id minted above
    // (cheap and just as unique) rather than generating a second one.
    if let Err(e) = instance.begin_transaction(TransactionContext {
        xid: xid.clone(),
        source_module,
        options: participant.kwargs.clone(),
    }) {
        instance.lifecycle().expire();
        let _ = results_tx.send((participant_index, ParticipantOutcome::Error(e.with_participant(participant_index))));
        let _ = decision.wait(ctx.remaining());
        reports.lock().unwrap_or_else(|e| e.into_inner()).insert(participant_index, FinalOutcome::RollbackFailed);
        pool.release(instance);
        return;
    }

    // Step 8: dispatch.
    let call_started = Instant::now();
    let call_result = instance.call(&participant.attr_chain, &participant.args, &participant.kwargs, &call_ctx);
    let elapsed = call_started.elapsed();

    // Step 9: cache publish.
    if let (Some(cache), Some(_)) = (pool.cache(), participant.cache_key.as_ref()) {
        if participant.read_keys.is_some() {
            let ttl = participant.cache_ttl;
            let weight = participant.cache_weight.or(Some(elapsed.as_secs_f64()));
            let group = participant.cache_group.clone();
            match &call_result {
                Ok(value) => cache.put_read(&xid, Some(value.clone()), ttl, weight, group),
                Err(_) => cache.put_read(&xid, None, ttl, weight, group),
            }
        } else if participant.write_keys.is_some() {
            cache.put_write(&xid);
        }
    }

    // Step 10: push intermediate result. A terminal error means the
    // instance must never serve another caller, regardless of how the
    // transaction as a whole resolves.
    let call_failed = call_result.is_err();
    match call_result {
        Ok(value) => {
            let _ = results_tx.send((participant_index, ParticipantOutcome::Value(value)));
        }
        Err(e) => {
            if e.terminal {
                instance.lifecycle().expire();
            }
            let _ = results_tx.send((participant_index, ParticipantOutcome::Error(e.with_participant(participant_index))));
        }
    }

    // Step 11: wait for the transaction's overall decision, bounded by the
    // request deadline. A timeout is treated as rollback.
    let overall_commit = decision.wait(ctx.remaining());

    // Step 12: commit or rollback. A participant that already failed must
    // never commit, even if the transaction as a whole decided to.
    let should_commit = overall_commit && !call_failed;
    let outcome = if should_commit {
        match instance.commit() {
            Ok(()) => FinalOutcome::Committed,
            Err(_) => {
                instance.lifecycle().expire();
                FinalOutcome::CommitFailed
            }
        }
    } else {
        match instance.rollback() {
            Ok(()) => FinalOutcome::RolledBack,
            Err(_) => {
                instance.lifecycle().expire();
                FinalOutcome::RollbackFailed
            }
        }
    };
    reports.lock().unwrap_or_else(|e| e.into_inner()).insert(participant_index, outcome);

    // Step 13: release.
    pool.release(instance);
}

/// A transaction: an ordered list of participants, an accept predicate, and
/// the shared machinery (results channel, decision signal) that drives them
/// through the 13-step protocol.
pub struct Transaction {
    xid: String,
    source_module: String,
    participants: Vec<Participant>,
    accept: Box<AcceptFn>,
    sync_commit: bool,
}

impl Transaction {
    pub fn new(source_module: impl Into<String>) -> Self {
        Self {
            xid: uuid::Uuid::new_v4().to_string(),
            source_module: source_module.into(),
            participants: Vec::new(),
            accept: Box::new(accept_default),
            sync_commit: true,
        }
    }

    pub fn xid(&self) -> &str {
        &self.xid
    }

    pub fn attach(&mut self, participant: Participant) -> usize {
        self.participants.push(participant);
        self.participants.len() - 1
    }

    pub fn with_accept(mut self, accept: Box<AcceptFn>) -> Self {
        self.accept = accept;
        self
    }

    pub fn with_sync_commit(mut self, sync_commit: bool) -> Self {
        self.sync_commit = sync_commit;
        self
    }

    /// Fans out every participant to its resource's worker pool, drains the
    /// shared result queue applying `accept` after each arrival, broadcasts
    /// the commit/rollback decision, and (if `sync_commit`) waits for every
    /// participant to report its final outcome.
    pub fn execute(
        self,
        ctx: &RequestContext,
        resolve_pool: impl Fn(&str) -> Result<(Arc<ResourcePool>, Arc<ParticipantWorkerPool>), CoordinatorError>,
    ) -> Result<Value, CoordinatorError> {
        let n = self.participants.len();
        if n == 0 {
            return Ok(Value::Array(Vec::new()));
        }

        let (results_tx, results_rx) = mpsc::channel::<(usize, ParticipantOutcome)>();
        let decision = Arc::new(Decision::new());
        let reports: ReportMap = Arc::new(Mutex::new(HashMap::new()));

        for (index, participant) in self.participants.iter().enumerate() {
            let (pool, worker_pool) = resolve_pool(&participant.resource_name)?;
            let unit = PendingUnit {
                participant_index: index,
                participant: participant.clone(),
                pool,
                ctx: ctx.fork(),
                source_module: self.source_module.clone(),
                started_at: Instant::now(),
                decision: Arc::clone(&decision),
                reports: Arc::clone(&reports),
                results_tx: results_tx.clone(),
            };
            worker_pool.submit(unit);
        }

        let mut results: Vec<Option<ParticipantOutcome>> = vec![None; n];
        let deadline = Instant::now() + ctx.remaining();

        let decided = loop {
            let now = Instant::now();
            if now >= deadline {
                let missing = results.iter().position(Option::is_none);
                decision.broadcast(false);
                return Err(CoordinatorError::TransactionExecution {
                    participant_index: missing,
                    reason: "request deadline exceeded while waiting for participant results".to_string(),
                });
            }
            match results_rx.recv_timeout(deadline - now) {
                Ok((index, outcome)) => {
                    results[index] = Some(outcome);
                    match (self.accept)(&results) {
                        AcceptDecision::WaitForMore => continue,
                        AcceptDecision::Commit(value) => break Ok(value),
                        AcceptDecision::Rollback(err) => break Err(err),
                    }
                }
                Err(_) => {
                    let missing = results.iter().position(Option::is_none);
                    decision.broadcast(false);
                    return Err(CoordinatorError::TransactionExecution {
                        participant_index: missing,
                        reason: "request deadline exceeded while waiting for participant results".to_string(),
                    });
                }
            }
        };

        if results.iter().any(Option::is_none) {
            warn!("transaction {} decided before hearing from every participant", self.xid);
        }

        decision.broadcast(decided.is_ok());

        if self.sync_commit {
            let sync_deadline = Instant::now() + ctx.remaining();
            for index in 0..n {
                loop {
                    if reports.lock().unwrap_or_else(|e| e.into_inner()).contains_key(&index) {
                        break;
                    }
                    if Instant::now() >= sync_deadline {
                        return Err(CoordinatorError::TransactionCommit { participant_index: index });
                    }
                    thread::sleep(Duration::from_millis(1));
                }
            }
            for (index, outcome) in (0..n).map(|i| (i, reports.lock().unwrap_or_else(|e| e.into_inner()).get(&i).copied())) {
                if matches!(outcome, Some(FinalOutcome::CommitFailed)) {
                    return Err(CoordinatorError::TransactionCommit { participant_index: index });
                }
            }
        }

        decided
    }
}

/// Unwraps a single-participant transaction's result from its singleton
/// tuple. Sugar, not a different execution path: `resource_name.attr_chain
/// (args)` called directly is exactly this.
pub fn execute_single(
    participant: Participant,
    source_module: &str,
    ctx: &RequestContext,
    resolve_pool: impl Fn(&str) -> Result<(Arc<ResourcePool>, Arc<ParticipantWorkerPool>), CoordinatorError>,
) -> Result<Value, CoordinatorError> {
    let mut xa = Transaction::new(source_module);
    xa.attach(participant);
    let result = xa.execute(ctx, resolve_pool)?;
    match result {
        Value::Array(mut values) if values.len() == 1 => Ok(values.remove(0)),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_accept_waits_until_all_present() {
        let results = vec![None, None];
        assert!(matches!(accept_default(&results), AcceptDecision::WaitForMore));
    }

    #[test]
    fn default_accept_commits_tuple_when_all_present() {
        let results = vec![Some(ParticipantOutcome::Value(Value::from(1))), Some(ParticipantOutcome::Value(Value::from(2)))];
        match accept_default(&results) {
            AcceptDecision::Commit(Value::Array(values)) => assert_eq!(values, vec![Value::from(1), Value::from(2)]),
            _ => panic!("expected commit"),
        }
    }

    #[test]
    fn default_accept_rolls_back_on_first_error() {
        let results = vec![
            Some(ParticipantOutcome::Value(Value::from(1))),
            Some(ParticipantOutcome::Error(ResourceError::new("boom", false, true))),
        ];
        match accept_default(&results) {
            AcceptDecision::Rollback(CoordinatorError::Resource(e)) => {
                assert_eq!(e.participant_index, Some(1));
            }
            _ => panic!("expected rollback"),
        }
    }

    #[test]
    fn decision_timeout_is_treated_as_rollback() {
        let decision = Decision::new();
        assert!(!decision.wait(Duration::from_millis(20)));
    }

    #[test]
    fn decision_broadcast_is_observed() {
        let decision = Arc::new(Decision::new());
        let d2 = Arc::clone(&decision);
        let handle = thread::spawn(move || d2.wait(Duration::from_secs(2)));
        thread::sleep(Duration::from_millis(20));
        decision.broadcast(true);
        assert!(handle.join().unwrap());
    }
}
