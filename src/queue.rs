// =============================================================================
// Entity Work Queue: one state machine per (entity, date)
// =============================================================================
//
//   Pending ──fetch──▶ Inferring ──infer──▶ Verifying ──verify──▶ Complete
//      │                   │                    │                  Excluded
//      └───────────────────┴────────────────────┴──────────────────▶ Failed
//
// A stage worker claims a unit with `dequeue_ready` and gets a `Ticket`.  The
// unit stays claimed until the worker hands its result back with `advance`.
// Cancelling or resetting a unit bumps its ticket, so a late result from a
// worker that was still running is discarded instead of resurrecting it.
//
// All bookkeeping sits behind one mutex.  Every transition pings a `Notify`
// so idle workers and the assembler re-check without polling.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::context::MergedContext;
use crate::error::UnitFailure;
use crate::inference::InferenceResult;
use crate::types::{Stage, WorkKey, WorkState};
use crate::verification::VerificationVerdict;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Proof that a worker holds a unit for one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub key: WorkKey,
    pub stage: Stage,
    id: u64,
}

/// Snapshot of a unit handed to a stage worker.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub key: WorkKey,
    pub state: WorkState,
    /// Submission order.
    pub seq: u64,
    pub deadline: Option<Instant>,
    pub ticket: Ticket,
    /// Present from the infer stage on.
    pub context: Option<Arc<MergedContext>>,
    /// Present from the verify stage on.
    pub inference: Option<Arc<InferenceResult>>,
}

/// A verified score, kept whether or not it cleared the threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredSignal {
    pub key: WorkKey,
    pub score: f64,
    pub confidence: f64,
    pub model: String,
    pub sources: Vec<String>,
}

/// Final result of a unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnitOutcome {
    Complete(ScoredSignal),
    Excluded(ScoredSignal),
    Failed(UnitFailure),
}

impl UnitOutcome {
    pub fn state(&self) -> WorkState {
        match self {
            Self::Complete(_) => WorkState::Complete,
            Self::Excluded(_) => WorkState::Excluded,
            Self::Failed(_) => WorkState::Failed,
        }
    }
}

/// What a stage worker reports back.
#[derive(Debug)]
pub enum StageOutcome {
    Fetched(MergedContext),
    Inferred(InferenceResult),
    Verified(VerificationVerdict),
    Failed(UnitFailure),
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    /// New unit created.
    Enqueued,
    /// Unit already in flight; nothing changed.
    AlreadyQueued(WorkState),
    /// Unit already finished; its result is returned unchanged.
    Cached(UnitOutcome),
    /// A failed unit was reset to `Pending`.
    Requeued,
}

/// Per-date counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DateProgress {
    pub total: usize,
    pub in_flight: usize,
    pub complete: usize,
    pub excluded: usize,
    pub failed: usize,
}

impl DateProgress {
    pub fn settled(&self) -> bool {
        self.in_flight == 0
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Entry {
    unit: WorkUnit,
    /// Claimed by a worker.
    busy: bool,
    outcome: Option<UnitOutcome>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<WorkKey, Entry>,
    next_seq: u64,
    next_ticket: u64,
}

impl Inner {
    fn ticket(&mut self, key: &WorkKey, stage: Stage) -> Ticket {
        self.next_ticket += 1;
        Ticket {
            key: key.clone(),
            stage,
            id: self.next_ticket,
        }
    }
}

pub struct EntityWorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    urgency_window: Duration,
}

impl EntityWorkQueue {
    pub fn new(urgency_window: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            urgency_window,
        }
    }

    /// Future that resolves on the next transition. Call `enable()` on it
    /// before re-checking the queue so no wake-up is lost.
    pub fn changed(&self) -> Notified<'_> {
        self.notify.notified()
    }

    fn wake(&self) {
        self.notify.notify_waiters();
    }

    /// Submit `entity_id` for `as_of`. Idempotent per key.
    pub fn enqueue(&self, entity_id: &str, as_of: NaiveDate, deadline: Option<Instant>) -> EnqueueOutcome {
        let key = WorkKey::new(entity_id, as_of);
        let outcome = {
            let mut inner = self.inner.lock();
            let seq = inner.next_seq;

            let existing = inner
                .entries
                .get(&key)
                .map(|e| (e.unit.state, e.outcome.clone()));

            match existing {
                Some((state, Some(cached))) if matches!(state, WorkState::Complete | WorkState::Excluded) => {
                    return EnqueueOutcome::Cached(cached);
                }
                Some((WorkState::Failed, _)) => {
                    inner.next_seq += 1;
                    let ticket = inner.ticket(&key, Stage::Fetch);
                    if let Some(entry) = inner.entries.get_mut(&key) {
                        entry.unit.state = WorkState::Pending;
                        entry.unit.seq = seq;
                        entry.unit.ticket = ticket;
                        entry.unit.context = None;
                        entry.unit.inference = None;
                        if deadline.is_some() {
                            entry.unit.deadline = deadline;
                        }
                        entry.busy = false;
                        entry.outcome = None;
                    }
                    EnqueueOutcome::Requeued
                }
                Some((state, _)) => return EnqueueOutcome::AlreadyQueued(state),
                None => {
                    inner.next_seq += 1;
                    let ticket = inner.ticket(&key, Stage::Fetch);
                    inner.entries.insert(
                        key.clone(),
                        Entry {
                            unit: WorkUnit {
                                key: key.clone(),
                                state: WorkState::Pending,
                                seq,
                                deadline,
                                ticket,
                                context: None,
                                inference: None,
                            },
                            busy: false,
                            outcome: None,
                        },
                    );
                    EnqueueOutcome::Enqueued
                }
            }
        };

        debug!(key = %key, outcome = ?outcome, "enqueued");
        self.wake();
        outcome
    }

    /// Claim the next unit ready for `stage`.
    ///
    /// FIFO by submission order, except that units whose deadline falls
    /// within the urgency window go first, earliest deadline first.
    pub fn dequeue_ready(&self, stage: Stage, now: Instant) -> Option<WorkUnit> {
        let mut inner = self.inner.lock();
        let ready = stage.ready_state();
        let horizon = now + self.urgency_window;

        let candidates = inner
            .entries
            .values()
            .filter(|e| !e.busy && e.unit.state == ready)
            .map(|e| &e.unit);

        let mut urgent: Option<&WorkUnit> = None;
        let mut oldest: Option<&WorkUnit> = None;
        for unit in candidates {
            if let Some(deadline) = unit.deadline.filter(|d| *d <= horizon) {
                let better = urgent.map_or(true, |u| {
                    (deadline, unit.seq) < (u.deadline.unwrap_or(deadline), u.seq)
                });
                if better {
                    urgent = Some(unit);
                }
            }
            if oldest.map_or(true, |u| unit.seq < u.seq) {
                oldest = Some(unit);
            }
        }
        let key = urgent.or(oldest)?.key.clone();

        let ticket = inner.ticket(&key, stage);
        let entry = inner.entries.get_mut(&key)?;
        entry.busy = true;
        entry.unit.ticket = ticket;
        if stage == Stage::Fetch {
            entry.unit.state = WorkState::Fetching;
        }
        debug!(key = %key, stage = %stage, "claimed");
        Some(entry.unit.clone())
    }

    /// Record a stage result. Returns `false` when the ticket is stale and
    /// the result was discarded.
    pub fn advance(&self, ticket: &Ticket, outcome: StageOutcome) -> bool {
        let accepted = {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.entries.get_mut(&ticket.key) else {
                return false;
            };
            if !entry.busy || entry.unit.ticket != *ticket {
                debug!(key = %ticket.key, stage = %ticket.stage, "stale result discarded");
                return false;
            }
            entry.busy = false;

            match (ticket.stage, outcome) {
                (_, StageOutcome::Failed(failure)) => {
                    entry.unit.state = WorkState::Failed;
                    entry.outcome = Some(UnitOutcome::Failed(failure));
                }
                (Stage::Fetch, StageOutcome::Fetched(context)) => {
                    entry.unit.context = Some(Arc::new(context));
                    entry.unit.state = WorkState::Inferring;
                }
                (Stage::Infer, StageOutcome::Inferred(result)) => {
                    entry.unit.inference = Some(Arc::new(result));
                    entry.unit.state = WorkState::Verifying;
                }
                (Stage::Verify, StageOutcome::Verified(verdict)) => {
                    let Some(inference) = entry.unit.inference.as_ref() else {
                        entry.busy = true;
                        return false;
                    };
                    let signal = ScoredSignal {
                        key: entry.unit.key.clone(),
                        score: inference.score,
                        confidence: verdict.confidence,
                        model: inference.model.clone(),
                        sources: entry
                            .unit
                            .context
                            .as_ref()
                            .map(|c| c.sources().to_vec())
                            .unwrap_or_default(),
                    };
                    if verdict.passed() {
                        entry.unit.state = WorkState::Complete;
                        entry.outcome = Some(UnitOutcome::Complete(signal));
                    } else {
                        entry.unit.state = WorkState::Excluded;
                        entry.outcome = Some(UnitOutcome::Excluded(signal));
                    }
                }
                (stage, other) => {
                    // Result for a different stage than the one claimed.
                    debug!(key = %ticket.key, stage = %stage, outcome = ?other, "mismatched stage result");
                    entry.busy = true;
                    return false;
                }
            }
            debug!(key = %ticket.key, state = %entry.unit.state, "advanced");
            true
        };

        self.wake();
        accepted
    }

    /// Fail every non-terminal unit of `as_of` with `DeadlineExceeded`.
    /// Outstanding tickets become stale. Returns each cancelled key with the
    /// state it was in.
    pub fn cancel_date(&self, as_of: NaiveDate) -> Vec<(WorkKey, WorkState)> {
        let cancelled = {
            let mut inner = self.inner.lock();
            let keys: Vec<WorkKey> = inner
                .entries
                .iter()
                .filter(|(k, e)| k.as_of == as_of && !e.unit.state.is_terminal())
                .map(|(k, _)| k.clone())
                .collect();

            let mut cancelled = Vec::with_capacity(keys.len());
            for key in keys {
                let ticket = inner.ticket(&key, Stage::Fetch);
                if let Some(entry) = inner.entries.get_mut(&key) {
                    let state = entry.unit.state;
                    entry.unit.state = WorkState::Failed;
                    entry.unit.ticket = ticket;
                    entry.busy = false;
                    entry.outcome = Some(UnitOutcome::Failed(UnitFailure::DeadlineExceeded { state }));
                    cancelled.push((key, state));
                }
            }
            cancelled
        };

        if !cancelled.is_empty() {
            debug!(as_of = %as_of, cancelled = cancelled.len(), "date cancelled");
            self.wake();
        }
        cancelled
    }

    /// Drop every unit of `as_of`. Returns how many were removed.
    pub fn release_date(&self, as_of: NaiveDate) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|k, _| k.as_of != as_of);
        before - inner.entries.len()
    }

    pub fn progress(&self, as_of: NaiveDate) -> DateProgress {
        let inner = self.inner.lock();
        let mut p = DateProgress::default();
        for entry in inner.entries.values().filter(|e| e.unit.key.as_of == as_of) {
            p.total += 1;
            match entry.unit.state {
                WorkState::Complete => p.complete += 1,
                WorkState::Excluded => p.excluded += 1,
                WorkState::Failed => p.failed += 1,
                _ => p.in_flight += 1,
            }
        }
        p
    }

    /// Terminal outcomes for `as_of`, in submission order.
    pub fn outcomes(&self, as_of: NaiveDate) -> Vec<(WorkKey, UnitOutcome)> {
        let inner = self.inner.lock();
        let mut out: Vec<(u64, WorkKey, UnitOutcome)> = inner
            .entries
            .values()
            .filter(|e| e.unit.key.as_of == as_of)
            .filter_map(|e| e.outcome.clone().map(|o| (e.unit.seq, e.unit.key.clone(), o)))
            .collect();
        out.sort_by_key(|(seq, _, _)| *seq);
        out.into_iter().map(|(_, k, o)| (k, o)).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for EntityWorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityWorkQueue")
            .field("units", &self.len())
            .field("urgency_window", &self.urgency_window)
            .finish()
    }
}
