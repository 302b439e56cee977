//! Lane-aware semaphore and per-group serialization.
//!
//! [`LaneGate`] is the single gate for concurrent container executions: a
//! fixed permit count with three priority lanes, `interactive >
//! scheduled > maintenance`. Two overrides keep low-priority work from
//! starving: a waiter queued longer than `lane_starvation_ms` is
//! dispatched ahead of higher lanes, and after
//! `max_consecutive_interactive` interactive grants the next permit goes
//! to a waiting lower lane.
//!
//! [`GroupLocks`] serializes everything that mutates one group's session,
//! memory, or container state. The registry is self-pruning: an entry
//! disappears once nobody holds or awaits its mutex.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use dotclaw_types::config::LaneConfig;

/// Priority class for semaphore admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    /// User-facing message handling.
    Interactive,
    /// Scheduled tasks and background jobs.
    Scheduled,
    /// Cleanup and backfill work.
    Maintenance,
}

impl Lane {
    fn index(self) -> usize {
        match self {
            Self::Interactive => 0,
            Self::Scheduled => 1,
            Self::Maintenance => 2,
        }
    }

    const ALL: [Lane; 3] = [Lane::Interactive, Lane::Scheduled, Lane::Maintenance];
}

struct Waiter {
    id: u64,
    enqueued_at: Instant,
    tx: oneshot::Sender<()>,
}

struct GateState {
    available: u32,
    queues: [VecDeque<Waiter>; 3],
    consecutive_interactive: u32,
}

struct GateInner {
    state: Mutex<GateState>,
    cfg: LaneConfig,
    next_waiter_id: AtomicU64,
}

/// The lane-aware semaphore.
#[derive(Clone)]
pub struct LaneGate {
    inner: Arc<GateInner>,
}

/// A held permit. Release is idempotent and also happens on drop, so every
/// exit path of a scoped acquisition releases exactly once.
pub struct LanePermit {
    inner: Arc<GateInner>,
    released: AtomicBool,
}

impl LaneGate {
    /// A gate with `cfg.max_agents` permits.
    pub fn new(cfg: LaneConfig) -> Self {
        Self {
            inner: Arc::new(GateInner {
                state: Mutex::new(GateState {
                    available: cfg.max_agents,
                    queues: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
                    consecutive_interactive: 0,
                }),
                cfg,
                next_waiter_id: AtomicU64::new(1),
            }),
        }
    }

    /// Acquire a permit in `lane`, waiting if none is free. Returns
    /// `None` when `cancel` fires first.
    pub async fn acquire(&self, lane: Lane, cancel: &CancellationToken) -> Option<LanePermit> {
        let (id, rx) = {
            let mut state = self.inner.state.lock();
            if state.available > 0 && state.queues.iter().all(VecDeque::is_empty) {
                state.available -= 1;
                Self::note_dispatch(&mut state, lane);
                return Some(self.permit());
            }
            let id = self.inner.next_waiter_id.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            state.queues[lane.index()].push_back(Waiter {
                id,
                enqueued_at: Instant::now(),
                tx,
            });
            (id, rx)
        };

        tokio::select! {
            granted = rx => {
                match granted {
                    Ok(()) => Some(self.permit()),
                    // Sender dropped without granting; should not happen.
                    Err(_) => None,
                }
            }
            _ = cancel.cancelled() => {
                // Either we remove ourselves from the queue, or a grant
                // raced in and must be handed back.
                let mut state = self.inner.state.lock();
                let removed = state.queues[lane.index()]
                    .iter()
                    .position(|w| w.id == id)
                    .map(|pos| state.queues[lane.index()].remove(pos));
                drop(state);
                if removed.is_none() {
                    GateInner::release(&self.inner);
                }
                None
            }
        }
    }

    /// Current free permits (diagnostics).
    pub fn available(&self) -> u32 {
        self.inner.state.lock().available
    }

    fn permit(&self) -> LanePermit {
        LanePermit {
            inner: Arc::clone(&self.inner),
            released: AtomicBool::new(false),
        }
    }

    fn note_dispatch(state: &mut GateState, lane: Lane) {
        if lane == Lane::Interactive {
            state.consecutive_interactive += 1;
        } else {
            state.consecutive_interactive = 0;
        }
    }
}

impl GateInner {
    /// Hand the freed permit to the next waiter per the lane policy, or
    /// return it to the pool.
    fn release(inner: &Arc<GateInner>) {
        let mut state = inner.state.lock();
        loop {
            let Some(lane) = GateInner::next_lane(&state, &inner.cfg) else {
                state.available += 1;
                return;
            };
            let waiter = state.queues[lane.index()]
                .pop_front()
                .expect("next_lane only returns non-empty lanes");
            LaneGate::note_dispatch(&mut state, lane);
            if waiter.tx.send(()).is_ok() {
                return;
            }
            // Receiver vanished (cancelled acquire); try the next one.
        }
    }

    /// Which lane gets the next permit.
    fn next_lane(state: &GateState, cfg: &LaneConfig) -> Option<Lane> {
        // Starvation override: the longest-waiting non-interactive waiter
        // past the threshold goes first.
        let threshold = std::time::Duration::from_millis(cfg.lane_starvation_ms);
        let starved = [Lane::Scheduled, Lane::Maintenance]
            .into_iter()
            .filter_map(|lane| {
                state.queues[lane.index()]
                    .front()
                    .filter(|w| w.enqueued_at.elapsed() >= threshold)
                    .map(|w| (lane, w.enqueued_at))
            })
            .min_by_key(|(_, enqueued)| *enqueued);
        if let Some((lane, _)) = starved {
            return Some(lane);
        }

        // Fairness override after a run of interactive dispatches.
        if state.consecutive_interactive >= cfg.max_consecutive_interactive {
            for lane in [Lane::Scheduled, Lane::Maintenance] {
                if !state.queues[lane.index()].is_empty() {
                    return Some(lane);
                }
            }
        }

        Lane::ALL
            .into_iter()
            .find(|lane| !state.queues[lane.index()].is_empty())
    }
}

impl LanePermit {
    /// Release the permit. Safe to call more than once.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            GateInner::release(&self.inner);
        }
    }
}

impl Drop for LanePermit {
    fn drop(&mut self) {
        self.release();
    }
}

// ── Per-group locks ──────────────────────────────────────────────────────

type GroupMutex = Arc<tokio::sync::Mutex<()>>;

/// Named mutexes keyed on group folder. Cheap to clone; clones share the
/// registry.
#[derive(Default, Clone)]
pub struct GroupLocks {
    map: Arc<DashMap<String, GroupMutex>>,
}

/// A held group lock; dropping it releases and prunes the registry entry
/// when no other holder or waiter remains.
pub struct GroupGuard {
    folder: String,
    map: Arc<DashMap<String, GroupMutex>>,
    _guard: tokio::sync::OwnedMutexGuard<()>,
}

impl GroupLocks {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `folder`, creating the entry on first use.
    pub async fn acquire(&self, folder: &str) -> GroupGuard {
        let mutex = self
            .map
            .entry(folder.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        GroupGuard {
            folder: folder.to_string(),
            map: Arc::clone(&self.map),
            _guard: guard,
        }
    }

    /// Number of live entries (diagnostics / tests).
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the registry has no entries.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        // The shard write lock in remove_if excludes concurrent acquires,
        // so the count check cannot race a clone: map entry + our guard's
        // Arc means strong_count == 2 exactly when nobody else is using
        // or awaiting this mutex.
        self.map
            .remove_if(&self.folder, |_, mutex| Arc::strong_count(mutex) == 2);
    }
}
