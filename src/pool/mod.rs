//! Persistent worker pool that searches one contiguous index slice at a time.
//!
//! # Architecture
//!
//! ```text
//!                 run_slice(verifier, start, count, every, ...)
//!                        │ publish JobState (version++)
//!                        ▼
//!   ┌───────────────────────────────────────────────────────────┐
//!   │                       Shared cell                          │
//!   │   Mutex<JobCell { version, job }> + Condvar wake           │
//!   └──────┬───────────────┬───────────────┬────────────────────┘
//!          ▼               ▼               ▼
//!      worker 0        worker 1        worker T-1
//!          │               │               │
//!          └── fetch_add(next_rel) ── verify ── done.set(rel) ───┐
//!                                                                ▼
//!                                    progress mutex: prefix scan + checkpoints
//!          │               │               │
//!          └───────────────┴───────────────┴──► latch.count_down()
//!                                                        │
//!                        run_slice unblocks ◄────────────┘
//! ```
//!
//! # Correctness Invariants
//!
//! - Threads are created once and survive across jobs; `run_slice` returns
//!   only after every worker has signalled the per-job latch, panics
//!   included.
//! - Every relative index in `[0, count)` is handed out exactly once via
//!   `fetch_add` on `next_rel`, uniformly from zero.
//! - `sum(per_worker_tried) == total_tried` at every quiescent point.
//! - Checkpoint `tried` values are strictly increasing; checkpoint `m`
//!   means "the first `m` indices of the slice have all been verified";
//!   the terminal checkpoint fires exactly once.
//! - At most one password is ever published per job (CAS claim); a match
//!   also raises the job stop flag.
//! - Cancellation is cooperative: a stop flag is polled each iteration and
//!   an in-flight verify always completes.

mod progress;

pub use progress::{DoneMap, ProgressState};

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::alphabet::Alphabet;
use crate::verifier::{CandidateVerifier, VerifyError};

/// Largest admissible slice: the per-index bitmap must stay addressable.
pub const MAX_SLICE_COUNT: u64 = i32::MAX as u64;

/// Errors that make `run_slice` refuse to start, or fail as a whole.
#[derive(Debug)]
#[non_exhaustive]
pub enum SliceError {
    /// `count` outside `1..=MAX_SLICE_COUNT`.
    InvalidCount { count: u64 },
    /// `checkpoint_every` was zero.
    InvalidCheckpointPeriod,
    /// `start_index + count - 1` is not an enumerable candidate index.
    IndexRange { start_index: u64, count: u64 },
    /// The verifier reported a fatal error (crypt binding unavailable).
    Verify(VerifyError),
}

impl fmt::Display for SliceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCount { count } => {
                write!(f, "slice count {count} outside 1..={MAX_SLICE_COUNT}")
            }
            Self::InvalidCheckpointPeriod => write!(f, "checkpoint period must be >= 1"),
            Self::IndexRange { start_index, count } => {
                write!(f, "slice [{start_index}, {start_index}+{count}) exceeds the candidate space")
            }
            Self::Verify(e) => write!(f, "slice aborted: {e}"),
        }
    }
}

impl std::error::Error for SliceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Verify(e) => Some(e),
            _ => None,
        }
    }
}

/// Outcome of one fully processed slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceResult {
    /// Whether a candidate matched.
    pub found: bool,
    /// The matching candidate, when found.
    pub password: Option<String>,
    /// Total verifications performed across all workers.
    pub tried: u64,
    /// Wall-clock time from publication to the last worker draining.
    pub duration: Duration,
}

impl SliceResult {
    /// Duration in whole milliseconds, as reported on the wire.
    pub fn duration_ms(&self) -> u64 {
        self.duration.as_millis() as u64
    }
}

/// Receives progress events for one slice.
///
/// Callbacks run on worker threads. `on_checkpoint` is serialized by the
/// job's progress mutex, so implementations see strictly increasing `tried`
/// values and need no ordering logic of their own, but they must not block
/// for long, since they hold up prefix commits.
pub trait SliceObserver: Send + Sync {
    /// A worker slot picked up the job. Emitted once per slot per job.
    fn on_worker_start(&self, slot: usize, thread: thread::ThreadId) {
        let _ = (slot, thread);
    }

    /// The first `tried` indices of the slice have all been verified.
    /// `per_worker` is a snapshot of verification counts by worker slot.
    fn on_checkpoint(&self, tried: u64, per_worker: &[u64]);
}

/// Observer that discards all events.
pub struct NullObserver;

impl SliceObserver for NullObserver {
    fn on_checkpoint(&self, _tried: u64, _per_worker: &[u64]) {}
}

// ============================================================================
// Internal job state
// ============================================================================

/// Countdown latch: `run_slice` blocks until every worker checks in.
struct Latch {
    remaining: Mutex<usize>,
    drained: Condvar,
}

impl Latch {
    fn new(n: usize) -> Self {
        Self {
            remaining: Mutex::new(n),
            drained: Condvar::new(),
        }
    }

    fn count_down(&self) {
        let mut left = self.remaining.lock().expect("latch mutex poisoned");
        *left = left.checked_sub(1).expect("latch counted down too often");
        if *left == 0 {
            self.drained.notify_all();
        }
    }

    fn wait(&self) {
        let mut left = self.remaining.lock().expect("latch mutex poisoned");
        while *left > 0 {
            left = self.drained.wait(left).expect("latch mutex poisoned");
        }
    }
}

/// Counts the latch down exactly once on scope exit, panics included.
struct LatchGuard<'a>(&'a Latch);

impl Drop for LatchGuard<'_> {
    fn drop(&mut self) {
        self.0.count_down();
    }
}

/// All shared state for one published job. Immutable configuration up top,
/// atomics below; see the shared-resource policy in the module docs.
struct JobState {
    verifier: Arc<dyn CandidateVerifier>,
    alphabet: Alphabet,
    start_index: u64,
    count: u64,
    checkpoint_every: u64,

    next_rel: AtomicU64,
    done: DoneMap,
    per_worker: Vec<AtomicU64>,
    total: AtomicU64,

    /// Internal stop: set on match, fatal error, or reflected external stop.
    stop: AtomicBool,
    /// External stop hook owned by the caller (e.g. the node FSM on STOP).
    external_stop: Arc<AtomicBool>,

    /// First-writer-wins claim on the result.
    found: AtomicBool,
    password: Mutex<Option<String>>,
    fatal: Mutex<Option<VerifyError>>,

    progress: Mutex<ProgressState>,
    observer: Arc<dyn SliceObserver>,
    latch: Latch,
}

impl JobState {
    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire) || self.external_stop.load(Ordering::Acquire)
    }

    /// Advances the committed prefix and emits any crossed checkpoints.
    /// Serialized by the progress mutex.
    fn update_progress(&self) {
        let mut progress = self.progress.lock().expect("progress mutex poisoned");
        let milestones = progress.advance(&self.done, self.count, self.checkpoint_every);
        if milestones.is_empty() {
            return;
        }
        let mut snapshot = vec![0u64; self.per_worker.len()];
        for m in milestones {
            for (dst, src) in snapshot.iter_mut().zip(&self.per_worker) {
                *dst = src.load(Ordering::Relaxed);
            }
            self.observer.on_checkpoint(m, &snapshot);
        }
    }

    fn publish_match(&self, candidate: String) {
        if self
            .found
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            *self.password.lock().expect("password mutex poisoned") = Some(candidate);
            self.stop.store(true, Ordering::Release);
        }
    }

    fn record_fatal(&self, err: VerifyError) {
        let mut fatal = self.fatal.lock().expect("fatal mutex poisoned");
        if fatal.is_none() {
            *fatal = Some(err);
        }
        self.stop.store(true, Ordering::Release);
    }
}

// ============================================================================
// The pool
// ============================================================================

struct JobCell {
    version: u64,
    job: Option<Arc<JobState>>,
}

struct Shared {
    cell: Mutex<JobCell>,
    wake: Condvar,
    shutdown: AtomicBool,
}

/// Fixed-size pool of search threads, created once per process.
///
/// One job runs at a time; `run_slice` calls are internally serialized.
/// Dropping the pool signals shutdown and joins every thread.
pub struct WorkerPool {
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
    threads: usize,
    alphabet: Alphabet,
    run_serial: Mutex<()>,
}

impl WorkerPool {
    /// Spawns `threads` workers over the standard 79-character alphabet.
    ///
    /// # Panics
    ///
    /// Panics if `threads` is zero; pool size is a construction-time
    /// configuration error, not a per-job condition.
    pub fn new(threads: usize) -> Self {
        Self::with_alphabet(threads, Alphabet::standard())
    }

    /// Spawns `threads` workers using a caller-provided alphabet.
    pub fn with_alphabet(threads: usize, alphabet: Alphabet) -> Self {
        assert!(threads >= 1, "worker pool requires at least one thread");
        let shared = Arc::new(Shared {
            cell: Mutex::new(JobCell { version: 0, job: None }),
            wake: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let handles = (0..threads)
            .map(|slot| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("cracker-worker-{slot}"))
                    .spawn(move || worker_loop(slot, shared))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self {
            shared,
            handles,
            threads,
            alphabet,
            run_serial: Mutex::new(()),
        }
    }

    /// Number of worker threads (fixed for the pool's lifetime).
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Searches the half-open slice `[start_index, start_index + count)`,
    /// blocking until all workers drain.
    ///
    /// `external_stop` is polled every iteration; raising it prevents new
    /// iterations without aborting an in-flight verify. Checkpoints land on
    /// `observer` every `checkpoint_every` committed indices.
    pub fn run_slice(
        &self,
        verifier: Arc<dyn CandidateVerifier>,
        start_index: u64,
        count: u64,
        checkpoint_every: u64,
        external_stop: Arc<AtomicBool>,
        observer: Arc<dyn SliceObserver>,
    ) -> Result<SliceResult, SliceError> {
        if count == 0 || count > MAX_SLICE_COUNT {
            return Err(SliceError::InvalidCount { count });
        }
        if checkpoint_every == 0 {
            return Err(SliceError::InvalidCheckpointPeriod);
        }
        let last = start_index
            .checked_add(count - 1)
            .ok_or(SliceError::IndexRange { start_index, count })?;
        if self.alphabet.index_to_candidate(last).is_err() {
            return Err(SliceError::IndexRange { start_index, count });
        }

        let _serial = self.run_serial.lock().expect("run_slice serial mutex poisoned");

        let job = Arc::new(JobState {
            verifier,
            alphabet: self.alphabet.clone(),
            start_index,
            count,
            checkpoint_every,
            next_rel: AtomicU64::new(0),
            done: DoneMap::empty(count as usize),
            per_worker: (0..self.threads).map(|_| AtomicU64::new(0)).collect(),
            total: AtomicU64::new(0),
            stop: AtomicBool::new(false),
            external_stop,
            found: AtomicBool::new(false),
            password: Mutex::new(None),
            fatal: Mutex::new(None),
            progress: Mutex::new(ProgressState::new()),
            observer,
            latch: Latch::new(self.threads),
        });

        let started = Instant::now();
        {
            let mut cell = self.shared.cell.lock().expect("job cell mutex poisoned");
            cell.version += 1;
            cell.job = Some(Arc::clone(&job));
            self.shared.wake.notify_all();
        }

        job.latch.wait();
        let duration = started.elapsed();

        {
            let mut cell = self.shared.cell.lock().expect("job cell mutex poisoned");
            cell.job = None;
        }

        if let Some(fatal) = job.fatal.lock().expect("fatal mutex poisoned").take() {
            return Err(SliceError::Verify(fatal));
        }

        let password = job.password.lock().expect("password mutex poisoned").take();
        Ok(SliceResult {
            found: job.found.load(Ordering::Acquire),
            password,
            tried: job.total.load(Ordering::Relaxed),
            duration,
        })
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        {
            // Take the lock so a worker between check and wait cannot miss it.
            let _cell = self.shared.cell.lock().expect("job cell mutex poisoned");
            self.shared.wake.notify_all();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

// ============================================================================
// Worker body
// ============================================================================

fn worker_loop(slot: usize, shared: Arc<Shared>) {
    let mut last_version = 0u64;
    loop {
        let job = {
            let mut cell = shared.cell.lock().expect("job cell mutex poisoned");
            loop {
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                if cell.version != last_version {
                    last_version = cell.version;
                    if let Some(job) = cell.job.clone() {
                        break job;
                    }
                }
                cell = shared.wake.wait(cell).expect("job cell mutex poisoned");
            }
        };

        let _latch = LatchGuard(&job.latch);
        job.observer.on_worker_start(slot, thread::current().id());
        // A panicking verifier or observer must neither poison the pool nor
        // leave the publisher waiting; the guard above counts the latch down
        // and the catch keeps this thread alive for the next job.
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| run_job(slot, &job))) {
            job.stop.store(true, Ordering::Release);
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "opaque panic payload".into());
            tracing::error!(slot, %detail, "worker aborted job after panic");
        }
    }
}

fn run_job(slot: usize, job: &JobState) {
    loop {
        if job.stop_requested() {
            break;
        }
        let rel = job.next_rel.fetch_add(1, Ordering::Relaxed);
        if rel >= job.count {
            break;
        }

        let idx = job.start_index + rel;
        let candidate = match job.alphabet.index_to_candidate(idx) {
            Ok(c) => c,
            Err(e) => {
                // Range was validated up front; treat as tried-not-a-match so
                // the prefix keeps advancing.
                tracing::error!(idx, error = %e, "candidate decode failed mid-slice");
                record_tried(slot, job, rel);
                continue;
            }
        };

        let verdict = catch_unwind(AssertUnwindSafe(|| job.verifier.verify(&candidate)));
        let matched = match verdict {
            Ok(Ok(matched)) => matched,
            Ok(Err(fatal)) => {
                job.record_fatal(fatal);
                break;
            }
            Err(_) => {
                tracing::error!(slot, idx, "verify panicked; treating index as tried");
                false
            }
        };

        record_tried(slot, job, rel);

        if matched {
            job.publish_match(candidate);
            break;
        }
    }
}

/// Counter updates, the release-store of the done bit, and the ordered-commit
/// progress pass for one finished index.
fn record_tried(slot: usize, job: &JobState, rel: u64) {
    job.per_worker[slot].fetch_add(1, Ordering::Relaxed);
    job.total.fetch_add(1, Ordering::Relaxed);
    job.done.set(rel as usize);
    job.update_progress();
}
