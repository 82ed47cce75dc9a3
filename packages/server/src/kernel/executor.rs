//! Bounded executor with adaptive concurrency.
//!
//! A worker-pool admission gate used by the research agent to fan sub-queries
//! out against the provider. Admission is FIFO through a bounded waiter queue;
//! the effective concurrency limit adapts with an
//! additive-increase/multiplicative-decrease policy: +1 after a run of
//! consecutive successes, halved on failure or a rate-limit signal, floored
//! at 1 and capped at the configured maximum.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::common::error::{ResearchError, Result};

/// Configuration for the bounded executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Hard upper bound on concurrent tasks
    pub max_concurrency: usize,
    /// Concurrency the pool starts at (adapts from here)
    pub initial_concurrency: usize,
    /// Maximum number of callers allowed to wait for a slot
    pub queue_capacity: usize,
    /// Per-task deadline
    pub task_timeout: Duration,
    /// Consecutive successes required for an additive +1
    pub increase_after: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            initial_concurrency: 2,
            queue_capacity: 64,
            task_timeout: Duration::from_secs(120),
            increase_after: 3,
        }
    }
}

struct ExecState {
    limit: usize,
    in_flight: usize,
    consecutive_successes: u32,
    /// Queued waiters in arrival order, keyed so a cancelled waiter can
    /// take itself back out of the queue.
    waiters: VecDeque<(u64, oneshot::Sender<()>)>,
    next_waiter_id: u64,
}

/// FIFO worker-pool gate with AIMD concurrency control.
pub struct BoundedExecutor {
    config: ExecutorConfig,
    state: Mutex<ExecState>,
}

impl BoundedExecutor {
    /// Create a new executor.
    pub fn new(config: ExecutorConfig) -> Self {
        let limit = config
            .initial_concurrency
            .clamp(1, config.max_concurrency.max(1));
        Self {
            state: Mutex::new(ExecState {
                limit,
                in_flight: 0,
                consecutive_successes: 0,
                waiters: VecDeque::new(),
                next_waiter_id: 0,
            }),
            config,
        }
    }

    /// Current adaptive concurrency limit.
    pub fn current_limit(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).limit
    }

    /// Number of tasks currently running.
    pub fn in_flight(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .in_flight
    }

    /// Run a task under the pool: waits for a slot (FIFO), enforces the
    /// per-task timeout, and propagates cancellation.
    pub async fn run<T, F>(&self, cancel: &CancellationToken, task: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.acquire(cancel).await?;

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(ResearchError::Cancelled),
            result = tokio::time::timeout(self.config.task_timeout, task) => match result {
                Ok(inner) => inner,
                Err(_) => Err(ResearchError::Timeout(format!(
                    "task exceeded {:?}",
                    self.config.task_timeout
                ))),
            },
        };

        match &outcome {
            Ok(_) => self.record_success(),
            Err(ResearchError::Cancelled) => {}
            Err(e) => self.record_failure(e.code()),
        }

        self.release();
        outcome
    }

    async fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            let (waiter_id, mut rx) = {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if state.in_flight < state.limit {
                    state.in_flight += 1;
                    return Ok(());
                }
                if state.waiters.len() >= self.config.queue_capacity {
                    return Err(ResearchError::Internal(
                        "executor queue full, try again later".into(),
                    ));
                }
                let (tx, rx) = oneshot::channel();
                let waiter_id = state.next_waiter_id;
                state.next_waiter_id += 1;
                state.waiters.push_back((waiter_id, tx));
                (waiter_id, rx)
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    // Cancellation can race the handoff in wake_waiters: the
                    // grant may already have been sent and the slot counted
                    // against in_flight. Resolve under the lock, where no
                    // send can be in progress.
                    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                    let before = state.waiters.len();
                    state.waiters.retain(|(id, _)| *id != waiter_id);
                    let still_queued = state.waiters.len() != before;
                    if !still_queued && rx.try_recv().is_ok() {
                        // The slot was already ours; hand it back.
                        state.in_flight = state.in_flight.saturating_sub(1);
                        Self::wake_waiters(&mut state);
                    }
                    return Err(ResearchError::Cancelled);
                }
                granted = &mut rx => {
                    if granted.is_ok() {
                        // Slot was transferred to us in wake_waiters;
                        // in_flight is already accounted for.
                        return Ok(());
                    }
                    // Sender dropped without granting; retry from the top.
                }
            }
        }
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.in_flight = state.in_flight.saturating_sub(1);
        Self::wake_waiters(&mut state);
    }

    fn record_success(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.consecutive_successes += 1;
        if state.consecutive_successes >= self.config.increase_after
            && state.limit < self.config.max_concurrency
        {
            state.limit += 1;
            state.consecutive_successes = 0;
            debug!(limit = state.limit, "executor concurrency increased");
            Self::wake_waiters(&mut state);
        }
    }

    fn record_failure(&self, code: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.consecutive_successes = 0;
        let new_limit = (state.limit / 2).max(1);
        if new_limit != state.limit {
            debug!(limit = new_limit, code, "executor concurrency decreased");
            state.limit = new_limit;
        }
    }

    /// Hand freed slots to queued waiters in arrival order.
    fn wake_waiters(state: &mut ExecState) {
        while state.in_flight < state.limit {
            match state.waiters.pop_front() {
                Some((_, tx)) => {
                    // Transfer the slot; a receiver that gave up is skipped.
                    if tx.send(()).is_ok() {
                        state.in_flight += 1;
                    }
                }
                None => break,
            }
        }
    }
}
