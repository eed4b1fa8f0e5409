//! Per-connection task scheduler
//!
//! Each connection owns one `Scheduler`. Timers run as small tokio tasks that
//! never touch connection state: when they fire they post the scheduled item
//! back into the connection's mailbox, so every task body executes on the
//! connection actor and is serialized with external commands.
//!
//! Every delivery carries the scheduler epoch. `reset` bumps the epoch and
//! cancels all timers, so anything already queued before the reset is
//! discarded by [`Scheduler::accept`] instead of running.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Handle to a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// A scheduled item posted back to the owner
pub struct Delivery<T> {
    id: Option<TaskId>,
    epoch: u64,
    repeating: bool,
    task: T,
    ack: Option<oneshot::Sender<()>>,
}

/// Held by the owner while it runs a delivered task; a periodic timer does
/// not start waiting for its next tick until the guard is dropped.
pub struct RunGuard {
    _ack: Option<oneshot::Sender<()>>,
}

struct Timer {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Scheduler owning the timers of one connection
pub struct Scheduler<T> {
    tx: mpsc::UnboundedSender<Delivery<T>>,
    root: CancellationToken,
    timers: HashMap<TaskId, Timer>,
    epoch: u64,
    next_id: u64,
}

impl<T: Send + 'static> Scheduler<T> {
    /// Create a scheduler and the receiver its deliveries arrive on
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Delivery<T>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                root: CancellationToken::new(),
                timers: HashMap::new(),
                epoch: 0,
                next_id: 0,
            },
            rx,
        )
    }

    /// Queue a task to run as soon as the owner is idle
    pub fn run_now(&self, task: T) {
        let _ = self.tx.send(Delivery {
            id: None,
            epoch: self.epoch,
            repeating: false,
            task,
            ack: None,
        });
    }

    /// Run a task once after `delay`
    pub fn run_after(&mut self, delay: Duration, task: T) -> TaskId {
        let id = self.allocate_id();
        let token = self.root.child_token();
        let timer_token = token.clone();
        let tx = self.tx.clone();
        let epoch = self.epoch;

        let handle = tokio::spawn(async move {
            tokio::select! {
                () = timer_token.cancelled() => {},
                () = tokio::time::sleep(delay) => {
                    let _ = tx.send(Delivery {
                        id: Some(id),
                        epoch,
                        repeating: false,
                        task,
                        ack: None,
                    });
                },
            }
        });

        self.timers.insert(id, Timer { token, handle });
        trace!("Scheduled {} after {:?}", id, delay);
        id
    }

    /// Run a task every `period`, first after `initial_delay`
    ///
    /// A tick is only posted once the previous run has finished, and missed
    /// ticks are skipped rather than queued.
    pub fn run_every(&mut self, initial_delay: Duration, period: Duration, task: T) -> TaskId
    where
        T: Clone,
    {
        let id = self.allocate_id();
        let token = self.root.child_token();
        let timer_token = token.clone();
        let tx = self.tx.clone();
        let epoch = self.epoch;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + initial_delay, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    () = timer_token.cancelled() => break,
                    _ = interval.tick() => {},
                }

                let (ack_tx, ack_rx) = oneshot::channel();
                let delivery = Delivery {
                    id: Some(id),
                    epoch,
                    repeating: true,
                    task: task.clone(),
                    ack: Some(ack_tx),
                };
                if tx.send(delivery).is_err() {
                    break;
                }

                tokio::select! {
                    () = timer_token.cancelled() => break,
                    _ = ack_rx => {},
                }
            }
        });

        self.timers.insert(id, Timer { token, handle });
        trace!("Scheduled {} every {:?}", id, period);
        id
    }

    /// Cancel one timer; a no-op for unknown or already finished ids
    pub fn cancel(&mut self, id: TaskId) -> bool {
        match self.timers.remove(&id) {
            Some(timer) => {
                timer.token.cancel();
                timer.handle.abort();
                true
            },
            None => false,
        }
    }

    /// Cancel every timer and invalidate deliveries already queued
    pub fn reset(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.token.cancel();
            timer.handle.abort();
        }
        self.epoch += 1;
    }

    /// Validate a delivery before running it
    ///
    /// Returns `None` for deliveries from an earlier epoch or from a timer
    /// that has since been cancelled.
    pub fn accept(&mut self, delivery: Delivery<T>) -> Option<(T, RunGuard)> {
        if delivery.epoch != self.epoch {
            trace!("Discarding delivery from epoch {}", delivery.epoch);
            return None;
        }
        if let Some(id) = delivery.id {
            if !self.timers.contains_key(&id) {
                trace!("Discarding delivery from cancelled {}", id);
                return None;
            }
            if !delivery.repeating {
                self.timers.remove(&id);
            }
        }
        Some((delivery.task, RunGuard { _ack: delivery.ack }))
    }

    /// Number of live timers
    pub fn pending(&self) -> usize {
        self.timers.len()
    }

    fn allocate_id(&mut self) -> TaskId {
        self.next_id += 1;
        TaskId(self.next_id)
    }
}

impl<T> Drop for Scheduler<T> {
    fn drop(&mut self) {
        self.root.cancel();
        for (_, timer) in self.timers.drain() {
            timer.handle.abort();
        }
    }
}
