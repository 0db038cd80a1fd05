// src/core/executor.rs

//! The async executor (C5): exactly one background action at a time, run on a
//! single dedicated worker task. The main control loop never blocks on it —
//! it polls non-blocking state queries, the same shape the teacher uses for
//! its `MasterMonitor` sub-task split (tick/info/pubsub loops running
//! concurrently, coordinated through shared state rather than by awaiting
//! each other).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Promote { reason: crate::core::snapshot::PromotionReason },
    Restart,
    CreateReplica { leader: String },
    Custom(String),
}

/// Lets an in-flight action declare itself past its point of no return;
/// cancellation beyond that point is refused.
#[derive(Clone, Default)]
pub struct CriticalTask {
    committed: Arc<AtomicBool>,
}

impl CriticalTask {
    pub fn commit(&self) {
        self.committed.store(true, Ordering::SeqCst);
    }

    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::SeqCst)
    }
}

struct Job {
    action: Action,
    cancel_flag: Arc<AtomicBool>,
    critical: CriticalTask,
    reply: oneshot::Sender<bool>,
}

struct ScheduledSlot {
    action: Action,
    cancel_flag: Arc<AtomicBool>,
    critical: CriticalTask,
    running: bool,
}

pub struct AsyncExecutor {
    slot: Mutex<Option<ScheduledSlot>>,
    tx: mpsc::UnboundedSender<Job>,
}

impl AsyncExecutor {
    /// Spawns the single worker task and returns a handle to it. `run_fn` is
    /// invoked once per scheduled action with a cooperative cancellation flag.
    pub fn spawn<F, Fut>(run_fn: F) -> Arc<Self>
    where
        F: Fn(Action, Arc<AtomicBool>, CriticalTask) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = bool> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let executor = Arc::new(Self {
            slot: Mutex::new(None),
            tx,
        });

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let ok = run_fn(job.action, job.cancel_flag, job.critical).await;
                let _ = job.reply.send(ok);
            }
        });

        executor
    }

    /// Reserves the slot atomically, returning the previously scheduled
    /// (non-running) action, if any, so the caller can note it was superseded.
    pub fn schedule(&self, action: Action) -> Option<Action> {
        let mut slot = self.slot.lock();
        let previous = slot.take().filter(|s| !s.running).map(|s| s.action);
        *slot = Some(ScheduledSlot {
            action,
            cancel_flag: Arc::new(AtomicBool::new(false)),
            critical: CriticalTask::default(),
            running: false,
        });
        previous
    }

    /// Runs the scheduled action if the executor isn't already busy. Returns
    /// `false` immediately if it is.
    pub async fn run(&self) -> bool {
        let (action, cancel_flag, critical) = {
            let mut slot = self.slot.lock();
            match slot.as_mut() {
                Some(s) if !s.running => {
                    s.running = true;
                    (s.action.clone(), s.cancel_flag.clone(), s.critical.clone())
                }
                _ => return false,
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(Job {
                action,
                cancel_flag,
                critical,
                reply: reply_tx,
            })
            .is_err()
        {
            *self.slot.lock() = None;
            return false;
        }

        let result = reply_rx.await.unwrap_or(false);
        *self.slot.lock() = None;
        result
    }

    /// Signals the cancellable-subprocess flag. Refused (no-op) once the
    /// in-flight action has committed past its point of no return.
    pub fn cancel(&self) {
        if let Some(slot) = self.slot.lock().as_ref()
            && !slot.critical.is_committed()
        {
            slot.cancel_flag.store(true, Ordering::SeqCst);
        }
    }

    pub fn is_busy(&self) -> bool {
        self.slot.lock().as_ref().is_some_and(|s| s.running)
    }
}
