//! Serial task executors.
//!
//! Every subscription (and every shared-subscription group) owns exactly one
//! executor: a tokio task that owns the state and runs submitted closures
//! against it one at a time, in submission order. This is the only
//! synchronization the ledger, credit window and pipeline get; they hold no
//! locks of their own. Different executors run fully in parallel.
//!
//! Submission never blocks or awaits. Callers that want the result await the
//! returned [`TaskHandle`].

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Error type for task submission.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("executor {0} is shut down")]
    Closed(String),

    #[error("task was dropped before it produced a result")]
    TaskDropped,
}

type Job<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

enum Command<S> {
    Run(Job<S>),
    Shutdown,
}

/// Counters kept per executor.
#[derive(Debug, Default)]
struct ExecutorStats {
    total_queued: AtomicU64,
    outstanding: AtomicU64,
    max_outstanding: AtomicU64,
    completed: AtomicU64,
}

impl ExecutorStats {
    fn queued(&self) {
        self.total_queued.fetch_add(1, Ordering::Relaxed);
        let outstanding = self.outstanding.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_outstanding.fetch_max(outstanding, Ordering::AcqRel);
    }

    fn rejected(&self) {
        self.total_queued.fetch_sub(1, Ordering::Relaxed);
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }

    fn finished(&self) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ExecutorSnapshot {
        ExecutorSnapshot {
            total_queued: self.total_queued.load(Ordering::Relaxed),
            outstanding: self.outstanding.load(Ordering::Acquire),
            max_outstanding: self.max_outstanding.load(Ordering::Acquire),
            completed: self.completed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of an executor's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorSnapshot {
    /// Tasks ever accepted
    pub total_queued: u64,
    /// Tasks accepted and not yet run
    pub outstanding: u64,
    /// Highest `outstanding` observed
    pub max_outstanding: u64,
    /// Tasks run to completion
    pub completed: u64,
}

/// Handle to a serial executor owning a value of type `S`.
pub struct SerialExecutor<S> {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<Command<S>>,
    stats: Arc<ExecutorStats>,
}

impl<S> Clone for SerialExecutor<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            tx: self.tx.clone(),
            stats: self.stats.clone(),
        }
    }
}

impl<S: Send + 'static> SerialExecutor<S> {
    /// Spawn an executor owning `state`.
    ///
    /// Must be called from within a tokio runtime. The join handle yields the
    /// state back once the executor stops.
    pub fn spawn(name: impl Into<String>, state: S) -> (Self, JoinHandle<S>) {
        Self::spawn_with(name, |_| state)
    }

    /// Spawn an executor whose state needs a weak handle to its own queue, so
    /// it can schedule follow-up work from callbacks without keeping itself
    /// alive.
    pub fn spawn_with<F>(name: impl Into<String>, init: F) -> (Self, JoinHandle<S>)
    where
        F: FnOnce(WeakExecutor<S>) -> S,
    {
        let name: Arc<str> = Arc::from(name.into());
        let (tx, mut rx) = mpsc::unbounded_channel::<Command<S>>();
        let stats = Arc::new(ExecutorStats::default());

        let weak = WeakExecutor {
            name: name.clone(),
            tx: tx.downgrade(),
            stats: stats.clone(),
        };
        let mut state = init(weak);

        let loop_name = name.clone();
        let loop_stats = stats.clone();
        let join = tokio::spawn(async move {
            tracing::trace!(executor = %loop_name, "Serial executor started");
            while let Some(command) = rx.recv().await {
                match command {
                    Command::Run(job) => job(&mut state),
                    Command::Shutdown => {
                        loop_stats.finished();
                        break;
                    }
                }
            }
            tracing::debug!(executor = %loop_name, "Serial executor stopped");
            state
        });

        (Self { name, tx, stats }, join)
    }

    /// Queue `f` and get a handle to its result.
    pub fn submit<R, F>(&self, f: F) -> Result<TaskHandle<R>, ExecutorError>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let stats = self.stats.clone();
        self.enqueue(Box::new(move |state: &mut S| {
            let result = f(state);
            stats.finished();
            // The caller may have dropped the handle; that is fine
            let _ = result_tx.send(result);
        }))?;
        Ok(TaskHandle { rx: result_rx })
    }

    /// Queue `f` without waiting for a result.
    pub fn execute<F>(&self, f: F) -> Result<(), ExecutorError>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        let stats = self.stats.clone();
        self.enqueue(Box::new(move |state: &mut S| {
            f(state);
            stats.finished();
        }))
    }

    fn enqueue(&self, job: Job<S>) -> Result<(), ExecutorError> {
        self.stats.queued();
        if self.tx.send(Command::Run(job)).is_err() {
            self.stats.rejected();
            return Err(ExecutorError::Closed(self.name.to_string()));
        }
        Ok(())
    }

    /// Stop after every task queued so far has run.
    pub fn shutdown(&self) -> Result<(), ExecutorError> {
        self.stats.queued();
        if self.tx.send(Command::Shutdown).is_err() {
            self.stats.rejected();
            return Err(ExecutorError::Closed(self.name.to_string()));
        }
        Ok(())
    }

    pub fn downgrade(&self) -> WeakExecutor<S> {
        WeakExecutor {
            name: self.name.clone(),
            tx: self.tx.downgrade(),
            stats: self.stats.clone(),
        }
    }
}

impl<S> SerialExecutor<S> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn stats(&self) -> ExecutorSnapshot {
        self.stats.snapshot()
    }
}

/// Non-owning handle; does not keep the executor alive.
pub struct WeakExecutor<S> {
    name: Arc<str>,
    tx: mpsc::WeakUnboundedSender<Command<S>>,
    stats: Arc<ExecutorStats>,
}

impl<S> Clone for WeakExecutor<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            tx: self.tx.clone(),
            stats: self.stats.clone(),
        }
    }
}

impl<S> WeakExecutor<S> {
    pub fn upgrade(&self) -> Option<SerialExecutor<S>> {
        Some(SerialExecutor {
            name: self.name.clone(),
            tx: self.tx.upgrade()?,
            stats: self.stats.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Result of a submitted task.
#[derive(Debug)]
pub struct TaskHandle<R> {
    rx: oneshot::Receiver<R>,
}

impl<R> Future for TaskHandle<R> {
    type Output = Result<R, ExecutorError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.map_err(|_| ExecutorError::TaskDropped))
    }
}
