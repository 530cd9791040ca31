//! Fixed-size pool of persistent worker threads.
//!
//! Tasks go through a single FIFO queue; whichever worker is idle takes the
//! head, so an idle worker starts a task immediately and the rest wait in
//! submission order. Each task gets its own reply channel, so a failure is
//! only ever seen by the caller that submitted it. Workers receive whatever the
//! task value holds (for map tasks, a range and the centroids); anything large
//! is reached through the handler's captured `Arc`, never copied per task.

use crate::error::{Error, Result};
use crossbeam_channel::{bounded, select, Receiver, Sender, TryRecvError};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

type Handler<T, R> = dyn Fn(T) -> Result<R> + Send + Sync;

#[derive(Default)]
struct PoolState {
    active: AtomicUsize,
    queued: AtomicUsize,
    terminated: AtomicBool,
    crashed: AtomicBool,
}

pub struct WorkerPool<T, R> {
    threads: Option<ThreadPool>,
    handler: Arc<Handler<T, R>>,
    state: Arc<PoolState>,
    // Never sent on. Dropping it disconnects every handle's shutdown receiver.
    shutdown_tx: Option<Sender<()>>,
    shutdown_rx: Receiver<()>,
    size: usize,
}

/// Pending result of a submitted task.
pub struct TaskHandle<R> {
    reply: Receiver<Result<R>>,
    shutdown: Receiver<()>,
}

impl<R> TaskHandle<R> {
    /// Blocks until the task finishes or the pool is terminated.
    ///
    /// A result that was already delivered is returned even if the pool has
    /// since been terminated.
    pub fn wait(self) -> Result<R> {
        if let Ok(result) = self.reply.try_recv() {
            return result;
        }
        select! {
            recv(self.reply) -> msg => msg.unwrap_or(Err(Error::Terminated)),
            recv(self.shutdown) -> _ => Err(Error::Terminated),
        }
    }

    /// True once the task's result has been delivered.
    pub fn is_ready(&self) -> bool {
        !self.reply.is_empty()
    }

    /// Non-blocking poll; `None` while the task is still queued or running.
    pub fn try_wait(&self) -> Option<Result<R>> {
        match self.reply.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Disconnected) => Some(Err(Error::Terminated)),
            Err(TryRecvError::Empty) => match self.shutdown.try_recv() {
                Err(TryRecvError::Disconnected) => Some(Err(Error::Terminated)),
                _ => None,
            },
        }
    }
}

impl<T, R> WorkerPool<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    /// Starts `size` worker threads, each running `handler` on the tasks it takes.
    pub fn new<F>(size: usize, handler: F) -> Result<Self>
    where
        F: Fn(T) -> Result<R> + Send + Sync + 'static,
    {
        if size == 0 {
            return Err(Error::InvalidConfig(
                "worker pool size must be greater than 0".into(),
            ));
        }

        let threads = ThreadPoolBuilder::new()
            .num_threads(size)
            .thread_name(|i| format!("kmeans-worker-{i}"))
            .build()?;
        let (shutdown_tx, shutdown_rx) = bounded(0);

        debug!("worker pool started with {} threads", size);

        Ok(WorkerPool {
            threads: Some(threads),
            handler: Arc::new(handler),
            state: Arc::new(PoolState::default()),
            shutdown_tx: Some(shutdown_tx),
            shutdown_rx,
            size,
        })
    }

    /// Queues `task` and returns a handle to its result.
    ///
    /// On a terminated pool the handle resolves to [`Error::Terminated`]; after a
    /// worker crash it resolves to [`Error::WorkerCrashed`].
    pub fn submit(&self, task: T) -> TaskHandle<R> {
        let (reply_tx, reply_rx) = bounded(1);
        let handle = TaskHandle {
            reply: reply_rx,
            shutdown: self.shutdown_rx.clone(),
        };

        if self.state.crashed.load(Ordering::Acquire) {
            let _ = reply_tx.send(Err(crashed_pool()));
            return handle;
        }
        let threads = match &self.threads {
            Some(threads) if !self.state.terminated.load(Ordering::Acquire) => threads,
            _ => return handle,
        };

        let handler = Arc::clone(&self.handler);
        let state = Arc::clone(&self.state);
        state.queued.fetch_add(1, Ordering::AcqRel);

        threads.spawn_fifo(move || {
            state.queued.fetch_sub(1, Ordering::AcqRel);
            if state.terminated.load(Ordering::Acquire) {
                // Dropping reply_tx resolves the handle to Terminated.
                return;
            }
            if state.crashed.load(Ordering::Acquire) {
                let _ = reply_tx.send(Err(crashed_pool()));
                return;
            }

            state.active.fetch_add(1, Ordering::AcqRel);
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(task)));
            let result = match outcome {
                Ok(result) => result,
                Err(payload) => {
                    state.crashed.store(true, Ordering::Release);
                    let message = panic_message(&*payload);
                    error!("worker crashed: {}", message);
                    Err(Error::WorkerCrashed(message))
                }
            };
            state.active.fetch_sub(1, Ordering::AcqRel);

            let _ = reply_tx.send(result);
        });

        handle
    }

    /// Tasks currently executing.
    pub fn active_count(&self) -> usize {
        self.state.active.load(Ordering::Acquire)
    }

    /// Tasks submitted but not yet picked up by a worker.
    pub fn queued_count(&self) -> usize {
        self.state.queued.load(Ordering::Acquire)
    }
}

impl<T, R> WorkerPool<T, R> {
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_terminated(&self) -> bool {
        self.state.terminated.load(Ordering::Acquire)
    }

    /// False once a worker has crashed or the pool was terminated.
    pub fn is_usable(&self) -> bool {
        !self.is_terminated() && !self.state.crashed.load(Ordering::Acquire)
    }

    /// Stops the pool. Idempotent.
    ///
    /// Handles without a delivered result resolve to [`Error::Terminated`].
    /// Queued tasks are discarded without running, and the worker threads exit
    /// once the task they are running (if any) returns.
    pub fn terminate(&mut self) {
        if self.state.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown_tx.take();
        self.threads.take();
        debug!("worker pool terminated");
    }
}

impl<T, R> Drop for WorkerPool<T, R> {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn crashed_pool() -> Error {
    Error::WorkerCrashed("pool is unusable after a worker crash".into())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}
