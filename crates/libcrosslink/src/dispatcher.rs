//! Single-worker event dispatcher.
//!
//! One tokio task owns the state `S`; every mutation is a closure posted to
//! the worker's queue, so state transitions are linearized without
//! per-entry locks. Delayed tasks are named and cancellable; cancellation
//! and firing both travel through the same queue, so cancel-before-fire is
//! exact. Teardown is best-effort: pending delayed tasks are discarded,
//! not drained.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::CrosslinkError;

type Task<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

enum Msg<S> {
    Run(Task<S>),
    Schedule {
        name: String,
        delay: Duration,
        task: Task<S>,
    },
    Cancel(String),
    Fire {
        name: String,
        generation: u64,
    },
    Shutdown,
}

/// Cloneable posting handle. Tasks posted from one handle run in the order
/// they were posted; no ordering is promised across handles.
pub struct DispatcherHandle<S> {
    tx: mpsc::UnboundedSender<Msg<S>>,
}

impl<S> Clone for DispatcherHandle<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<S: Send + 'static> DispatcherHandle<S> {
    /// Enqueue a task for execution as soon as the worker is free.
    pub fn post(
        &self,
        task: impl FnOnce(&mut S) + Send + 'static,
    ) -> Result<(), CrosslinkError> {
        self.tx
            .send(Msg::Run(Box::new(task)))
            .map_err(|_| CrosslinkError::DispatcherClosed)
    }

    /// Enqueue a named task to run after `delay`. A second schedule for a
    /// live name does not replace the first; it is dropped with a warning.
    /// Callers cancel first when replacement is intended.
    pub fn post_after(
        &self,
        name: impl Into<String>,
        delay: Duration,
        task: impl FnOnce(&mut S) + Send + 'static,
    ) -> Result<(), CrosslinkError> {
        self.tx
            .send(Msg::Schedule {
                name: name.into(),
                delay,
                task: Box::new(task),
            })
            .map_err(|_| CrosslinkError::DispatcherClosed)
    }

    /// Remove a pending delayed task. No-op if it already fired or was
    /// never scheduled.
    pub fn cancel(&self, name: impl Into<String>) -> Result<(), CrosslinkError> {
        self.tx
            .send(Msg::Cancel(name.into()))
            .map_err(|_| CrosslinkError::DispatcherClosed)
    }

    /// Post a task and await its return value. This is the bounded
    /// synchronous-result pattern for callers that need an answer.
    pub async fn call<R: Send + 'static>(
        &self,
        f: impl FnOnce(&mut S) -> R + Send + 'static,
    ) -> Result<R, CrosslinkError> {
        let (tx, rx) = oneshot::channel();
        self.post(move |state| {
            let _ = tx.send(f(state));
        })?;
        rx.await.map_err(|_| CrosslinkError::DispatcherClosed)
    }
}

pub struct Dispatcher<S> {
    handle: DispatcherHandle<S>,
    worker: JoinHandle<()>,
}

impl<S: Send + 'static> Dispatcher<S> {
    /// Start the worker and block until it signals readiness, so no task
    /// can be posted to a half-started dispatcher.
    pub async fn start(state: S) -> Self {
        Self::start_with(move |_| state).await
    }

    /// Like [`Dispatcher::start`], but the state is built with access to
    /// the dispatcher's own handle, for state that posts follow-up tasks.
    pub async fn start_with(build: impl FnOnce(&DispatcherHandle<S>) -> S) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = DispatcherHandle { tx };
        let state = build(&handle);
        let (ready_tx, ready_rx) = oneshot::channel();
        let fire_tx = handle.tx.downgrade();
        let worker = tokio::spawn(worker_loop(state, rx, fire_tx, ready_tx));
        let _ = ready_rx.await;
        Self { handle, worker }
    }

    pub fn handle(&self) -> &DispatcherHandle<S> {
        &self.handle
    }

    /// Stop accepting tasks, discard pending delayed tasks, and join the
    /// worker. Best-effort shutdown, not a graceful drain.
    pub async fn shutdown(self) {
        if self.handle.tx.send(Msg::Shutdown).is_ok() {
            let _ = self.worker.await;
        } else {
            self.worker.abort();
        }
    }
}

struct Pending<S> {
    generation: u64,
    task: Task<S>,
    sleeper: JoinHandle<()>,
}

async fn worker_loop<S: Send + 'static>(
    mut state: S,
    mut rx: mpsc::UnboundedReceiver<Msg<S>>,
    fire_tx: mpsc::WeakUnboundedSender<Msg<S>>,
    ready: oneshot::Sender<()>,
) {
    let mut pending: HashMap<String, Pending<S>> = HashMap::new();
    let mut generation: u64 = 0;
    let _ = ready.send(());

    while let Some(msg) = rx.recv().await {
        match msg {
            Msg::Run(task) => task(&mut state),
            Msg::Schedule { name, delay, task } => {
                if pending.contains_key(&name) {
                    warn!(name = %name, "delayed task already scheduled, dropping new schedule");
                    continue;
                }
                generation += 1;
                let fire = fire_tx.clone();
                let fire_name = name.clone();
                let fire_generation = generation;
                let sleeper = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(tx) = fire.upgrade() {
                        let _ = tx.send(Msg::Fire {
                            name: fire_name,
                            generation: fire_generation,
                        });
                    }
                });
                pending.insert(
                    name,
                    Pending {
                        generation,
                        task,
                        sleeper,
                    },
                );
            }
            Msg::Cancel(name) => {
                if let Some(p) = pending.remove(&name) {
                    p.sleeper.abort();
                    debug!(name = %name, "cancelled delayed task");
                }
            }
            Msg::Fire { name, generation } => match pending.remove(&name) {
                Some(p) if p.generation == generation => (p.task)(&mut state),
                // Stale fire from a sleeper that lost the race with a
                // cancel + reschedule under the same name.
                Some(p) => {
                    pending.insert(name, p);
                }
                None => {}
            },
            Msg::Shutdown => break,
        }
    }

    for (_, p) in pending.drain() {
        p.sleeper.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn tasks_run_in_post_order() {
        let dispatcher = Dispatcher::start(Vec::<u32>::new()).await;
        let handle = dispatcher.handle();
        for i in 0..10 {
            handle.post(move |state| state.push(i)).unwrap();
        }
        let seen = handle.call(|state| state.clone()).await.unwrap();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn call_returns_value() {
        let dispatcher = Dispatcher::start(41u32).await;
        let answer = dispatcher
            .handle()
            .call(|state| {
                *state += 1;
                *state
            })
            .await
            .unwrap();
        assert_eq!(answer, 42);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn delayed_task_fires() {
        let dispatcher = Dispatcher::start(Vec::<&str>::new()).await;
        let handle = dispatcher.handle();
        handle
            .post_after("t", Duration::from_millis(20), |state| state.push("fired"))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let seen = handle.call(|state| state.clone()).await.unwrap();
        assert_eq!(seen, vec!["fired"]);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_before_fire_suppresses_task() {
        let dispatcher = Dispatcher::start(Vec::<&str>::new()).await;
        let handle = dispatcher.handle();
        handle
            .post_after("t", Duration::from_millis(50), |state| state.push("fired"))
            .unwrap();
        handle.cancel("t").unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        let seen = handle.call(|state| state.clone()).await.unwrap();
        assert!(seen.is_empty());
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_name_does_not_replace() {
        let dispatcher = Dispatcher::start(Vec::<u32>::new()).await;
        let handle = dispatcher.handle();
        handle
            .post_after("t", Duration::from_millis(20), |state| state.push(1))
            .unwrap();
        handle
            .post_after("t", Duration::from_millis(20), |state| state.push(2))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let seen = handle.call(|state| state.clone()).await.unwrap();
        assert_eq!(seen, vec![1]);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_then_reschedule_runs_replacement() {
        let dispatcher = Dispatcher::start(Vec::<u32>::new()).await;
        let handle = dispatcher.handle();
        handle
            .post_after("t", Duration::from_millis(30), |state| state.push(1))
            .unwrap();
        handle.cancel("t").unwrap();
        handle
            .post_after("t", Duration::from_millis(30), |state| state.push(2))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        let seen = handle.call(|state| state.clone()).await.unwrap();
        assert_eq!(seen, vec![2]);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_discards_pending_delayed_tasks() {
        let fired = Arc::new(AtomicBool::new(false));
        let dispatcher = Dispatcher::start(()).await;
        let handle = dispatcher.handle().clone();
        let flag = fired.clone();
        handle
            .post_after("t", Duration::from_millis(50), move |_| {
                flag.store(true, Ordering::SeqCst);
            })
            .unwrap();
        dispatcher.shutdown().await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!fired.load(Ordering::SeqCst));
        assert!(matches!(
            handle.post(|_| {}),
            Err(CrosslinkError::DispatcherClosed)
        ));
    }
}
