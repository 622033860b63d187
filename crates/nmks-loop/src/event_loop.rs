//! Event loop thread with panic isolation.

use crate::promise::{Pending, Promise, promise};
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Work item executed on the loop thread.
pub type Job<S> = Box<dyn FnOnce(&mut S, &LoopHandle<S>) + Send + 'static>;

/// Event loop errors
#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    #[error("failed to spawn event loop thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("event loop state failed to initialize: {0}")]
    Init(String),

    #[error("timed out after {0:?} waiting for the event loop")]
    Timeout(Duration),

    #[error("event loop dropped the request before answering")]
    Abandoned,

    #[error("code expected on the event loop thread ran on another thread")]
    ThreadingViolation,
}

enum LoopMessage<S> {
    /// Run a job
    Invoke(Job<S>),
    /// Stop the loop after the jobs queued so far
    Shutdown,
}

/// Owner of the loop thread. Dropping it stops the loop once queued jobs
/// have run.
pub struct EventLoop<S> {
    handle: LoopHandle<S>,
    _thread: thread::JoinHandle<()>,
}

/// Cloneable handle used to schedule work on the loop.
pub struct LoopHandle<S> {
    tx: Sender<LoopMessage<S>>,
    owner: ThreadId,
    name: Arc<str>,
}

impl<S: 'static> EventLoop<S> {
    /// Spawn a named loop thread and build its state on it.
    ///
    /// `init` runs on the new thread; this call blocks until it returns.
    pub fn spawn<F, E>(name: &str, init: F) -> Result<Self, LoopError>
    where
        F: FnOnce(&LoopHandle<S>) -> Result<S, E> + Send + 'static,
        E: std::fmt::Display,
    {
        let (tx, rx) = unbounded::<LoopMessage<S>>();
        let (ready_tx, ready_rx) = bounded::<Result<LoopHandle<S>, LoopError>>(1);
        let name: Arc<str> = Arc::from(name);

        let thread_name = name.to_string();
        let thread = thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let handle = LoopHandle {
                    tx,
                    owner: thread::current().id(),
                    name,
                };

                let state = match init(&handle) {
                    Ok(state) => state,
                    Err(e) => {
                        let _ = ready_tx.send(Err(LoopError::Init(e.to_string())));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(handle.clone()));

                info!("Event loop {} started", handle.name);
                run_loop(state, &handle, rx);
                info!("Event loop {} stopped", handle.name);
            })?;

        let handle = ready_rx
            .recv()
            .map_err(|_| LoopError::Init("loop thread exited during init".into()))??;

        Ok(Self {
            handle,
            _thread: thread,
        })
    }

    /// Handle for scheduling work on this loop.
    pub fn handle(&self) -> &LoopHandle<S> {
        &self.handle
    }
}

impl<S> Drop for EventLoop<S> {
    fn drop(&mut self) {
        // Not joined: the last owner may be dropped on the loop thread itself.
        let _ = self.handle.tx.send(LoopMessage::Shutdown);
    }
}

fn run_loop<S>(mut state: S, handle: &LoopHandle<S>, rx: Receiver<LoopMessage<S>>) {
    loop {
        let job = match rx.recv() {
            Ok(LoopMessage::Invoke(job)) => job,
            Ok(LoopMessage::Shutdown) => {
                debug!("Event loop {} received shutdown", handle.name);
                break;
            }
            Err(_) => break,
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| job(&mut state, handle)));
        if let Err(panic_info) = result {
            let msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic_info.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            error!("Job on event loop {} panicked: {}", handle.name, msg);
        }
    }
}

impl<S> LoopHandle<S> {
    /// Loop name, as given to [`EventLoop::spawn`].
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the caller is running on the loop thread.
    pub fn is_loop_thread(&self) -> bool {
        thread::current().id() == self.owner
    }

    /// Fail with [`LoopError::ThreadingViolation`] unless running on the
    /// loop thread.
    pub fn assert_owner(&self) -> Result<(), LoopError> {
        if self.is_loop_thread() {
            return Ok(());
        }
        error!(
            "Code for event loop {} ran on thread {:?}",
            self.name,
            thread::current().name()
        );
        Err(LoopError::ThreadingViolation)
    }

    /// Enqueue a job without waiting for it.
    pub fn invoke<F>(&self, job: F)
    where
        F: FnOnce(&mut S, &LoopHandle<S>) + Send + 'static,
    {
        if self.tx.send(LoopMessage::Invoke(Box::new(job))).is_err() {
            warn!("Event loop {} is gone, job dropped", self.name);
        }
    }

    /// Run `f` on the loop thread and get its result as a [`Pending`].
    pub fn run<T, F>(&self, f: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut S, &LoopHandle<S>) -> T + Send + 'static,
    {
        self.run_async(move |state, handle, promise| {
            promise.resolve(f(state, handle));
        })
    }

    /// Run `f` on the loop thread, handing it the [`Promise`] to settle
    /// whenever its work completes, possibly from a later callback.
    pub fn run_async<T, F>(&self, f: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut S, &LoopHandle<S>, Promise<T>) + Send + 'static,
    {
        let (promise, pending) = promise();
        self.invoke(move |state, handle| {
            if let Err(e) = handle.assert_owner() {
                promise.reject(e);
                return;
            }
            f(state, handle, promise);
        });
        pending
    }
}

impl<S> Clone for LoopHandle<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            owner: self.owner,
            name: Arc::clone(&self.name),
        }
    }
}
