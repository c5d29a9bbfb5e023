//! Completion-driven event loop.
//!
//! Each environment owns one loop. Work finishing elsewhere (the blocking
//! pool, tokio tasks, other threads) posts a completion closure through an
//! unbounded channel, and the owning thread dispatches completions with
//! `&mut Environment`. The loop is alive while a referenced handle exists,
//! a request is in flight, or a local completion is queued.
//!
//! The one place the owning thread blocks is [`EventLoop::wait_next`], which
//! parks on the channel inside the loop's current-thread tokio runtime. Async
//! tasks spawned on that runtime make progress only while it is parked there.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::FutureExt;
use tokio::sync::mpsc;

use crate::env::Environment;

/// Runs on the loop thread.
pub type Completion = Box<dyn FnOnce(&mut Environment) + 'static>;

/// Runs on the loop thread, posted from any thread.
pub type RemoteCompletion = Box<dyn FnOnce(&mut Environment) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Until nothing keeps the loop alive or a stop is requested.
    Default,
    /// Dispatch what is ready, blocking for one completion if nothing is.
    Once,
    /// Dispatch what is ready, never block.
    NoWait,
}

/// State shared by the loop and the handles living on its thread.
#[derive(Default)]
struct LocalState {
    queue: RefCell<VecDeque<Completion>>,
    referenced_handles: Cell<usize>,
    stop: Cell<bool>,
}

pub struct EventLoop {
    runtime: tokio::runtime::Runtime,
    tx: mpsc::UnboundedSender<RemoteCompletion>,
    rx: mpsc::UnboundedReceiver<RemoteCompletion>,
    in_flight: Arc<AtomicUsize>,
    local: Rc<LocalState>,
    dispatched: u64,
}

impl EventLoop {
    /// Build a loop whose blocking pool has `threadpool_size` threads.
    pub fn new(threadpool_size: usize) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .max_blocking_threads(threadpool_size.max(1))
            .thread_name("threadpool-worker")
            .build()?;

        let (tx, rx) = mpsc::unbounded_channel();

        Ok(Self {
            runtime,
            tx,
            rx,
            in_flight: Arc::new(AtomicUsize::new(0)),
            local: Rc::new(LocalState::default()),
            dispatched: 0,
        })
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            local: Rc::clone(&self.local),
            sender: self.sender(),
        }
    }

    pub fn sender(&self) -> LoopSender {
        LoopSender {
            tx: self.tx.clone(),
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    pub fn runtime_handle(&self) -> &tokio::runtime::Handle {
        self.runtime.handle()
    }

    pub fn is_alive(&self) -> bool {
        self.local.referenced_handles.get() > 0
            || self.in_flight.load(Ordering::SeqCst) > 0
            || !self.local.queue.borrow().is_empty()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn referenced_handles(&self) -> usize {
        self.local.referenced_handles.get()
    }

    /// Completions dispatched since the loop was created.
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    /// Make the current run return after the completion being dispatched.
    pub fn stop(&self) {
        self.local.stop.set(true);
    }

    pub(crate) fn take_stop_flag(&self) -> bool {
        self.local.stop.replace(false)
    }

    pub(crate) fn stop_flag(&self) -> bool {
        self.local.stop.get()
    }

    /// Account for one request. The loop stays alive until the returned
    /// request completes or is dropped.
    pub fn begin_request(&self) -> PendingRequest {
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        PendingRequest {
            tx: self.tx.clone(),
            in_flight: Arc::clone(&self.in_flight),
            settled: false,
        }
    }

    /// Run `future` on the loop's runtime as a request. Its output is
    /// dispatched on the loop thread once the future finishes.
    pub fn spawn_request<F>(&self, future: F)
    where
        F: Future<Output = RemoteCompletion> + Send + 'static,
    {
        let request = self.begin_request();

        let _ = self
            .runtime
            .spawn(future.map(move |completion| request.complete(completion)));
    }

    pub(crate) fn try_next(&mut self) -> Option<Completion> {
        if let Some(completion) = self.local.queue.borrow_mut().pop_front() {
            self.dispatched += 1;
            return Some(completion);
        }

        match self.rx.try_recv() {
            Ok(completion) => {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                self.dispatched += 1;
                Some(completion)
            }
            Err(_) => None,
        }
    }

    /// Block until a remote completion arrives.
    pub(crate) fn wait_next(&mut self) -> Option<Completion> {
        let rx = &mut self.rx;
        let completion = self.runtime.block_on(rx.recv())?;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.dispatched += 1;
        Some(completion)
    }
}

/// Loop-thread handle used by the realm and native collaborators.
#[derive(Clone)]
pub struct LoopHandle {
    local: Rc<LocalState>,
    sender: LoopSender,
}

impl LoopHandle {
    /// Queue `completion` to run on the next dispatch. It keeps the loop
    /// alive until it has run.
    pub fn queue(&self, completion: impl FnOnce(&mut Environment) + 'static) {
        self.local.queue.borrow_mut().push_back(Box::new(completion));
    }

    pub fn sender(&self) -> &LoopSender {
        &self.sender
    }

    /// See [`EventLoop::stop`].
    pub fn stop(&self) {
        self.local.stop.set(true);
    }

    /// Requests in flight: pool work, spawned requests, undispatched sends.
    pub fn active_requests(&self) -> usize {
        self.sender.in_flight.load(Ordering::SeqCst)
    }

    /// Handles currently keeping the loop alive.
    pub fn active_handles(&self) -> usize {
        self.local.referenced_handles.get()
    }

    /// A referenced handle keeps the loop alive while it exists.
    pub fn ref_handle(&self) -> ActiveHandle {
        self.local
            .referenced_handles
            .set(self.local.referenced_handles.get() + 1);

        ActiveHandle {
            local: Rc::clone(&self.local),
            referenced: true,
        }
    }
}

/// Cross-thread completion sender.
///
/// Sending counts as a request until the completion is dispatched. Holding
/// a sender does not keep the loop alive by itself.
#[derive(Clone)]
pub struct LoopSender {
    tx: mpsc::UnboundedSender<RemoteCompletion>,
    in_flight: Arc<AtomicUsize>,
}

impl LoopSender {
    /// Returns false if the loop is gone.
    pub fn send(&self, completion: impl FnOnce(&mut Environment) + Send + 'static) -> bool {
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        if self.tx.send(Box::new(completion)).is_err() {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return false;
        }

        true
    }
}

/// A request counted by [`EventLoop::begin_request`].
pub struct PendingRequest {
    tx: mpsc::UnboundedSender<RemoteCompletion>,
    in_flight: Arc<AtomicUsize>,
    settled: bool,
}

impl PendingRequest {
    pub fn complete(mut self, completion: RemoteCompletion) {
        self.settled = true;

        if self.tx.send(completion).is_err() {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            tracing::debug!("event loop gone, dropping completion");
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if !self.settled {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!("request dropped without completing");
        }
    }
}

/// See [`LoopHandle::ref_handle`].
pub struct ActiveHandle {
    local: Rc<LocalState>,
    referenced: bool,
}

impl ActiveHandle {
    pub fn is_referenced(&self) -> bool {
        self.referenced
    }

    pub fn set_referenced(&mut self, referenced: bool) {
        if self.referenced == referenced {
            return;
        }

        let count = self.local.referenced_handles.get();
        self.local.referenced_handles.set(if referenced { count + 1 } else { count - 1 });
        self.referenced = referenced;
    }
}

impl Drop for ActiveHandle {
    fn drop(&mut self) {
        self.set_referenced(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_loop_is_not_alive() {
        let event_loop = EventLoop::new(1).unwrap();
        assert!(!event_loop.is_alive());
        assert_eq!(event_loop.in_flight(), 0);
    }

    #[test]
    fn test_handles_keep_loop_alive() {
        let event_loop = EventLoop::new(1).unwrap();
        let handle = event_loop.handle();

        let mut active = handle.ref_handle();
        assert!(event_loop.is_alive());

        active.set_referenced(false);
        assert!(!event_loop.is_alive());

        active.set_referenced(true);
        assert_eq!(event_loop.referenced_handles(), 1);

        drop(active);
        assert!(!event_loop.is_alive());
    }

    #[test]
    fn test_dropped_request_releases_loop() {
        let event_loop = EventLoop::new(1).unwrap();

        let request = event_loop.begin_request();
        assert!(event_loop.is_alive());

        drop(request);
        assert!(!event_loop.is_alive());
    }

    #[test]
    fn test_sender_counts_until_dispatched() {
        let mut event_loop = EventLoop::new(1).unwrap();
        let sender = event_loop.sender();

        assert!(sender.send(|_env| {}));
        assert_eq!(event_loop.in_flight(), 1);

        assert!(event_loop.try_next().is_some());
        assert_eq!(event_loop.in_flight(), 0);
        assert!(event_loop.try_next().is_none());
    }

    #[test]
    fn test_local_queue_before_remote() {
        let mut event_loop = EventLoop::new(1).unwrap();
        let handle = event_loop.handle();

        handle.sender().send(|_env| {});
        handle.queue(|_env| {});

        assert_eq!(event_loop.dispatched(), 0);
        assert!(event_loop.try_next().is_some());
        assert_eq!(event_loop.in_flight(), 1);
        assert!(event_loop.try_next().is_some());
        assert_eq!(event_loop.dispatched(), 2);
    }

    #[test]
    fn test_handle_reports_activity_and_stops() {
        let event_loop = EventLoop::new(1).unwrap();
        let handle = event_loop.handle();

        let request = event_loop.begin_request();
        let active = handle.ref_handle();
        assert_eq!(handle.active_requests(), 1);
        assert_eq!(handle.active_handles(), 1);

        drop(request);
        drop(active);
        assert_eq!(handle.active_requests(), 0);
        assert_eq!(handle.active_handles(), 0);

        handle.stop();
        assert!(event_loop.stop_flag());
        assert!(event_loop.take_stop_flag());
        assert!(!event_loop.stop_flag());
    }
}
