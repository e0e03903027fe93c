//! Timer-driven dispatcher for delayed and recurring in-process callbacks.
//!
//! A min-heap keyed by absolute fire time feeds a single dispatch loop. The
//! loop parks on a [`Notify`] when the heap is empty, sleeps until the next
//! deadline otherwise, and re-evaluates whenever something is pushed.
//! Callback failures are logged and never break the loop; a recurring
//! callback reschedules itself after every run, success or failure.

use anyhow::Result;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

type CallbackFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type Callback = Arc<dyn Fn() -> CallbackFuture + Send + Sync>;

enum Schedule {
    Once,
    Every(Duration),
}

struct Entry {
    fire_at: Instant,
    seq: u64,
    schedule: Schedule,
    callback: Callback,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // BinaryHeap is a max-heap; invert so the earliest deadline sits on top,
    // with insertion order as the tie-break.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .fire_at
            .cmp(&self.fire_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Inner {
    heap: Mutex<BinaryHeap<Entry>>,
    notify: Notify,
    stop: AtomicBool,
    seq: AtomicU64,
}

impl Inner {
    fn push_entry(&self, fire_at: Instant, schedule: Schedule, callback: Callback) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.heap
            .lock()
            .expect("dispatcher heap lock")
            .push(Entry {
                fire_at,
                seq,
                schedule,
                callback,
            });
        self.notify.notify_one();
    }
}

pub struct BackgroundDispatcher {
    inner: Arc<Inner>,
    handle: JoinHandle<()>,
}

impl BackgroundDispatcher {
    pub fn spawn() -> Self {
        let inner = Arc::new(Inner {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            stop: AtomicBool::new(false),
            seq: AtomicU64::new(0),
        });
        info!("starting background dispatcher");
        let handle = tokio::spawn(run_loop(inner.clone()));
        Self { inner, handle }
    }

    /// Schedule a one-shot callback at an absolute fire time.
    pub fn push<F, Fut>(&self, fire_at: Instant, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.inner.push_entry(fire_at, Schedule::Once, wrap(callback));
    }

    /// Schedule a self-sustaining recurring callback: it fires immediately,
    /// then again `every` after each completion, regardless of outcome.
    pub fn push_recurring<F, Fut>(&self, every: Duration, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.inner
            .push_entry(Instant::now(), Schedule::Every(every), wrap(callback));
    }

    /// Ask the dispatch loop to exit. A callback already taken off the heap
    /// still completes; nothing further is executed.
    pub fn stop(&self) {
        self.inner.stop.store(true, Ordering::Relaxed);
        self.inner.notify.notify_one();
    }

    /// Wait for the dispatch loop to observe the stop signal and exit.
    pub async fn join(self) {
        let _ = self.handle.await;
    }
}

fn wrap<F, Fut>(callback: F) -> Callback
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move || Box::pin(callback()) as CallbackFuture)
}

async fn run_loop(inner: Arc<Inner>) {
    loop {
        if inner.stop.load(Ordering::Relaxed) {
            break;
        }

        let next_deadline = {
            let heap = inner.heap.lock().expect("dispatcher heap lock");
            heap.peek().map(|entry| entry.fire_at)
        };

        match next_deadline {
            None => {
                inner.notify.notified().await;
                continue;
            }
            Some(fire_at) if fire_at > Instant::now() => {
                tokio::select! {
                    _ = tokio::time::sleep_until(fire_at) => {}
                    _ = inner.notify.notified() => {}
                }
                continue;
            }
            Some(_) => {}
        }

        // The top of the heap is due. Anything pushed since the peek is
        // either also due or sorted behind it, so popping is safe.
        let entry = inner.heap.lock().expect("dispatcher heap lock").pop();
        let Some(entry) = entry else { continue };

        debug!("dispatching background callback");
        if let Err(e) = (entry.callback)().await {
            error!("background callback failed: {e:#}");
        }
        if let Schedule::Every(every) = entry.schedule {
            inner.push_entry(
                Instant::now() + every,
                Schedule::Every(every),
                entry.callback,
            );
        }
    }
    info!("background dispatcher stopped");
}
