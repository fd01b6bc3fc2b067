//! src/scheduler.rs
//!
//! Single-threaded cooperative executor every other component posts its
//! protocol work onto, grounded on the original's `FlipperEventBase`
//! contract (`schedule`/`scheduleAfter`/`isRunningOnCorrectThread`) and, in
//! shape, on `maowbot-core`'s `eventbus::EventBus` (an mpsc-queue-backed
//! worker with a single consuming task).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use tokio::sync::mpsc;

pub type BoxedFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Boxes an async block for `Scheduler::schedule`/`schedule_after`.
pub fn boxed<F: Future<Output = ()> + Send + 'static>(fut: F) -> BoxedFuture {
    Box::pin(fut)
}

/// Interface every manager/client/diagnostic posts work onto. All
/// implementations must execute submitted work strictly one item at a time,
/// in submission order, so callers can rely on delivery being serialised
/// without any further locking.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, task: BoxedFuture);
    fn schedule_after(&self, delay: Duration, task: BoxedFuture);
    fn is_running_in_own_thread(&self) -> bool;
}

/// Default `Scheduler`: an unbounded queue drained by one persistent worker
/// task, so submitted futures run to completion one at a time in the order
/// they were submitted.
pub struct WorkerScheduler {
    sender: mpsc::UnboundedSender<BoxedFuture>,
    worker_task_id: Arc<OnceCell<tokio::task::Id>>,
}

impl WorkerScheduler {
    pub fn new() -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<BoxedFuture>();
        let worker_task_id: Arc<OnceCell<tokio::task::Id>> = Arc::new(OnceCell::new());
        let id_slot = worker_task_id.clone();

        tokio::spawn(async move {
            if let Some(id) = tokio::task::try_id() {
                let _ = id_slot.set(id);
            }
            while let Some(task) = receiver.recv().await {
                task.await;
            }
        });

        Self { sender, worker_task_id }
    }
}

impl Default for WorkerScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for WorkerScheduler {
    fn schedule(&self, task: BoxedFuture) {
        let _ = self.sender.send(task);
    }

    fn schedule_after(&self, delay: Duration, task: BoxedFuture) {
        let sender = self.sender.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender.send(task);
        });
    }

    fn is_running_in_own_thread(&self) -> bool {
        match (tokio::task::try_id(), self.worker_task_id.get()) {
            (Some(current), Some(worker)) => current == *worker,
            _ => false,
        }
    }
}
