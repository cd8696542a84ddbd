//! Deferred deletion.
//!
//! Owning references dropped by external threads are shipped here instead of
//! being destroyed in place. The audio thread destroys a record only once the
//! iteration counter has passed the iteration the record was stamped with,
//! which guarantees every weak reference observed during the previous
//! iteration has already been dropped or upgraded. After shutdown the queue
//! flips to destroying immediately on the calling thread.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_channel::{unbounded, Receiver, Sender};

struct DeletionRecord {
    iteration_due: u64,
    object: Box<dyn Any + Send>,
}

/// Producer half. Callable from any thread.
pub(crate) struct DeletionSender {
    tx: Sender<DeletionRecord>,
    delete_directly: AtomicBool,
    deletes_in_progress: AtomicUsize,
}

/// Consumer half, owned by the audio thread.
pub(crate) struct DeletionReceiver {
    rx: Receiver<DeletionRecord>,
    // The channel has no peek, so a record popped before its iteration is
    // held here; stamps are nondecreasing in queue order.
    stash: Option<DeletionRecord>,
}

pub(crate) fn deletion_queue() -> (DeletionSender, DeletionReceiver) {
    let (tx, rx) = unbounded();
    (
        DeletionSender {
            tx,
            delete_directly: AtomicBool::new(false),
            deletes_in_progress: AtomicUsize::new(0),
        },
        DeletionReceiver { rx, stash: None },
    )
}

impl DeletionSender {
    /// Queues `object` to be dropped on the audio thread after the iteration
    /// boundary, or drops it inline once direct deletion is enabled.
    pub(crate) fn enqueue(&self, current_iteration: u64, object: Box<dyn Any + Send>) {
        if self.delete_directly.load(Ordering::Acquire) {
            drop(object);
            return;
        }
        self.deletes_in_progress.fetch_add(1, Ordering::Relaxed);
        let record = DeletionRecord {
            iteration_due: current_iteration + 1,
            object,
        };
        // The receiver lives as long as the context; a send can only fail
        // during teardown, at which point dropping inline is correct.
        let _ = self.tx.send(record);
        self.deletes_in_progress.fetch_sub(1, Ordering::Release);
    }

    /// Switches to immediate destruction and waits for in-flight enqueues to
    /// clear, so a following drain sees everything. The wait is bounded
    /// because the counter is only held across the enqueue itself.
    pub(crate) fn begin_shutdown(&self) {
        self.delete_directly.store(true, Ordering::Release);
        while self.deletes_in_progress.load(Ordering::Acquire) != 0 {
            std::hint::spin_loop();
        }
    }
}

impl DeletionReceiver {
    /// Destroys up to `limit` records whose due iteration has passed.
    pub(crate) fn drain_ready(&mut self, current_iteration: u64, limit: usize) {
        for _ in 0..limit {
            let record = match self.stash.take() {
                Some(r) => r,
                None => match self.rx.try_recv() {
                    Ok(r) => r,
                    Err(_) => return,
                },
            };
            if record.iteration_due < current_iteration {
                drop(record);
            } else {
                self.stash = Some(record);
                return;
            }
        }
    }

    /// Destroys everything unconditionally. Shutdown and teardown only.
    pub(crate) fn drain_all(&mut self) {
        self.stash = None;
        while self.rx.try_recv().is_ok() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool as StdAtomicBool;
    use std::sync::Arc;

    struct DropFlag(Arc<StdAtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_record_survives_one_iteration() {
        let (tx, mut rx) = deletion_queue();
        let dropped = Arc::new(StdAtomicBool::new(false));
        tx.enqueue(5, Box::new(DropFlag(dropped.clone())));

        rx.drain_ready(5, 64);
        assert!(!dropped.load(Ordering::SeqCst));
        rx.drain_ready(6, 64);
        assert!(!dropped.load(Ordering::SeqCst));
        rx.drain_ready(7, 64);
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_direct_mode_drops_inline() {
        let (tx, _rx) = deletion_queue();
        tx.begin_shutdown();
        let dropped = Arc::new(StdAtomicBool::new(false));
        tx.enqueue(0, Box::new(DropFlag(dropped.clone())));
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_drain_all_ignores_iterations() {
        let (tx, mut rx) = deletion_queue();
        let dropped = Arc::new(StdAtomicBool::new(false));
        tx.enqueue(5, Box::new(DropFlag(dropped.clone())));
        rx.drain_all();
        assert!(dropped.load(Ordering::SeqCst));
    }
}
