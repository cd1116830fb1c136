//! Serialized execution contexts over the shared tokio runtime.
//!
//! A [`Strand`] is a logical FIFO of jobs draining on a dedicated task of the
//! ambient runtime. Jobs posted to one strand never run concurrently with
//! each other and always run to completion in post order, though successive
//! jobs may land on different worker threads. Pinning each stateful actor
//! (channel, subscriber, protocol) to a strand removes the need for locks
//! around that actor's state: the only question is "am I on my strand?",
//! answerable through [`Strand::running`].

use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

type Job = Box<dyn FnOnce() + Send + 'static>;

static NEXT_STRAND_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_STRAND: Cell<u64> = const { Cell::new(0) };
}

/// Handle to a serialized execution context.
///
/// Cloning yields another handle to the same strand. The drain task ends once
/// every handle is dropped and the queue is empty.
#[derive(Clone)]
pub struct Strand {
    id: u64,
    sender: mpsc::UnboundedSender<Job>,
}

impl Strand {
    /// Create a strand on the ambient tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new() -> Self {
        let id = NEXT_STRAND_ID.fetch_add(1, Ordering::Relaxed);
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();

        tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                CURRENT_STRAND.with(|current| current.set(id));
                job();
                CURRENT_STRAND.with(|current| current.set(0));
            }
        });

        Strand { id, sender }
    }

    /// Queue a job for serialized execution.
    ///
    /// Jobs must not block; anything slow belongs on its own task. Returns
    /// false when the strand has shut down (all other handles dropped), in
    /// which case the job is discarded.
    pub fn post<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender.send(Box::new(job)).is_ok()
    }

    /// Whether the current code is executing as a job on this strand.
    pub fn running(&self) -> bool {
        CURRENT_STRAND.with(|current| current.get()) == self.id
    }
}

impl Default for Strand {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Strand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Strand").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_jobs_never_overlap() {
        let strand = Strand::new();
        let in_job = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));

        for _ in 0..200 {
            let in_job = in_job.clone();
            let overlaps = overlaps.clone();
            let completed = completed.clone();

            strand.post(move || {
                if in_job.swap(true, Ordering::SeqCst) {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                std::thread::yield_now();
                in_job.store(false, Ordering::SeqCst);
                completed.fetch_add(1, Ordering::SeqCst);
            });
        }

        while completed.load(Ordering::SeqCst) < 200 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_jobs_run_in_post_order() {
        let strand = Strand::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let completed = Arc::new(AtomicUsize::new(0));

        for index in 0..50 {
            let order = order.clone();
            let completed = completed.clone();
            strand.post(move || {
                order.lock().unwrap().push(index);
                completed.fetch_add(1, Ordering::SeqCst);
            });
        }

        while completed.load(Ordering::SeqCst) < 50 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let observed = order.lock().unwrap().clone();
        assert_eq!(observed, (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_running_detects_owner_strand() {
        let strand = Strand::new();
        let other = Strand::new();
        assert!(!strand.running());

        let (tx, rx) = tokio::sync::oneshot::channel();
        let probe = strand.clone();
        let foreign = other.clone();
        strand.post(move || {
            let _ = tx.send((probe.running(), foreign.running()));
        });

        let (own, not_own) = rx.await.unwrap();
        assert!(own);
        assert!(!not_own);
    }
}
