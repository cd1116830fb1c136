//! One-shot cancellable timers bound to a strand.

use crate::error::NetworkError;
use crate::strand::Strand;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

/// A one-shot timer whose handler runs on the owner strand.
///
/// Re-arming is the normal retry primitive: [`Deadline::start`] cancels any
/// prior arm, whose handler then fires with
/// [`NetworkError::OperationCanceled`]. Every armed handler is invoked
/// exactly once, with `Ok(())` on expiry or the cancel code otherwise.
pub struct Deadline {
    strand: Strand,
    armed: Mutex<Option<oneshot::Sender<()>>>,
}

impl Deadline {
    /// Create a timer delivering on the given strand.
    pub fn new(strand: Strand) -> Self {
        Deadline {
            strand,
            armed: Mutex::new(None),
        }
    }

    /// Arm the timer, cancelling any prior arm.
    pub fn start<H>(&self, duration: Duration, handler: H)
    where
        H: FnOnce(Result<(), NetworkError>) + Send + 'static,
    {
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();

        // Dropping the previous sender resolves its task's cancel branch.
        *self.armed.lock().expect("deadline poisoned") = Some(cancel_tx);

        let strand = self.strand.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {
                    strand.post(move || handler(Ok(())));
                }
                _ = &mut cancel_rx => {
                    strand.post(move || handler(Err(NetworkError::OperationCanceled)));
                }
            }
        });
    }

    /// Cancel the outstanding arm, if any.
    pub fn stop(&self) {
        self.armed.lock().expect("deadline poisoned").take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_expiry_delivers_ok() {
        let deadline = Deadline::new(Strand::new());
        let (tx, rx) = oneshot::channel();

        deadline.start(Duration::from_secs(1), move |result| {
            let _ = tx.send(result);
        });

        assert_eq!(rx.await.unwrap(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels() {
        let deadline = Deadline::new(Strand::new());
        let (tx, rx) = oneshot::channel();

        deadline.start(Duration::from_secs(60), move |result| {
            let _ = tx.send(result);
        });
        deadline.stop();

        assert_eq!(rx.await.unwrap(), Err(NetworkError::OperationCanceled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_cancels_prior() {
        let deadline = Arc::new(Deadline::new(Strand::new()));
        let (first_tx, first_rx) = oneshot::channel();
        let (second_tx, second_rx) = oneshot::channel();

        deadline.start(Duration::from_secs(60), move |result| {
            let _ = first_tx.send(result);
        });
        deadline.start(Duration::from_millis(10), move |result| {
            let _ = second_tx.send(result);
        });

        assert_eq!(first_rx.await.unwrap(), Err(NetworkError::OperationCanceled));
        assert_eq!(second_rx.await.unwrap(), Ok(()));
    }
}
