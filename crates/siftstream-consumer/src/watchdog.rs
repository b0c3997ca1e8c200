use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

enum Command {
    Rearm,
    Cancel,
}

/// Single-shot inactivity deadline.
///
/// Each `rearm` replaces the pending deadline. When a deadline passes
/// without being replaced, `on_expire` runs once and the watchdog stays
/// disarmed until the next `rearm`.
pub struct Watchdog {
    tx: mpsc::UnboundedSender<Command>,
    handle: JoinHandle<()>,
}

impl Watchdog {
    /// Must be called from within a tokio runtime.
    pub fn spawn<F, Fut>(timeout: Duration, on_expire: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(timeout, rx, on_expire));
        Self { tx, handle }
    }

    pub fn rearm(&self) {
        let _ = self.tx.send(Command::Rearm);
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(Command::Cancel);
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn run<F, Fut>(timeout: Duration, mut rx: mpsc::UnboundedReceiver<Command>, on_expire: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = ()>,
{
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut armed = false;

    loop {
        tokio::select! {
            // A queued rearm always beats an expiry that is due at the same time.
            biased;

            command = rx.recv() => match command {
                Some(Command::Rearm) => {
                    deadline.as_mut().reset(Instant::now() + timeout);
                    armed = true;
                }
                Some(Command::Cancel) => armed = false,
                None => break,
            },
            () = &mut deadline, if armed => {
                armed = false;
                tracing::debug!(timeout_ms = timeout.as_millis() as u64, "inactivity deadline expired");
                on_expire().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const TIMEOUT: Duration = Duration::from_secs(300);

    fn counting_watchdog() -> (Watchdog, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let watchdog = Watchdog::spawn(TIMEOUT, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        (watchdog, fired)
    }

    #[tokio::test]
    async fn fires_once_after_timeout() {
        tokio::time::pause();
        let (watchdog, fired) = counting_watchdog();

        watchdog.rearm();
        tokio::time::sleep(TIMEOUT - Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Single-shot: no further expiry without a rearm.
        tokio::time::sleep(TIMEOUT * 3).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rearm_postpones_expiry() {
        tokio::time::pause();
        let (watchdog, fired) = counting_watchdog();

        watchdog.rearm();
        tokio::time::sleep(TIMEOUT - Duration::from_secs(1)).await;
        watchdog.rearm();
        tokio::time::sleep(TIMEOUT - Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn never_armed_never_fires() {
        tokio::time::pause();
        let (_watchdog, fired) = counting_watchdog();
        tokio::time::sleep(TIMEOUT * 2).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_disarms() {
        tokio::time::pause();
        let (watchdog, fired) = counting_watchdog();

        watchdog.rearm();
        tokio::time::sleep(Duration::from_secs(10)).await;
        watchdog.cancel();
        tokio::time::sleep(TIMEOUT * 2).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        watchdog.rearm();
        tokio::time::sleep(TIMEOUT + Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
