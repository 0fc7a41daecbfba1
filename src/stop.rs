//! Cancellation signal shared between async control tasks and blocking
//! decode/mux threads.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// One-way stop signal observable from both worlds: async tasks await
/// [`StopSignal::wait`], blocking threads poll [`StopSignal::stopped`] or park
/// in [`StopSignal::wait_timeout`].
///
/// Once raised, the signal never clears. A channel that restarts builds a
/// fresh signal.
#[derive(Debug, Default)]
pub struct StopSignal {
    shared: Arc<SharedState>,
}

#[derive(Debug, Default)]
struct SharedState {
    stopping: AtomicBool,
    notify: Notify,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl StopSignal {
    pub fn new() -> StopSignal {
        StopSignal::default()
    }

    /// Raise the signal. Idempotent; wakes every waiter in both worlds.
    pub fn stop(&self) {
        self.shared.stopping.store(true, Ordering::Release);
        self.shared.notify.notify_waiters();

        let _guard = self.shared.mutex.lock().unwrap();
        self.shared.condvar.notify_all();
    }

    pub fn stopped(&self) -> bool {
        self.shared.stopping.load(Ordering::Acquire)
    }

    /// Await the signal from an async task.
    pub async fn wait(&self) -> bool {
        if self.stopped() {
            return true;
        }
        self.shared.notify.notified().await;
        self.stopped()
    }

    /// Block the calling thread until the signal is raised or `timeout`
    /// elapses. Returns true if the signal was raised.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.shared.mutex.lock().unwrap();
        if self.stopped() {
            return true;
        }
        let (_guard, _res) = self
            .shared
            .condvar
            .wait_timeout_while(guard, timeout, |_| !self.stopped())
            .unwrap();
        self.stopped()
    }

    /// Spawn a task that is dropped as soon as the signal is raised.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let clone = self.clone();
        tokio::spawn(async move {
            let _ = clone.select(fut).await;
        });
    }

    /// Run `fut` to completion unless the signal is raised first.
    pub async fn select<F, T>(&self, fut: F) -> Result<T, ()>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let clone = self.clone();
        tokio::select! {
            res = fut => Ok(res),
            _ = clone.wait() => Err(()),
        }
    }
}

impl Clone for StopSignal {
    fn clone(&self) -> StopSignal {
        StopSignal {
            shared: Arc::clone(&self.shared),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_stop_is_sticky() {
        let sig = StopSignal::new();
        assert!(!sig.stopped());
        sig.stop();
        assert!(sig.stopped());
        sig.stop();
        assert!(sig.stopped());
    }

    #[test]
    fn test_blocking_wait_wakes() {
        let sig = StopSignal::new();
        let sig2 = sig.clone();

        let waiter = thread::spawn(move || sig2.wait_timeout(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        sig.stop();

        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_wait_timeout_expires() {
        let sig = StopSignal::new();
        assert!(!sig.wait_timeout(Duration::from_millis(10)));
    }

    #[tokio::test]
    async fn test_async_wait() {
        let sig = StopSignal::new();
        let sig2 = sig.clone();

        let handle = tokio::spawn(async move { sig2.wait().await });
        sig.stop();

        assert!(handle.await.unwrap());
    }
}
