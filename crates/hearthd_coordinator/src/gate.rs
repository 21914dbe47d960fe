//! Single-flight execution of refreshes.

use std::future::Future;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use futures::future::BoxFuture;
use futures::future::Shared;
use futures::FutureExt;
use tracing::trace;

type Run<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

/// Runs at most one fetch at a time.
///
/// A caller that arrives while a fetch is in flight does not start another
/// one: it waits for the in-flight fetch and receives a clone of its result,
/// error included. Inside a tokio runtime each run is also driven by its own
/// task, so it completes even when every caller has gone away.
pub struct RefreshGate<T, E> {
    in_flight: Mutex<Option<Run<T, E>>>,
}

impl<T, E> RefreshGate<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            in_flight: Mutex::new(None),
        }
    }

    /// Run `fetch`, or join the run already in flight.
    ///
    /// `fetch` is only called to build the future, never when joining. A run
    /// that has already completed is never joined.
    pub async fn run_exclusive<F, Fut>(&self, fetch: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let run = {
            let mut slot = self.lock();
            match slot.as_ref() {
                Some(run) if run.peek().is_none() => {
                    trace!("Joining in-flight refresh");
                    run.clone()
                }
                _ => {
                    let run = fetch().boxed().shared();
                    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                        runtime.spawn(run.clone());
                    }
                    *slot = Some(run.clone());
                    run
                }
            }
        };

        let result = run.clone().await;

        let mut slot = self.lock();
        if slot.as_ref().is_some_and(|current| current.ptr_eq(&run)) {
            *slot = None;
        }
        result
    }

    /// Whether a fetch is currently in flight.
    pub fn is_running(&self) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|run| run.peek().is_none())
    }

    fn lock(&self) -> MutexGuard<'_, Option<Run<T, E>>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T, E> Default for RefreshGate<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;

    fn slow_fetch(
        calls: &Arc<AtomicUsize>,
        result: Result<u32, String>,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<u32, String>> {
        let calls = calls.clone();
        move || {
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(1)).await;
                result
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_fetch() {
        let gate = Arc::new(RefreshGate::<u32, String>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let leader = {
            let gate = gate.clone();
            let fetch = slow_fetch(&calls, Ok(7));
            tokio::spawn(async move { gate.run_exclusive(fetch).await })
        };
        tokio::task::yield_now().await;
        assert!(gate.is_running());

        let followers: Vec<_> = (0..4)
            .map(|_| {
                let gate = gate.clone();
                let fetch = slow_fetch(&calls, Ok(99));
                tokio::spawn(async move { gate.run_exclusive(fetch).await })
            })
            .collect();

        assert_eq!(leader.await.unwrap(), Ok(7));
        for follower in followers {
            assert_eq!(follower.await.unwrap(), Ok(7));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!gate.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_is_shared_with_waiters() {
        let gate = RefreshGate::<u32, String>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let (a, b, c) = tokio::join!(
            gate.run_exclusive(slow_fetch(&calls, Err("timeout".to_string()))),
            gate.run_exclusive(slow_fetch(&calls, Ok(1))),
            gate.run_exclusive(slow_fetch(&calls, Ok(2))),
        );

        assert_eq!(a, Err("timeout".to_string()));
        assert_eq!(b, Err("timeout".to_string()));
        assert_eq!(c, Err("timeout".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_runs_fetch_again() {
        let gate = RefreshGate::<u32, String>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        assert_eq!(gate.run_exclusive(slow_fetch(&calls, Ok(1))).await, Ok(1));
        assert_eq!(gate.run_exclusive(slow_fetch(&calls, Ok(2))).await, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_leader_does_not_wedge_gate() {
        let gate = RefreshGate::<u32, String>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let abandoned = tokio::time::timeout(
            Duration::from_millis(100),
            gate.run_exclusive(slow_fetch(&calls, Ok(1))),
        )
        .await;
        assert!(abandoned.is_err());

        // Still in flight, so the next caller joins it instead of restarting.
        assert_eq!(gate.run_exclusive(slow_fetch(&calls, Ok(2))).await, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert_eq!(gate.run_exclusive(slow_fetch(&calls, Ok(3))).await, Ok(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_run_completes_without_waiters() {
        let gate = RefreshGate::<u32, String>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        let fetch = {
            let calls = calls.clone();
            let finished = finished.clone();
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(1)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok::<u32, String>(1)
            }
        };
        let abandoned =
            tokio::time::timeout(Duration::from_millis(100), gate.run_exclusive(fetch)).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(!gate.is_running());

        // The completed run is not handed out again.
        assert_eq!(gate.run_exclusive(slow_fetch(&calls, Ok(2))).await, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
