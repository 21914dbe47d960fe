//! The data-update coordinator.
//!
//! An [`UpdateCoordinator`] owns the last good payload fetched from a
//! [`DataSource`] and decides when to fetch again: on a fixed interval, when
//! asked through the debounced [`request_refresh`](UpdateCoordinator::request_refresh),
//! or right now through [`refresh`](UpdateCoordinator::refresh). Every
//! completed refresh, failed or not, is announced to the registered listeners
//! exactly once.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::CoordinatorConfig;
use crate::debounce::Debouncer;
use crate::error::panic_message;
use crate::error::CoordinatorError;
use crate::error::DebounceError;
use crate::error::FetchError;
use crate::gate::RefreshGate;
use crate::listeners::ListenerHandle;
use crate::listeners::ListenerRegistry;
use crate::listeners::Subscription;
use crate::source::DataSource;

/// Lifecycle of a coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorState {
    /// No successful fetch yet.
    Uninitialized,
    /// The last refresh succeeded.
    Ready,
    /// The last refresh failed; `data` holds the last good payload.
    Degraded,
    /// Shut down. No timers fire and no fetches start.
    Stopped,
}

/// Event delivered to listeners after every completed refresh.
#[derive(Debug)]
pub struct CoordinatorUpdate<T> {
    pub name: Arc<str>,
    /// Increases by one with every completed refresh.
    pub sequence: u64,
    pub success: bool,
    /// Last good payload, which after a failure is the one from before it.
    pub data: Option<Arc<T>>,
    /// The failure, when `success` is false.
    pub error: Option<Arc<FetchError>>,
}

impl<T> Clone for CoordinatorUpdate<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            sequence: self.sequence,
            success: self.success,
            data: self.data.clone(),
            error: self.error.clone(),
        }
    }
}

/// Serializable summary of a coordinator, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub name: String,
    pub state: CoordinatorState,
    pub last_update_success: bool,
    pub last_exception: Option<String>,
    pub update_interval_secs: Option<f64>,
    pub listeners: usize,
}

/// Handle to a coordinator. Clones share the same coordinator.
pub struct UpdateCoordinator<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for UpdateCoordinator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<T> {
    name: Arc<str>,
    update_interval: Option<Duration>,
    fetch_timeout: Option<Duration>,
    source: Box<dyn DataSource<Data = T>>,
    data: ArcSwapOption<T>,
    status: Mutex<Status<T>>,
    gate: RefreshGate<(), Arc<FetchError>>,
    listeners: ListenerRegistry<CoordinatorUpdate<T>>,
    debouncer: Debouncer,
    cancel: CancellationToken,
    /// Restarts the polling interval from now.
    reschedule: Arc<Notify>,
}

struct Status<T> {
    state: CoordinatorState,
    last_update_success: bool,
    last_exception: Option<Arc<FetchError>>,
    last_update_success_time: Option<Instant>,
    sequence: u64,
    polling: bool,
    /// Updates waiting for their notification pass, in sequence order.
    pending: VecDeque<CoordinatorUpdate<T>>,
    /// Set while some caller is running notification passes.
    delivering: bool,
}

impl<T: Send + Sync + 'static> UpdateCoordinator<T> {
    pub fn new<S>(name: impl Into<String>, config: CoordinatorConfig, source: S) -> Self
    where
        S: DataSource<Data = T>,
    {
        Self::build(name.into(), config, Box::new(source), None)
    }

    /// Like [`new`](Self::new), but `data()` returns `initial` until the first
    /// successful fetch replaces it.
    pub fn with_initial_data<S>(
        name: impl Into<String>,
        config: CoordinatorConfig,
        source: S,
        initial: T,
    ) -> Self
    where
        S: DataSource<Data = T>,
    {
        Self::build(name.into(), config, Box::new(source), Some(Arc::new(initial)))
    }

    fn build(
        name: String,
        config: CoordinatorConfig,
        source: Box<dyn DataSource<Data = T>>,
        initial: Option<Arc<T>>,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner<T>>| {
            let weak = weak.clone();
            let debouncer = Debouncer::new(name.clone(), config.request_refresh, move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        UpdateCoordinator { inner }.refresh().await;
                    }
                    Ok(())
                }
            });

            Inner {
                name: name.into(),
                update_interval: config.update_interval,
                fetch_timeout: config.fetch_timeout,
                source,
                data: ArcSwapOption::new(initial),
                status: Mutex::new(Status {
                    state: CoordinatorState::Uninitialized,
                    last_update_success: true,
                    last_exception: None,
                    last_update_success_time: None,
                    sequence: 0,
                    polling: false,
                    pending: VecDeque::new(),
                    delivering: false,
                }),
                gate: RefreshGate::new(),
                listeners: ListenerRegistry::new(),
                debouncer,
                cancel: CancellationToken::new(),
                reschedule: Arc::new(Notify::new()),
            }
        });
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn update_interval(&self) -> Option<Duration> {
        self.inner.update_interval
    }

    /// Last successfully fetched payload.
    pub fn data(&self) -> Option<Arc<T>> {
        self.inner.data.load_full()
    }

    pub fn last_update_success(&self) -> bool {
        self.inner.lock_status().last_update_success
    }

    /// Error from the most recent failed refresh, cleared by the next success.
    pub fn last_exception(&self) -> Option<Arc<FetchError>> {
        self.inner.lock_status().last_exception.clone()
    }

    pub fn last_update_success_time(&self) -> Option<Instant> {
        self.inner.lock_status().last_update_success_time
    }

    pub fn state(&self) -> CoordinatorState {
        self.inner.lock_status().state
    }

    pub fn status(&self) -> CoordinatorStatus {
        let status = self.inner.lock_status();
        CoordinatorStatus {
            name: self.inner.name.to_string(),
            state: status.state,
            last_update_success: status.last_update_success,
            last_exception: status.last_exception.as_ref().map(|e| e.to_string()),
            update_interval_secs: self.inner.update_interval.map(|d| d.as_secs_f64()),
            listeners: self.inner.listeners.len(),
        }
    }

    /// Fetch once to bring the coordinator up.
    ///
    /// Unlike the other refresh paths this reports a failed fetch to the
    /// caller, so that setup can be aborted and retried instead of carrying
    /// on with no data.
    pub async fn first_refresh(&self) -> Result<(), CoordinatorError> {
        match self.state() {
            CoordinatorState::Uninitialized => {}
            CoordinatorState::Stopped => {
                return Err(CoordinatorError::Stopped(self.inner.name.to_string()));
            }
            CoordinatorState::Ready | CoordinatorState::Degraded => {
                return Err(CoordinatorError::AlreadyRefreshed(self.inner.name.to_string()));
            }
        }

        match self.run_refresh(false).await {
            Ok(()) if self.state() == CoordinatorState::Stopped => {
                Err(CoordinatorError::Stopped(self.inner.name.to_string()))
            }
            Ok(()) => Ok(()),
            Err(source) if source.is_auth_failure() => Err(CoordinatorError::AuthFailed {
                name: self.inner.name.to_string(),
                source,
            }),
            Err(source) => Err(CoordinatorError::NotReady {
                name: self.inner.name.to_string(),
                source,
            }),
        }
    }

    /// Fetch now, or wait for the fetch already in flight.
    ///
    /// Failures are recorded, not returned. Does nothing once shut down.
    pub async fn refresh(&self) {
        if self.is_stopped() {
            return;
        }
        // Recorded in the status and already logged.
        let _ = self.run_refresh(true).await;
    }

    /// Ask for a refresh, coalesced with other requests by the debouncer.
    pub async fn request_refresh(&self) -> Result<(), CoordinatorError> {
        if self.is_stopped() {
            return Err(CoordinatorError::Stopped(self.inner.name.to_string()));
        }
        self.inner.debouncer.call().await?;
        Ok(())
    }

    /// Replace the data with a pushed update.
    ///
    /// Drops any pending debounced refresh and restarts the polling interval,
    /// then notifies listeners. If another notification pass is running, the
    /// update is delivered right after it by that caller. Ignored once shut
    /// down.
    pub fn set_updated_data(&self, data: T) {
        if self.is_stopped() {
            return;
        }
        self.inner.debouncer.cancel();
        debug!(coordinator = %self.inner.name, "Manually updated data");
        let _ = self.inner.apply(Ok(data), true);
        self.inner.reschedule.notify_one();
    }

    /// Mark the coordinator as failed with `error` and notify listeners.
    pub fn set_update_error(&self, error: FetchError) {
        if self.is_stopped() {
            return;
        }
        let _ = self.inner.apply(Err(error), true);
    }

    /// Stop polling and refuse further refreshes.
    ///
    /// A fetch already in flight is left to finish and its data is kept, but
    /// listeners are not notified about it. Registered listeners stay
    /// registered. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut status = self.inner.lock_status();
            if status.state == CoordinatorState::Stopped {
                return;
            }
            status.state = CoordinatorState::Stopped;
        }
        info!(coordinator = %self.inner.name, "Shutting down coordinator");
        self.inner.debouncer.shutdown();
        self.inner.cancel.cancel();
    }

    pub fn add_listener<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&CoordinatorUpdate<T>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.listeners.add_listener(callback)
    }

    pub fn remove_listener(&self, handle: ListenerHandle) -> bool {
        self.inner.listeners.remove_listener(handle)
    }

    pub fn subscribe(&self) -> Subscription<CoordinatorUpdate<T>> {
        self.inner.listeners.subscribe()
    }

    fn is_stopped(&self) -> bool {
        self.state() == CoordinatorState::Stopped
    }

    async fn run_refresh(&self, log_failures: bool) -> Result<(), Arc<FetchError>> {
        let inner = self.inner.clone();
        self.inner
            .gate
            .run_exclusive(move || inner.fetch_and_apply(log_failures))
            .await
    }
}

impl<T> std::fmt::Debug for UpdateCoordinator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateCoordinator")
            .field("name", &self.inner.name)
            .field("update_interval", &self.inner.update_interval)
            .finish_non_exhaustive()
    }
}

impl<T: Send + Sync + 'static> Inner<T> {
    fn lock_status(&self) -> MutexGuard<'_, Status<T>> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn fetch_and_apply(self: Arc<Self>, log_failures: bool) -> Result<(), Arc<FetchError>> {
        let started = Instant::now();
        let result = self.fetch().await;
        debug!(
            coordinator = %self.name,
            elapsed = ?started.elapsed(),
            success = result.is_ok(),
            "Finished fetching data"
        );
        self.apply(result, log_failures)
    }

    async fn fetch(&self) -> Result<T, FetchError> {
        let fetch = AssertUnwindSafe(async { self.source.fetch().await }).catch_unwind();
        let outcome = match self.fetch_timeout {
            Some(limit) => match tokio::time::timeout(limit, fetch).await {
                Ok(outcome) => outcome,
                Err(_) => return Err(FetchError::Timeout(limit)),
            },
            None => fetch.await,
        };
        outcome.unwrap_or_else(|payload| Err(FetchError::Panicked(panic_message(&*payload))))
    }

    /// Record the outcome of a refresh and announce it.
    ///
    /// Notification passes never overlap: each update is queued under the
    /// status lock, so queue order is sequence order, and a single caller at
    /// a time drains the queue.
    fn apply(
        self: &Arc<Self>,
        result: Result<T, FetchError>,
        log_failures: bool,
    ) -> Result<(), Arc<FetchError>> {
        let (outcome, start_polling, deliver) = {
            let mut status = self.lock_status();
            status.sequence += 1;

            let outcome = match result {
                Ok(data) => {
                    self.data.store(Some(Arc::new(data)));
                    if !status.last_update_success {
                        info!(coordinator = %self.name, "Fetching data recovered");
                    }
                    status.last_update_success = true;
                    status.last_exception = None;
                    status.last_update_success_time = Some(Instant::now());
                    Ok(())
                }
                Err(e) => {
                    let e = Arc::new(e);
                    if log_failures {
                        if status.last_update_success {
                            error!(coordinator = %self.name, error = %e, "Error fetching data");
                        } else {
                            debug!(coordinator = %self.name, error = %e, "Fetching data still failing");
                        }
                    }
                    status.last_update_success = false;
                    status.last_exception = Some(e.clone());
                    Err(e)
                }
            };

            if status.state == CoordinatorState::Stopped {
                debug!(coordinator = %self.name, "Refresh completed after shutdown, not notifying");
                return outcome;
            }

            status.state = match (status.state, status.last_update_success) {
                (_, true) => CoordinatorState::Ready,
                (CoordinatorState::Uninitialized, false) => CoordinatorState::Uninitialized,
                (_, false) => CoordinatorState::Degraded,
            };

            let start_polling = status.state == CoordinatorState::Ready
                && !status.polling
                && self.update_interval.is_some();
            if start_polling {
                status.polling = true;
            }

            let update = CoordinatorUpdate {
                name: self.name.clone(),
                sequence: status.sequence,
                success: status.last_update_success,
                data: self.data.load_full(),
                error: status.last_exception.clone(),
            };
            status.pending.push_back(update);
            let deliver = !std::mem::replace(&mut status.delivering, true);
            (outcome, start_polling, deliver)
        };

        if start_polling {
            self.start_polling();
        }
        if deliver {
            self.deliver_pending();
        }
        outcome
    }

    fn deliver_pending(&self) {
        loop {
            let update = {
                let mut status = self.lock_status();
                match status.pending.pop_front() {
                    Some(update) => update,
                    None => {
                        status.delivering = false;
                        return;
                    }
                }
            };
            self.listeners.notify_all(&update);
        }
    }

    fn start_polling(self: &Arc<Self>) {
        let Some(period) = self.update_interval else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(coordinator = %self.name, "No tokio runtime, polling disabled");
            return;
        };
        debug!(coordinator = %self.name, ?period, "Starting polling");

        let weak = Arc::downgrade(self);
        let name = self.name.clone();
        let tick = move || {
            let weak = weak.clone();
            let name = name.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => UpdateCoordinator { inner }.request_refresh().await,
                    None => Err(CoordinatorError::Stopped(name.to_string())),
                }
            }
        };
        runtime.spawn(poll(
            self.name.clone(),
            self.cancel.clone(),
            self.reschedule.clone(),
            Instant::now() + period,
            period,
            tick,
        ));
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Run `tick` every `period` from `start` until cancelled or stopped.
///
/// A failing or panicking tick is logged and the next one is still scheduled.
async fn poll<F, Fut>(
    name: Arc<str>,
    cancel: CancellationToken,
    reschedule: Arc<Notify>,
    start: Instant,
    period: Duration,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), CoordinatorError>>,
{
    let mut interval = tokio::time::interval_at(start, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = reschedule.notified() => {
                interval.reset();
                continue;
            }
            _ = interval.tick() => {}
        }

        match AssertUnwindSafe(async { tick().await }).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(
                CoordinatorError::Stopped(_) | CoordinatorError::Debounce(DebounceError::Shutdown(_)),
            )) => break,
            Ok(Err(e)) => error!(coordinator = %name, error = %e, "Scheduled refresh failed"),
            Err(payload) => error!(
                coordinator = %name,
                panic = %panic_message(&*payload),
                "Scheduled refresh panicked"
            ),
        }
    }
    debug!(coordinator = %name, "Polling stopped");
}
