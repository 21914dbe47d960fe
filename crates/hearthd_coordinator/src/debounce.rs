//! Request coalescing.
//!
//! A [`Debouncer`] wraps an async action and guarantees it runs at most once
//! per cooldown window, however many times [`Debouncer::call`] is invoked.
//! With `immediate` set, the first call of a window runs the action right
//! away (leading edge); calls arriving while the window is open are folded
//! into a single run when it closes (trailing edge).

use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::task::AbortHandle;
use tracing::debug;
use tracing::error;
use tracing::trace;
use tracing::warn;

use crate::config::DebounceConfig;
use crate::error::DebounceError;

type Action = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Coalesces bursts of calls into single executions of an action.
///
/// Cloning is cheap and every clone drives the same debouncer.
#[derive(Clone)]
pub struct Debouncer {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    cooldown: Duration,
    immediate: bool,
    action: Action,
    state: Mutex<TimerState>,
    /// Held for the duration of an action run.
    execute_lock: tokio::sync::Mutex<()>,
}

#[derive(Default)]
struct TimerState {
    /// Running cooldown timer, tagged with the generation it was started in.
    timer: Option<(u64, AbortHandle)>,
    generation: u64,
    execute_at_end_of_timer: bool,
    shutdown: bool,
}

impl Debouncer {
    pub fn new<F, Fut>(name: impl Into<String>, config: DebounceConfig, action: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                cooldown: config.cooldown,
                immediate: config.immediate,
                action: Arc::new(move || action().boxed()),
                state: Mutex::new(TimerState::default()),
                execute_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn cooldown(&self) -> Duration {
        self.inner.cooldown
    }

    pub fn immediate(&self) -> bool {
        self.inner.immediate
    }

    /// Whether a cooldown window is currently open.
    pub fn is_cooling_down(&self) -> bool {
        self.inner.lock_state().timer.is_some()
    }

    /// Whether a call is waiting for the current window to close.
    pub fn has_pending_call(&self) -> bool {
        self.inner.lock_state().execute_at_end_of_timer
    }

    /// Request a run of the action.
    ///
    /// Returns once the request has been recorded, or, for a leading-edge
    /// call, once the action has completed. Only that leading-edge caller sees
    /// the action's error.
    pub async fn call(&self) -> Result<(), DebounceError> {
        {
            let mut state = self.inner.lock_state();
            if state.shutdown {
                return Err(DebounceError::Shutdown(self.inner.name.clone()));
            }
            if state.timer.is_some() {
                trace!(debouncer = %self.inner.name, "Cooling down, deferring call");
                state.execute_at_end_of_timer = true;
                return Ok(());
            }
        }

        // A run in progress satisfies this request.
        let Ok(_running) = self.inner.execute_lock.try_lock() else {
            return Ok(());
        };

        if !self.inner.immediate {
            let mut state = self.inner.lock_state();
            state.execute_at_end_of_timer = true;
            Inner::schedule_timer(&self.inner, &mut state);
            return Ok(());
        }

        if self.inner.lock_state().timer.is_some() {
            return Ok(());
        }

        let _cooldown = StartCooldownOnDrop(&self.inner);
        debug!(debouncer = %self.inner.name, "Running action immediately");
        (self.inner.action)().await.map_err(DebounceError::Action)
    }

    /// Fire-and-forget variant of [`call`](Self::call).
    ///
    /// Usable from synchronous code; a leading-edge run is spawned onto the
    /// current tokio runtime and its error is logged.
    pub fn schedule_call(&self) -> Result<(), DebounceError> {
        {
            let mut state = self.inner.lock_state();
            if state.shutdown {
                return Err(DebounceError::Shutdown(self.inner.name.clone()));
            }
            if state.timer.is_some() {
                state.execute_at_end_of_timer = true;
                return Ok(());
            }
            if !self.inner.immediate {
                state.execute_at_end_of_timer = true;
                Inner::schedule_timer(&self.inner, &mut state);
                return Ok(());
            }
        }

        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.call().await {
                warn!(debouncer = %this.inner.name, error = %e, "Scheduled call failed");
            }
        });
        Ok(())
    }

    /// Cancel the open cooldown window and drop any pending call.
    ///
    /// An action that is already running is left to finish.
    pub fn cancel(&self) {
        let mut state = self.inner.lock_state();
        if let Some((_, timer)) = state.timer.take() {
            trace!(debouncer = %self.inner.name, "Cancelling cooldown timer");
            timer.abort();
        }
        state.execute_at_end_of_timer = false;
    }

    /// Cancel pending work and reject every later call.
    pub fn shutdown(&self) {
        self.inner.lock_state().shutdown = true;
        self.cancel();
    }
}

impl std::fmt::Debug for Debouncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Debouncer")
            .field("name", &self.inner.name)
            .field("cooldown", &self.inner.cooldown)
            .field("immediate", &self.inner.immediate)
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn schedule_timer(this: &Arc<Inner>, state: &mut TimerState) {
        if state.shutdown {
            return;
        }
        // Runs from Drop, possibly while the runtime is going away.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if let Some((_, stale)) = state.timer.take() {
            stale.abort();
        }

        state.generation += 1;
        let generation = state.generation;
        let cooldown = this.cooldown;
        let weak = Arc::downgrade(this);
        let task = runtime.spawn(async move {
            tokio::time::sleep(cooldown).await;
            Inner::on_timer_finish(weak, generation).await;
        });
        state.timer = Some((generation, task.abort_handle()));
    }

    async fn on_timer_finish(this: Weak<Inner>, generation: u64) {
        let Some(this) = this.upgrade() else {
            return;
        };

        {
            let mut state = this.lock_state();
            if state.timer.as_ref().map(|(g, _)| *g) != Some(generation) {
                return;
            }
            state.timer = None;
            if !state.execute_at_end_of_timer {
                return;
            }
            state.execute_at_end_of_timer = false;
        }

        let Ok(_running) = this.execute_lock.try_lock() else {
            return;
        };
        if this.lock_state().timer.is_some() {
            return;
        }

        let _cooldown = StartCooldownOnDrop(&this);
        debug!(debouncer = %this.name, "Running deferred action");
        if let Err(e) = (this.action)().await {
            error!(debouncer = %this.name, error = %e, "Unexpected error from debounced action");
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some((_, timer)) = state.timer.take() {
            timer.abort();
        }
    }
}

/// Opens a new cooldown window once an action run ends, however it ends.
struct StartCooldownOnDrop<'a>(&'a Arc<Inner>);

impl Drop for StartCooldownOnDrop<'_> {
    fn drop(&mut self) {
        let mut state = self.0.lock_state();
        Inner::schedule_timer(self.0, &mut state);
    }
}
