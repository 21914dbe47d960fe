//! Entry lifecycle: set up coordinators and retry the ones that are not ready.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use hearthd_coordinator::CoordinatorError;
use hearthd_coordinator::CoordinatorStatus;
use hearthd_coordinator::UpdateCoordinator;
use serde::Serialize;
use tokio::task::JoinHandle;

/// First setup retry delay; doubled per failed attempt up to 16x.
const SETUP_RETRY_BASE: Duration = Duration::from_secs(5);
const SETUP_RETRY_MAX_EXPONENT: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    NotLoaded,
    SetupInProgress,
    Loaded,
    /// The first refresh failed; another attempt is scheduled.
    SetupRetry,
    /// Setup failed in a way retrying will not fix.
    SetupError,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntrySnapshot {
    pub id: String,
    pub state: EntryState,
    pub tries: u32,
    pub last_error: Option<String>,
    pub coordinator: CoordinatorStatus,
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Unknown entry '{0}'")]
    UnknownEntry(String),

    #[error("Entry '{id}' is not loaded ({state:?})")]
    NotLoaded { id: String, state: EntryState },

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

/// Owns the configured entries and their coordinators.
pub struct Runtime<T> {
    entries: Mutex<BTreeMap<String, Entry<T>>>,
    next_generation: AtomicU64,
}

struct Entry<T> {
    /// Distinguishes an entry from a later one added under the same id.
    generation: u64,
    coordinator: UpdateCoordinator<T>,
    state: EntryState,
    tries: u32,
    retry: Option<JoinHandle<()>>,
    last_error: Option<String>,
}

enum Attempt {
    Done,
    Retry(Duration),
}

/// Delay before the next setup attempt after `tries` failed ones.
pub fn retry_delay(tries: u32) -> Duration {
    SETUP_RETRY_BASE * 2u32.pow(tries.min(SETUP_RETRY_MAX_EXPONENT))
}

impl<T: Send + Sync + 'static> Runtime<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(BTreeMap::new()),
            next_generation: AtomicU64::new(0),
        })
    }

    /// Register `coordinator` under `id` and run its first refresh.
    ///
    /// Returns the entry state after the first attempt. An entry that is not
    /// ready keeps being retried in the background until it loads or is
    /// unloaded. An existing entry with the same id is unloaded first.
    pub async fn add_entry(
        self: &Arc<Self>,
        id: impl Into<String>,
        coordinator: UpdateCoordinator<T>,
    ) -> EntryState {
        let id = id.into();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut entries = self.lock();
            if let Some(mut previous) = entries.insert(
                id.clone(),
                Entry {
                    generation,
                    coordinator,
                    state: EntryState::NotLoaded,
                    tries: 0,
                    retry: None,
                    last_error: None,
                },
            ) {
                tracing::warn!(entry = %id, "Replacing existing entry");
                previous.unload();
            }
        }

        if let Attempt::Retry(wait) = self.attempt_setup(&id, generation).await {
            let mut entries = self.lock();
            if let Some(entry) = entries.get_mut(&id) {
                if entry.generation == generation && entry.state == EntryState::SetupRetry {
                    entry.retry = Some(tokio::spawn(retry_setup(
                        Arc::downgrade(self),
                        id.clone(),
                        generation,
                        wait,
                    )));
                }
            }
        }

        // A replaced entry reports itself as unloaded, not its successor's state.
        self.lock()
            .get(&id)
            .filter(|entry| entry.generation == generation)
            .map_or(EntryState::NotLoaded, |entry| entry.state)
    }

    async fn attempt_setup(&self, id: &str, generation: u64) -> Attempt {
        let coordinator = {
            let mut entries = self.lock();
            let Some(entry) = entries.get_mut(id) else {
                return Attempt::Done;
            };
            if entry.generation != generation
                || !matches!(entry.state, EntryState::NotLoaded | EntryState::SetupRetry)
            {
                return Attempt::Done;
            }
            entry.state = EntryState::SetupInProgress;
            entry.coordinator.clone()
        };

        let result = coordinator.first_refresh().await;

        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(id) else {
            return Attempt::Done;
        };
        if entry.generation != generation || entry.state != EntryState::SetupInProgress {
            // Unloaded or replaced while the refresh was running.
            return Attempt::Done;
        }

        match result {
            Ok(()) => {
                tracing::info!(entry = %id, tries = entry.tries, "Entry loaded");
                entry.state = EntryState::Loaded;
                entry.last_error = None;
                entry.retry = None;
                Attempt::Done
            }
            Err(CoordinatorError::NotReady { source, .. }) => {
                let wait = retry_delay(entry.tries);
                entry.tries += 1;
                entry.state = EntryState::SetupRetry;
                entry.last_error = Some(source.to_string());
                if entry.tries == 1 {
                    tracing::warn!(entry = %id, error = %source, retry_in = ?wait, "Entry not ready yet, retrying");
                } else {
                    tracing::debug!(entry = %id, error = %source, retry_in = ?wait, tries = entry.tries, "Entry still not ready, retrying");
                }
                Attempt::Retry(wait)
            }
            Err(e) => {
                tracing::error!(entry = %id, error = %e, "Entry setup failed");
                entry.state = EntryState::SetupError;
                entry.last_error = Some(e.to_string());
                entry.retry = None;
                Attempt::Done
            }
        }
    }

    /// Stop an entry: cancel its pending retry and shut its coordinator down.
    ///
    /// Returns `false` for an unknown id.
    pub fn unload(&self, id: &str) -> bool {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(id) else {
            return false;
        };
        tracing::info!(entry = %id, "Unloading entry");
        entry.unload();
        true
    }

    /// Unload every entry.
    pub fn shutdown(&self) {
        let mut entries = self.lock();
        for (id, entry) in entries.iter_mut() {
            if entry.state != EntryState::NotLoaded {
                tracing::debug!(entry = %id, "Unloading entry");
            }
            entry.unload();
        }
    }

    pub fn entries(&self) -> Vec<EntrySnapshot> {
        self.lock()
            .iter()
            .map(|(id, entry)| entry.snapshot(id))
            .collect()
    }

    pub fn entry(&self, id: &str) -> Option<EntrySnapshot> {
        self.lock().get(id).map(|entry| entry.snapshot(id))
    }

    pub fn coordinator(&self, id: &str) -> Option<UpdateCoordinator<T>> {
        self.lock().get(id).map(|entry| entry.coordinator.clone())
    }

    /// Ask a loaded entry's coordinator for a debounced refresh.
    pub async fn request_refresh(&self, id: &str) -> Result<(), RuntimeError> {
        let coordinator = {
            let entries = self.lock();
            let entry = entries
                .get(id)
                .ok_or_else(|| RuntimeError::UnknownEntry(id.to_string()))?;
            if entry.state != EntryState::Loaded {
                return Err(RuntimeError::NotLoaded {
                    id: id.to_string(),
                    state: entry.state,
                });
            }
            entry.coordinator.clone()
        };
        coordinator.request_refresh().await?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Entry<T>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Send + Sync + 'static> Entry<T> {
    fn unload(&mut self) {
        if let Some(retry) = self.retry.take() {
            retry.abort();
        }
        self.coordinator.shutdown();
        self.state = EntryState::NotLoaded;
    }

    fn snapshot(&self, id: &str) -> EntrySnapshot {
        EntrySnapshot {
            id: id.to_string(),
            state: self.state,
            tries: self.tries,
            last_error: self.last_error.clone(),
            coordinator: self.coordinator.status(),
        }
    }
}

async fn retry_setup<T: Send + Sync + 'static>(
    runtime: Weak<Runtime<T>>,
    id: String,
    generation: u64,
    mut wait: Duration,
) {
    loop {
        tokio::time::sleep(wait).await;
        let Some(runtime) = runtime.upgrade() else {
            return;
        };
        match runtime.attempt_setup(&id, generation).await {
            Attempt::Retry(next) => wait = next,
            Attempt::Done => return,
        }
    }
}
