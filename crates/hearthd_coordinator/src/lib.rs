//! Polling and push data-update coordination.
//!
//! [`UpdateCoordinator`] keeps the last good payload from a [`DataSource`],
//! refreshes it on an interval or on request, and tells its listeners about
//! every completed refresh. Requests are coalesced by a [`Debouncer`] and
//! fetches never overlap thanks to a [`RefreshGate`].

pub mod config;
pub mod coordinator;
pub mod debounce;
pub mod error;
pub mod gate;
pub mod listeners;
pub mod source;

pub use config::CoordinatorConfig;
pub use config::DebounceConfig;
pub use config::REQUEST_REFRESH_DEFAULT_COOLDOWN;
pub use config::REQUEST_REFRESH_DEFAULT_IMMEDIATE;
pub use coordinator::CoordinatorState;
pub use coordinator::CoordinatorStatus;
pub use coordinator::CoordinatorUpdate;
pub use coordinator::UpdateCoordinator;
pub use debounce::Debouncer;
pub use error::CoordinatorError;
pub use error::DebounceError;
pub use error::FetchError;
pub use gate::RefreshGate;
pub use listeners::ListenerHandle;
pub use listeners::ListenerRegistry;
pub use listeners::Subscription;
pub use source::source_fn;
pub use source::DataSource;
pub use source::FnSource;
