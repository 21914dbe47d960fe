use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

/// Error produced by a [`DataSource`](crate::DataSource) while fetching.
///
/// The coordinator treats every variant the same way (the update failed, the
/// previous data is kept). The distinction only matters to whoever set the
/// coordinator up, e.g. to stop retrying on [`FetchError::AuthFailed`].
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The source could not produce fresh data (connection refused, 5xx, ...).
    #[error("update failed: {0}")]
    Failed(String),

    /// The credentials were rejected. Retrying will not help.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The fetch did not complete within the configured timeout.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The fetch future panicked.
    #[error("fetch panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FetchError {
    pub fn failed(message: impl Into<String>) -> Self {
        FetchError::Failed(message.into())
    }

    pub fn auth_failed(message: impl Into<String>) -> Self {
        FetchError::AuthFailed(message.into())
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self, FetchError::AuthFailed(_))
    }
}

/// Error returned by [`Debouncer::call`](crate::Debouncer::call).
#[derive(Debug, thiserror::Error)]
pub enum DebounceError {
    #[error("debouncer '{0}' called after shutdown")]
    Shutdown(String),

    /// The action ran immediately for this caller and failed.
    #[error("debounced action failed: {0}")]
    Action(#[source] anyhow::Error),
}

/// Error returned by the [`UpdateCoordinator`](crate::UpdateCoordinator)
/// operations that can fail.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// The first refresh failed; the owner should retry setup later.
    #[error("{name} is not ready: {source}")]
    NotReady {
        name: String,
        #[source]
        source: Arc<FetchError>,
    },

    /// The first refresh was rejected with an authentication failure.
    #[error("{name} could not authenticate: {source}")]
    AuthFailed {
        name: String,
        #[source]
        source: Arc<FetchError>,
    },

    #[error("{0} has already completed its first refresh")]
    AlreadyRefreshed(String),

    #[error("{0} has been shut down")]
    Stopped(String),

    #[error(transparent)]
    Debounce(#[from] DebounceError),
}

/// Best-effort extraction of the message carried by a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_failure_detection() {
        assert!(FetchError::auth_failed("bad token").is_auth_failure());
        assert!(!FetchError::failed("connection refused").is_auth_failure());
        assert!(!FetchError::Timeout(Duration::from_secs(1)).is_auth_failure());
    }

    #[test]
    fn test_not_ready_display_includes_cause() {
        let err = CoordinatorError::NotReady {
            name: "thermostat".to_string(),
            source: Arc::new(FetchError::failed("connection refused")),
        };
        assert_eq!(
            err.to_string(),
            "thermostat is not ready: update failed: connection refused"
        );
    }

    #[test]
    fn test_panic_message() {
        let payload = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(&*payload), "boom");

        let payload = std::panic::catch_unwind(|| panic!("{} {}", "formatted", 42)).unwrap_err();
        assert_eq!(panic_message(&*payload), "formatted 42");
    }
}
