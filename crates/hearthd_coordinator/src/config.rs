//! Coordinator and debouncer settings.
//!
//! Durations are written in seconds (`*_secs`, fractional values allowed) when
//! the settings are deserialized, e.g. from a TOML entry:
//!
//! ```toml
//! update_interval_secs = 30
//! fetch_timeout_secs = 10
//! request_refresh = { cooldown_secs = 1.5, immediate = false }
//! ```

use std::time::Duration;

use serde::Deserialize;

/// Cooldown used for on-demand refresh requests unless configured otherwise.
pub const REQUEST_REFRESH_DEFAULT_COOLDOWN: Duration = Duration::from_secs(10);

/// Whether the first on-demand refresh request in a window runs immediately.
pub const REQUEST_REFRESH_DEFAULT_IMMEDIATE: bool = true;

/// Settings for a [`Debouncer`](crate::Debouncer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct DebounceConfig {
    /// Length of the window during which further calls are coalesced.
    #[serde(
        rename = "cooldown_secs",
        default = "default_cooldown",
        deserialize_with = "secs::duration"
    )]
    pub cooldown: Duration,

    /// Run the first call of a window right away instead of at its end.
    #[serde(default = "default_immediate")]
    pub immediate: bool,
}

fn default_cooldown() -> Duration {
    REQUEST_REFRESH_DEFAULT_COOLDOWN
}

fn default_immediate() -> bool {
    REQUEST_REFRESH_DEFAULT_IMMEDIATE
}

impl DebounceConfig {
    pub fn new(cooldown: Duration, immediate: bool) -> Self {
        Self {
            cooldown,
            immediate,
        }
    }
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self::new(REQUEST_REFRESH_DEFAULT_COOLDOWN, REQUEST_REFRESH_DEFAULT_IMMEDIATE)
    }
}

/// Settings for an [`UpdateCoordinator`](crate::UpdateCoordinator).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CoordinatorConfig {
    /// Polling period. `None` for push-driven or on-demand coordinators.
    #[serde(
        rename = "update_interval_secs",
        default,
        deserialize_with = "secs::positive_option"
    )]
    pub update_interval: Option<Duration>,

    /// Debounce applied to [`request_refresh`](crate::UpdateCoordinator::request_refresh).
    #[serde(default)]
    pub request_refresh: DebounceConfig,

    /// Upper bound on a single fetch.
    #[serde(
        rename = "fetch_timeout_secs",
        default,
        deserialize_with = "secs::positive_option"
    )]
    pub fetch_timeout: Option<Duration>,
}

impl CoordinatorConfig {
    /// Poll every `interval`.
    pub fn polling(interval: Duration) -> Self {
        Self {
            update_interval: Some(interval),
            ..Self::default()
        }
    }

    pub fn with_request_refresh(mut self, request_refresh: DebounceConfig) -> Self {
        self.request_refresh = request_refresh;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = Some(timeout);
        self
    }
}

mod secs {
    use std::time::Duration;

    use serde::Deserialize;
    use serde::Deserializer;
    use serde::de::Error;

    pub(super) fn duration<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|e| D::Error::custom(format!("invalid duration {secs}s: {e}")))
    }

    pub(super) fn positive_option<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<Duration>, D::Error> {
        let Some(secs) = Option::<f64>::deserialize(d)? else {
            return Ok(None);
        };
        let duration = Duration::try_from_secs_f64(secs)
            .map_err(|e| D::Error::custom(format!("invalid duration {secs}s: {e}")))?;
        if duration.is_zero() {
            return Err(D::Error::custom("duration must be greater than zero"));
        }
        Ok(Some(duration))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: CoordinatorConfig = toml::from_str("").unwrap();
        assert_eq!(config, CoordinatorConfig::default());
        assert_eq!(config.update_interval, None);
        assert_eq!(config.request_refresh.cooldown, Duration::from_secs(10));
        assert!(config.request_refresh.immediate);
        assert_eq!(config.fetch_timeout, None);
    }

    #[test]
    fn test_parse_full() {
        let toml = r#"
            update_interval_secs = 30
            fetch_timeout_secs = 2.5

            [request_refresh]
            cooldown_secs = 0.3
            immediate = false
        "#;

        let config: CoordinatorConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.update_interval, Some(Duration::from_secs(30)));
        assert_eq!(config.fetch_timeout, Some(Duration::from_millis(2500)));
        assert_eq!(
            config.request_refresh,
            DebounceConfig::new(Duration::from_millis(300), false)
        );
    }

    #[test]
    fn test_partial_debounce_keeps_defaults() {
        let config: CoordinatorConfig =
            toml::from_str("request_refresh = { immediate = false }").unwrap();
        assert_eq!(config.request_refresh.cooldown, REQUEST_REFRESH_DEFAULT_COOLDOWN);
        assert!(!config.request_refresh.immediate);
    }

    #[test]
    fn test_rejects_zero_interval() {
        let err = toml::from_str::<CoordinatorConfig>("update_interval_secs = 0").unwrap_err();
        assert!(err.to_string().contains("greater than zero"), "{err}");
    }

    #[test]
    fn test_rejects_negative_cooldown() {
        let err = toml::from_str::<CoordinatorConfig>("request_refresh = { cooldown_secs = -1 }")
            .unwrap_err();
        assert!(err.to_string().contains("invalid duration"), "{err}");
    }

    #[test]
    fn test_builders() {
        let config = CoordinatorConfig::polling(Duration::from_secs(60))
            .with_request_refresh(DebounceConfig::new(Duration::from_secs(2), false))
            .with_fetch_timeout(Duration::from_secs(5));
        assert_eq!(config.update_interval, Some(Duration::from_secs(60)));
        assert!(!config.request_refresh.immediate);
        assert_eq!(config.fetch_timeout, Some(Duration::from_secs(5)));
    }
}
