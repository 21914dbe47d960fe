pub mod api;
pub mod config;
pub mod integrations;
pub mod runtime;

pub use config::Config;
pub use config::ConfigError;
pub use config::LogLevel;
pub use runtime::EntryState;
pub use runtime::Runtime;
pub use runtime::RuntimeError;
