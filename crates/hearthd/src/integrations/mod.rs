pub mod rest;

pub use rest::RestSource;
