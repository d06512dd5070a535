//! Error types shared across the core.

use thiserror::Error;

/// A required setting is missing.
///
/// The only error allowed to fail a batch outward: the broker client must
/// not commit the batch, so it is redelivered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// The named setting is absent or empty.
    #[error("Missing required setting: {0}")]
    Missing(&'static str),
}

/// Registry backend failure.
///
/// Internal only: callers log it and carry on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The backing store rejected or failed the operation.
    #[error("Registry backend error: {0}")]
    Backend(String),
}
