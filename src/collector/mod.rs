//! External collaborators the sync core reads from: the session cache and consent state.

pub mod consent;
pub mod source;

pub use consent::{ConsentGate, FileConsent, StaticConsent};
pub use source::{InMemorySessionCache, JsonFileSessionSource, SessionSource};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("IO error reading session cache: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Session cache is not valid JSON: {0}")]
    InvalidCache(#[from] serde_json::Error),
}
