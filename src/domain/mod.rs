pub mod error;
pub mod remote_config;
pub mod session;
pub mod settings;

pub use error::SyncError;
pub use remote_config::{LocalEndpointConfig, RemoteConfig};
pub use session::{SessionRecord, SessionSummary, normalize_cache};
pub use settings::{AppliedChanges, RuntimeSettings, SettingsHandle};
