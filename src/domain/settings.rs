use super::RemoteConfig;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use url::Url;

pub const DEFAULT_UPLOAD_INTERVAL: Duration = Duration::from_secs(3600);

/// Immutable view of the values background tasks read on every cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeSettings {
    pub endpoint: Option<String>,
    pub token: Option<String>,
    /// Local kill switch. When off, transmission is refused as if consent were denied.
    pub enabled: bool,
    pub auto_upload: bool,
    pub upload_interval: Duration,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            token: None,
            enabled: true,
            auto_upload: false,
            upload_interval: DEFAULT_UPLOAD_INTERVAL,
        }
    }
}

impl RuntimeSettings {
    pub fn is_configured(&self) -> bool {
        self.endpoint.as_deref().is_some_and(|e| !e.is_empty())
    }
}

/// Which fields a remote config document changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AppliedChanges {
    pub endpoint: bool,
    pub token: bool,
    pub enabled: bool,
    pub auto_upload: bool,
    pub upload_interval: bool,
}

impl AppliedChanges {
    pub fn any(&self) -> bool {
        self.endpoint || self.token || self.enabled || self.auto_upload || self.upload_interval
    }
}

/// Shared handle to the current settings snapshot.
///
/// Writers build a new snapshot and swap it in; readers clone the `Arc`
/// once and keep a consistent endpoint/token pair for their whole cycle.
#[derive(Debug, Clone, Default)]
pub struct SettingsHandle {
    current: Arc<RwLock<Arc<RuntimeSettings>>>,
}

impl SettingsHandle {
    pub fn new(initial: RuntimeSettings) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(initial))),
        }
    }

    pub fn snapshot(&self) -> Arc<RuntimeSettings> {
        self.current.read().clone()
    }

    /// Apply `change` to a copy of the current snapshot and swap it in.
    pub fn update<R>(&self, change: impl FnOnce(&mut RuntimeSettings) -> R) -> R {
        let mut guard = self.current.write();
        let mut next = RuntimeSettings::clone(&guard);
        let result = change(&mut next);
        *guard = Arc::new(next);
        result
    }

    /// Overwrite endpoint and/or token. `None` leaves the field as it is.
    pub fn configure(&self, endpoint: Option<String>, token: Option<String>) {
        self.update(|settings| {
            if let Some(endpoint) = endpoint {
                log_endpoint_change(settings.endpoint.as_deref(), &endpoint, "local");
                settings.endpoint = Some(endpoint);
            }
            if let Some(token) = token {
                settings.token = Some(token);
            }
        });
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.update(|settings| settings.enabled = enabled);
    }

    pub fn set_auto_upload(&self, auto_upload: bool, interval: Duration) {
        self.update(|settings| {
            settings.auto_upload = auto_upload;
            settings.upload_interval = interval;
        });
    }

    /// Merge a remote config document. Absent fields keep their current value.
    pub fn apply_remote(&self, remote: &RemoteConfig) -> AppliedChanges {
        self.update(|settings| {
            let mut changes = AppliedChanges::default();

            if let Some(endpoint) = remote.endpoint.as_ref().filter(|e| !e.is_empty()) {
                if settings.endpoint.as_ref() != Some(endpoint) {
                    log_endpoint_change(settings.endpoint.as_deref(), endpoint, "remote");
                    settings.endpoint = Some(endpoint.clone());
                    changes.endpoint = true;
                }
            }
            if let Some(token) = &remote.token {
                if settings.token.as_ref() != Some(token) {
                    settings.token = Some(token.clone());
                    changes.token = true;
                }
            }
            if let Some(enabled) = remote.enabled {
                changes.enabled = settings.enabled != enabled;
                settings.enabled = enabled;
            }
            if let Some(auto_upload) = remote.auto_upload {
                changes.auto_upload = settings.auto_upload != auto_upload;
                settings.auto_upload = auto_upload;
            }
            if let Some(interval) = remote.upload_interval_hours.and_then(hours_to_duration) {
                changes.upload_interval = settings.upload_interval != interval;
                settings.upload_interval = interval;
            }

            changes
        })
    }
}

/// Shortest auto-upload interval a remote document may set.
pub const MIN_UPLOAD_INTERVAL: Duration = Duration::from_secs(60);

/// Finite hour counts of at least [`MIN_UPLOAD_INTERVAL`] only.
pub fn hours_to_duration(hours: f64) -> Option<Duration> {
    if !hours.is_finite() || hours <= 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(hours * 3600.0)
        .ok()
        .filter(|interval| *interval >= MIN_UPLOAD_INTERVAL)
}

fn log_endpoint_change(old: Option<&str>, new: &str, source: &str) {
    if old == Some(new) {
        return;
    }
    info!(
        source,
        old_host = old.map(host_of).unwrap_or_default(),
        new_host = host_of(new),
        "upload endpoint changed"
    );
}

fn host_of(endpoint: &str) -> String {
    Url::parse(endpoint)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| "<invalid>".to_string())
}
