use serde::{Deserialize, Serialize};

/// Operating configuration published by the remote config source.
///
/// Every field is optional: an absent field leaves the matching runtime value untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_upload: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_interval_hours: Option<f64>,
}

impl RemoteConfig {
    pub fn is_empty(&self) -> bool {
        self == &RemoteConfig::default()
    }
}

/// Endpoint and token stored in the local config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalEndpointConfig {
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}
