use crate::reliability::RetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryGroup {
    pub max_attempts: u32,
    #[serde(with = "super::serde_helpers")]
    pub initial_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryGroup {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            jitter: false,
        }
    }
}

impl From<&RetryGroup> for RetryConfig {
    fn from(group: &RetryGroup) -> Self {
        RetryConfig {
            max_attempts: group.max_attempts,
            initial_delay: group.initial_delay,
            jitter: group.jitter,
        }
    }
}

/// Wait, pause and interval settings of the background loops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleGroup {
    #[serde(with = "super::serde_helpers")]
    pub queue_wait: Duration,
    #[serde(with = "super::serde_helpers")]
    pub batch_pause: Duration,
    #[serde(with = "super::serde_helpers")]
    pub auto_upload_interval: Duration,
    #[serde(with = "super::serde_helpers")]
    pub config_check_interval: Duration,
    #[serde(with = "super::serde_helpers")]
    pub reconcile_interval: Duration,
}

impl Default for ScheduleGroup {
    fn default() -> Self {
        Self {
            queue_wait: Duration::from_secs(1),
            batch_pause: Duration::from_millis(500),
            auto_upload_interval: Duration::from_secs(3600),
            config_check_interval: Duration::from_secs(3600),
            reconcile_interval: Duration::from_secs(900),
        }
    }
}
