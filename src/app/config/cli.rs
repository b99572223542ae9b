use super::groups::{RetryGroup, ScheduleGroup};
use super::{ConfigError, LogFormat, LogLevel};
use crate::domain::RuntimeSettings;
use crate::sync::EngineConfig;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR_NAME: &str = "session-telemetry";

/// One-shot operations. Without a subcommand the daemon runs.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the background workers until interrupted
    Run,
    /// Print engine status as JSON
    Status,
    /// Upload the whole session cache as one payload
    Upload,
    /// Upload a single session by id prefix
    UploadSession { id_prefix: String },
    /// Upload the session cache in chunks
    UploadBatched {
        #[arg(long)]
        chunk_size: Option<usize>,
    },
    /// Retry everything in the pending log
    RetryPending,
    /// Fetch remote config now and apply it
    CheckConfig,
    /// Persist the endpoint (and token) to the local config file
    SaveEndpoint {
        endpoint: String,
        #[arg(long)]
        token: Option<String>,
    },
    /// Write a local snapshot of the session cache
    Snapshot,
    /// List local snapshots, newest first
    ListSnapshots,
    /// Bundle local snapshots into one export file
    Export,
    /// Print a short row per cached session
    Summary {
        #[arg(long, default_value = "100")]
        limit: usize,
    },
}

/// Session telemetry sync daemon: CLI flags, environment and an optional TOML file.
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(author, version, about, long_about = None)]
#[serde(default)]
pub struct Config {
    /// Directory holding the pending log, machine id and config files
    #[arg(long, env = "SESSION_TELEMETRY_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Collector upload endpoint (falls back to the saved local config)
    #[arg(long, env = "SESSION_TELEMETRY_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Bearer token sent with uploads
    #[arg(long, env = "SESSION_TELEMETRY_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// URL of the remote config document
    #[arg(long, env = "SESSION_TELEMETRY_REMOTE_CONFIG_URL")]
    pub remote_config_url: Option<String>,

    /// JSON file holding the session cache
    #[arg(long, env = "SESSION_TELEMETRY_SESSIONS_FILE")]
    pub sessions_file: Option<PathBuf>,

    /// Consent marker file; transmission is allowed only while it exists
    #[arg(long, env = "SESSION_TELEMETRY_CONSENT_FILE")]
    pub consent_file: Option<PathBuf>,

    /// Sessions per batch for batched uploads
    #[arg(long, env = "CHUNK_SIZE", default_value = "50")]
    pub chunk_size: usize,

    /// Per-request timeout in seconds
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value = "30")]
    pub request_timeout_secs: u64,

    /// Attempts per upload unit before it goes to the pending log
    #[arg(long, env = "MAX_ATTEMPTS", default_value = "3")]
    pub max_attempts: u32,

    /// Backoff before the first retry, doubled for each further retry
    #[arg(long, env = "INITIAL_DELAY_MS", default_value = "1000")]
    pub initial_delay_ms: u64,

    /// Bounded wait of the upload queue worker
    #[arg(long, env = "QUEUE_WAIT_MS", default_value = "1000")]
    pub queue_wait_ms: u64,

    /// Scale each retry backoff by a random factor in [0.5, 1.5)
    #[arg(long, env = "RETRY_JITTER")]
    pub retry_jitter: bool,

    /// Pause between batches of a batched upload
    #[arg(long, env = "BATCH_PAUSE_MS", default_value = "500")]
    pub batch_pause_ms: u64,

    #[arg(long, env = "AUTO_UPLOAD_INTERVAL_SECS", default_value = "3600")]
    pub auto_upload_interval_secs: u64,

    #[arg(long, env = "CONFIG_CHECK_INTERVAL_SECS", default_value = "3600")]
    pub config_check_interval_secs: u64,

    /// How often the daemon retries the pending log
    #[arg(long, env = "RECONCILE_INTERVAL_SECS", default_value = "900")]
    pub reconcile_interval_secs: u64,

    /// Start the auto-upload worker at startup
    #[arg(long, env = "AUTO_UPLOAD")]
    pub auto_upload: bool,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: LogLevel,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,

    /// Extra `target=level` filter entries, e.g. `reqwest=debug`
    #[arg(long = "log-directive", env = "LOG_DIRECTIVES", value_delimiter = ',')]
    pub log_directives: Vec<String>,

    /// Configuration file path (optional, TOML)
    #[arg(long, env = "CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    #[serde(skip)]
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Derived fields (not CLI arguments)
    #[serde(skip)]
    #[arg(skip)]
    pub data_path: PathBuf,

    #[serde(skip)]
    #[arg(skip)]
    pub request_timeout: Duration,

    #[serde(skip)]
    #[arg(skip)]
    pub retry: RetryGroup,

    #[serde(skip)]
    #[arg(skip)]
    pub schedule: ScheduleGroup,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            endpoint: None,
            token: None,
            remote_config_url: None,
            sessions_file: None,
            consent_file: None,
            chunk_size: 50,
            request_timeout_secs: 30,
            max_attempts: 3,
            initial_delay_ms: 1000,
            retry_jitter: false,
            queue_wait_ms: 1000,
            batch_pause_ms: 500,
            auto_upload_interval_secs: 3600,
            config_check_interval_secs: 3600,
            reconcile_interval_secs: 900,
            auto_upload: false,
            log_level: LogLevel::Info,
            log_format: LogFormat::Text,
            log_directives: Vec::new(),
            config_file: None,
            command: None,
            data_path: default_data_dir(),
            request_timeout: Duration::from_secs(30),
            retry: RetryGroup::default(),
            schedule: ScheduleGroup::default(),
        }
    }
}

// Take `base.field` wherever `target.field` still holds the built-in default.
macro_rules! inherit_unset {
    ($target:ident, $base:ident, $default:ident; $($field:ident),+ $(,)?) => {
        $(
            if $target.$field == $default.$field {
                $target.$field = $base.$field.clone();
            }
        )+
    };
}

impl Config {
    pub fn from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let mut config = Config::parse_from(args);
        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    /// CLI and environment first, then the TOML file named by `--config-file` for anything left unset.
    pub fn from_args_and_file<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let mut config = Config::parse_from(args);
        if let Some(path) = config.config_file.clone() {
            let file = Self::read_file(&path)?;
            config.merge_unset(&file);
        }
        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::read_file(path.as_ref())?;
        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    fn read_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    fn merge_unset(&mut self, base: &Config) {
        let defaults = Config::default();
        inherit_unset!(self, base, defaults;
            data_dir,
            endpoint,
            token,
            remote_config_url,
            sessions_file,
            consent_file,
            chunk_size,
            request_timeout_secs,
            max_attempts,
            initial_delay_ms,
            retry_jitter,
            queue_wait_ms,
            batch_pause_ms,
            auto_upload_interval_secs,
            config_check_interval_secs,
            reconcile_interval_secs,
            auto_upload,
            log_level,
            log_format,
            log_directives,
        );
    }

    pub fn post_process(&mut self) -> Result<(), ConfigError> {
        self.data_path = self.data_dir.clone().unwrap_or_else(default_data_dir);
        self.request_timeout = Duration::from_secs(self.request_timeout_secs);

        self.retry.max_attempts = self.max_attempts;
        self.retry.initial_delay = Duration::from_millis(self.initial_delay_ms);
        self.retry.jitter = self.retry_jitter;

        self.schedule = ScheduleGroup {
            queue_wait: Duration::from_millis(self.queue_wait_ms),
            batch_pause: Duration::from_millis(self.batch_pause_ms),
            auto_upload_interval: Duration::from_secs(self.auto_upload_interval_secs),
            config_check_interval: Duration::from_secs(self.config_check_interval_secs),
            reconcile_interval: Duration::from_secs(self.reconcile_interval_secs),
        };

        Ok(())
    }

    pub fn consent_path(&self) -> PathBuf {
        self.consent_file
            .clone()
            .unwrap_or_else(|| self.data_path.join("consent"))
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            chunk_size: self.chunk_size,
            request_timeout: self.request_timeout,
            retry: (&self.retry).into(),
            queue_wait: self.schedule.queue_wait,
            batch_pause: self.schedule.batch_pause,
            config_check_interval: self.schedule.config_check_interval,
            initial_settings: RuntimeSettings {
                endpoint: self.endpoint.clone().filter(|e| !e.is_empty()),
                token: self.token.clone().filter(|t| !t.is_empty()),
                enabled: true,
                auto_upload: self.auto_upload,
                upload_interval: self.schedule.auto_upload_interval,
            },
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR_NAME)
}
