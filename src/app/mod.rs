pub mod config;
pub mod initialization;
pub mod logging_system;
pub mod service;
pub mod shutdown;

pub use config::{Command, Config, ConfigError, LogFormat, LogLevel};
pub use initialization::InitializationError;
pub use logging_system::{LoggingSystem, setup_logging};
pub use service::{ServiceError, ServiceManager};

use anyhow::Context;
use tracing::info;

pub struct App {
    command: Option<Command>,
    service_manager: ServiceManager,
}

impl App {
    pub async fn from_args<I, T>(args: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let config = Config::from_args_and_file(args).context("invalid configuration")?;
        Self::from_config(config).await
    }

    pub async fn from_config(mut config: Config) -> anyhow::Result<Self> {
        setup_logging(config.log_level, config.log_format, &config.log_directives)
            .context("failed to initialize logging")?;

        info!("Starting session-telemetry v{}", crate::VERSION);
        info!(
            endpoint_configured = config.endpoint.is_some(),
            remote_config = config.remote_config_url.is_some(),
            chunk_size = config.chunk_size,
            "configuration loaded"
        );

        let command = config.command.take();
        let service_manager = ServiceManager::new(config)
            .await
            .context("failed to initialize service")?;

        Ok(Self {
            command,
            service_manager,
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        match self.command {
            None | Some(Command::Run) => {
                self.service_manager.start().await?;
                info!("session-telemetry is running. Press Ctrl+C to stop.");
                self.service_manager.run_until_shutdown().await;
                info!("session-telemetry stopped.");
            }
            Some(command) => {
                self.service_manager.restore_endpoint().await?;
                let output = self.service_manager.execute(&command).await;
                self.service_manager.engine().shutdown().await;
                println!("{}", serde_json::to_string_pretty(&output?)?);
            }
        }
        Ok(())
    }
}

pub async fn main() -> anyhow::Result<()> {
    App::from_args(std::env::args_os()).await?.run().await
}
