use super::{Config, ConfigError};
use url::Url;

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(endpoint) = &self.endpoint {
            validate_http_url("endpoint", endpoint)?;
        }
        if let Some(url) = &self.remote_config_url {
            validate_http_url("remote config URL", url)?;
        }

        if self.chunk_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "Chunk size must be greater than 0".to_string(),
            ));
        }

        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "Max attempts must be greater than 0".to_string(),
            ));
        }

        if self.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "Request timeout must be greater than 0".to_string(),
            ));
        }

        for (name, value) in [
            ("Queue wait", self.queue_wait_ms),
            ("Auto upload interval", self.auto_upload_interval_secs),
            ("Config check interval", self.config_check_interval_secs),
            ("Reconcile interval", self.reconcile_interval_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidConfig(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        Ok(())
    }
}

fn validate_http_url(name: &str, raw: &str) -> Result<(), ConfigError> {
    let url = Url::parse(raw)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid {name} '{raw}': {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ConfigError::InvalidUrl(format!(
            "Invalid {name} '{raw}': unsupported scheme '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        let mut config = Config::default();
        config.post_process().unwrap();
        config
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let config = Config {
            chunk_size: 0,
            ..valid()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = Config {
            config_check_interval_secs: 0,
            ..valid()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_endpoint_must_be_http() {
        let config = Config {
            endpoint: Some("file:///etc/passwd".into()),
            ..valid()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidUrl(_))));

        let config = Config {
            endpoint: Some("https://collector.example/upload".into()),
            ..valid()
        };
        assert!(config.validate().is_ok());
    }
}
