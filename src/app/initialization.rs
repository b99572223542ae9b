use super::config::LogLevel;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InitializationError {
    #[error("Invalid log level '{input}'. Valid levels: {valid_levels:?}")]
    InvalidLogLevel {
        input: String,
        valid_levels: Vec<String>,
    },

    #[error("Invalid directive format '{input}'. Expected: '{expected}'")]
    InvalidDirectiveFormat { input: String, expected: String },

    #[error("Empty target in directive '{input}'")]
    EmptyTarget { input: String },

    #[error("Logging system initialization failed: {details}")]
    LoggingInitFailed {
        details: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl InitializationError {
    /// Directive problems only cost a filter entry; the rest abort startup.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            InitializationError::InvalidLogLevel { .. }
                | InitializationError::InvalidDirectiveFormat { .. }
                | InitializationError::EmptyTarget { .. }
        )
    }
}

/// One `target=level` entry of the log filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogDirective {
    pub target: String,
    pub level: LogLevel,
}

impl LogDirective {
    pub fn new(target: impl Into<String>, level: LogLevel) -> Self {
        Self {
            target: target.into(),
            level,
        }
    }

    pub fn parse(directive: &str) -> Result<Self, InitializationError> {
        let Some((target, level)) = directive.split_once('=') else {
            return Err(InitializationError::InvalidDirectiveFormat {
                input: directive.to_string(),
                expected: "target=level".to_string(),
            });
        };
        if level.contains('=') {
            return Err(InitializationError::InvalidDirectiveFormat {
                input: directive.to_string(),
                expected: "target=level".to_string(),
            });
        }

        let target = target.trim();
        if target.is_empty() {
            return Err(InitializationError::EmptyTarget {
                input: directive.to_string(),
            });
        }

        Ok(LogDirective::new(target, LogLevel::from_str(level)?))
    }

    pub fn to_filter_string(&self) -> String {
        format!("{}={}", self.target, self.level.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_from_str() {
        assert_eq!(LogLevel::from_str("error").unwrap(), LogLevel::Error);
        assert_eq!(LogLevel::from_str("warning").unwrap(), LogLevel::Warn);
        assert_eq!(LogLevel::from_str("DEBUG").unwrap(), LogLevel::Debug);

        match LogLevel::from_str("loud") {
            Err(InitializationError::InvalidLogLevel { valid_levels, .. }) => {
                assert_eq!(valid_levels.len(), 5);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_log_directive_parsing_valid_cases() {
        let valid_cases = [
            ("hyper=warn", "hyper", LogLevel::Warn),
            ("reqwest=error", "reqwest", LogLevel::Error),
            (" session_telemetry = trace", "session_telemetry", LogLevel::Trace),
        ];

        for (input, target, level) in valid_cases {
            let directive = LogDirective::parse(input).unwrap();
            assert_eq!(directive.target, target);
            assert_eq!(directive.level, level);
        }
    }

    #[test]
    fn test_log_directive_parsing_invalid_cases() {
        let invalid_cases = [
            ("", "empty string"),
            ("hyper", "missing level"),
            ("=warn", "empty target"),
            ("hyper=", "empty level"),
            ("hyper=invalid", "invalid level"),
            ("hyper=warn=extra", "too many parts"),
            ("  =warn", "empty target with spaces"),
        ];

        for (input, description) in invalid_cases {
            assert!(
                LogDirective::parse(input).is_err(),
                "Should fail for {description}: {input}"
            );
        }
    }

    #[test]
    fn test_log_directive_to_filter_string() {
        let directive = LogDirective::new("hyper", LogLevel::Warn);
        assert_eq!(directive.to_filter_string(), "hyper=warn");
    }

    #[test]
    fn test_recoverability() {
        assert!(
            InitializationError::EmptyTarget {
                input: "=warn".into()
            }
            .is_recoverable()
        );
        assert!(
            !InitializationError::LoggingInitFailed {
                details: "subscriber already set".into(),
                source: Box::new(std::io::Error::other("denied")),
            }
            .is_recoverable()
        );
    }
}
