use aggregator::config::{CacheConfig, Config as NewsConfig, ValidationError};
use serde::Deserialize;
use std::fs::File;
use std::path::Path;

#[derive(Debug, Deserialize, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
    #[serde(default = "default_metrics_prefix")]
    pub prefix: String,
}

fn default_metrics_prefix() -> String {
    "infohub".into()
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Default, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Filter directive, overridden by `RUST_LOG` and `LOG_LEVEL`.
    pub level: Option<String>,
    #[serde(default)]
    pub format: LogFormat,
    pub sentry_dsn: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CommonConfig {
    pub metrics: Option<MetricsConfig>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(flatten)]
    pub common: CommonConfig,
    pub news: NewsConfig,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let data = serde_yaml::from_reader(file)?;

        Ok(data)
    }

    /// Reads, overrides from the process environment and validates.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.news.validate()?;

        Ok(config)
    }

    pub fn apply_env_overrides<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let CacheConfig::Redis { address, .. } = &mut self.news.cache
            && let Some(value) = var("REDIS_ADDRESS").filter(|v| !v.is_empty())
        {
            *address = value;
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    ValidationError(#[from] ValidationError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tmp_file(s: &str) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        write!(tmp, "{}", s).expect("write yaml");

        tmp
    }

    #[test]
    fn full_config() {
        let yaml = r#"
            metrics:
                statsd_host: 127.0.0.1
                statsd_port: 8125
            logging:
                level: debug
                format: json
                sentry_dsn: https://key@sentry.example.com/1
            news:
                listener:
                    host: 0.0.0.0
                    port: 8080
                sources:
                    - name: tech
                      url: https://tech.example.com/api/news
                cache:
                    type: redis
                    address: redis://cache:6379
            "#;
        let tmp = write_tmp_file(yaml);
        let config = Config::load(tmp.path()).expect("load config");

        let metrics = config.common.metrics.expect("metrics config");
        assert_eq!(metrics.statsd_port, 8125);
        assert_eq!(metrics.prefix, "infohub");

        let logging = config.common.logging.expect("logging config");
        assert_eq!(logging.level.as_deref(), Some("debug"));
        assert_eq!(logging.format, LogFormat::Json);
        assert!(logging.sentry_dsn.is_some());

        assert_eq!(config.news.listener.host, "0.0.0.0");
        assert_eq!(config.news.sources[0].name, "tech");
    }

    #[test]
    fn minimal_config() {
        let yaml = r#"
            news:
                sources:
                    - name: tech
                      url: https://tech.example.com/api/news
            "#;
        let tmp = write_tmp_file(yaml);
        let config = Config::from_file(tmp.path()).expect("load config");

        assert!(config.common.metrics.is_none());
        assert!(config.common.logging.is_none());
        assert_eq!(config.news.cache, CacheConfig::memory());
    }

    #[test]
    fn redis_address_override() {
        let yaml = r#"
            news:
                sources:
                    - name: tech
                      url: https://tech.example.com/api/news
                cache:
                    type: redis
            "#;
        let tmp = write_tmp_file(yaml);
        let mut config = Config::from_file(tmp.path()).expect("load config");

        config.apply_env_overrides(|name| {
            (name == "REDIS_ADDRESS").then(|| "redis://override:6379".to_string())
        });

        match config.news.cache {
            CacheConfig::Redis { address, .. } => assert_eq!(address, "redis://override:6379"),
            other => panic!("unexpected cache config {other:?}"),
        }
    }

    #[test]
    fn invalid_config() {
        let tmp = write_tmp_file("news:\n    sources: []\n");
        assert!(matches!(
            Config::load(tmp.path()),
            Err(ConfigError::ValidationError(ValidationError::NoSources))
        ));

        let tmp = write_tmp_file("news: [not, a, map]");
        assert!(matches!(
            Config::from_file(tmp.path()),
            Err(ConfigError::ParseError(_))
        ));

        assert!(matches!(
            Config::from_file(Path::new("/nonexistent/infohub.yaml")),
            Err(ConfigError::LoadError(_))
        ));
    }
}
