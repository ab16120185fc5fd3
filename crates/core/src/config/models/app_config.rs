use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    cache::CacheConfig, database::DatabaseConfig, observability::ObservabilityConfig,
    scheduler::SchedulerConfig,
};

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub scheduler: SchedulerConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load configuration from config file and environment variables
    ///
    /// Load order:
    /// 1. Default configuration
    /// 2. Config file (TOML format)
    /// 3. Environment variable overrides (prefix: JOBS_, nesting: `__`)
    ///
    /// # Arguments
    ///
    /// * `config_path` - Config file path, if None use default paths
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = ["config/jobs.toml", "jobs.toml", "/etc/admin-jobs/config.toml"];

            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("JOBS")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    /// Validate configuration effectiveness
    pub fn validate(&self) -> Result<()> {
        self.database.validate().context("数据库配置验证失败")?;

        self.cache.validate().context("缓存配置验证失败")?;

        self.scheduler.validate().context("调度器配置验证失败")?;

        self.observability
            .validate()
            .context("可观测性配置验证失败")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.default_lock_ttl_seconds, 180);
        assert_eq!(config.scheduler.heartbeat_interval_seconds, 15);
        assert_eq!(config.scheduler.exception_max_chars, 2000);
        assert!(!config.cache.enabled);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [database]
            url = "memory://"

            [scheduler]
            default_lock_ttl_seconds = 60
            "#,
        )
        .unwrap();
        assert!(config.database.is_memory());
        assert_eq!(config.scheduler.default_lock_ttl_seconds, 60);
        assert_eq!(config.scheduler.stream_buffer_size, 256);
        assert_eq!(config.observability.log_level, "info");
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(AppConfig::from_toml("[database]\nurl = \"postgres://x\"").is_err());
        assert!(AppConfig::from_toml("[cache]\nenabled = true\nredis_url = \"http://x\"").is_err());
        assert!(AppConfig::from_toml("[scheduler]\nstream_buffer_size = 0").is_err());
        assert!(AppConfig::from_toml("[observability]\nlog_format = \"xml\"").is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = AppConfig::default();
        let text = config.to_toml().unwrap();
        let parsed = AppConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.database.url, config.database.url);
        assert_eq!(parsed.cache.redis_url, config.cache.redis_url);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[cache]\nenabled = true\nredis_url = \"redis://cache:6379\"\n[scheduler]\nmisfire_threshold_ms = 250"
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path().to_str().unwrap())).unwrap();
        assert!(config.cache.enabled);
        assert_eq!(config.cache.redis_url, "redis://cache:6379");
        assert_eq!(config.scheduler.misfire_threshold_ms, 250);
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(AppConfig::load(Some("/nonexistent/jobs.toml")).is_err());
    }
}
