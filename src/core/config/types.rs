use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub(super) server: ServerSettings,
    pub(super) runtime: RuntimeSettings,
    pub(super) api: ApiSettings,
    pub(super) security: SecuritySettings,
    pub(super) cors: CorsSettings,
    pub(super) database: DatabaseSettings,
    pub(super) redis: RedisSettings,
    pub(super) grader: GraderSettings,
    pub(super) converter: ConverterSettings,
    pub(super) grading: GradingSettings,
    pub(super) storage: StorageSettings,
    pub(super) s3: S3Settings,
    pub(super) retention: RetentionSettings,
    pub(super) telemetry: TelemetrySettings,
}

#[derive(Debug, Clone)]
pub(crate) struct ServerSettings {
    pub(super) host: ServerHost,
    pub(super) port: ServerPort,
}

#[derive(Debug, Clone)]
pub(crate) struct ApiSettings {
    pub(crate) project_name: String,
    pub(crate) version: String,
    pub(crate) api_v1_str: String,
}

#[derive(Debug, Clone)]
pub(crate) struct SecuritySettings {
    pub(crate) secret_key: String,
    pub(crate) algorithm: String,
}

#[derive(Debug, Clone)]
pub(crate) struct CorsSettings {
    pub(crate) origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct DatabaseSettings {
    pub(crate) postgres_server: String,
    pub(crate) postgres_port: u16,
    pub(crate) postgres_user: String,
    pub(crate) postgres_password: String,
    pub(crate) postgres_db: String,
    pub(crate) database_url: Option<String>,
    pub(crate) max_connections: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct RedisSettings {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) db: u16,
    pub(crate) password: String,
}

/// OpenAI-compatible chat completions endpoint used to score essays.
#[derive(Debug, Clone)]
pub(crate) struct GraderSettings {
    pub(crate) api_key: String,
    pub(crate) base_url: String,
    pub(crate) model: String,
    pub(crate) max_tokens: u32,
    pub(crate) temperature: f64,
}

/// Document conversion service used for pdf and docx text extraction.
#[derive(Debug, Clone)]
pub(crate) struct ConverterSettings {
    pub(crate) api_key: String,
    pub(crate) base_url: String,
    pub(crate) timeout_seconds: u64,
    pub(crate) poll_interval_seconds: u64,
    pub(crate) max_poll_attempts: u32,
    pub(crate) max_submit_retries: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct GradingSettings {
    pub(crate) worker_concurrency: usize,
    pub(crate) max_attempts: u32,
    pub(crate) backoff_base_seconds: u64,
    pub(crate) backoff_max_seconds: u64,
    pub(crate) grader_timeout_seconds: u64,
    pub(crate) extract_timeout_seconds: u64,
    pub(crate) lease_margin_seconds: u64,
    pub(crate) idle_poll_millis: u64,
    pub(crate) stale_check_interval_seconds: u64,
    pub(crate) batch_start_limit_per_minute: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct StorageSettings {
    pub(crate) max_upload_size_mb: u64,
    pub(crate) allowed_extensions: Vec<String>,
    pub(crate) max_files_per_upload: usize,
    pub(crate) max_upload_total_mb: u64,
    pub(crate) upload_limit_per_minute: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct S3Settings {
    pub(crate) endpoint: String,
    pub(crate) access_key: String,
    pub(crate) secret_key: String,
    pub(crate) bucket: String,
    pub(crate) region: String,
}

#[derive(Debug, Clone)]
pub(crate) struct RetentionSettings {
    pub(crate) days: u64,
    pub(crate) sweep_interval_seconds: u64,
    pub(crate) sweep_batch_size: u32,
    pub(crate) sweep_max_pages: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct TelemetrySettings {
    pub(crate) log_level: String,
    pub(crate) json: bool,
    pub(crate) prometheus_enabled: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct RuntimeSettings {
    pub(crate) environment: Environment,
    pub(crate) strict_config: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Environment {
    Development,
    Production,
    Staging,
    Test,
}

impl Environment {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Staging => "staging",
            Self::Test => "test",
        }
    }

    pub(super) fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ServerHost(pub(super) String);

#[derive(Debug, Clone, Copy)]
pub(crate) struct ServerPort(pub(super) u16);

#[derive(Debug, Error)]
pub(crate) enum ConfigError {
    #[error("invalid server host: {0}")]
    InvalidHost(String),
    #[error("invalid server port: {0}")]
    InvalidPort(String),
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
    #[error("invalid cors origins: {0}")]
    InvalidCors(String),
    #[error("missing required secret for {0}")]
    MissingSecret(&'static str),
}

impl DatabaseSettings {
    pub(crate) fn database_url(&self) -> String {
        if let Some(url) = &self.database_url {
            return url.clone();
        }

        format!(
            "postgresql://{}:{}@{}:{}/{}",
            self.postgres_user,
            self.postgres_password,
            self.postgres_server,
            self.postgres_port,
            self.postgres_db
        )
    }
}

impl RedisSettings {
    pub(crate) fn redis_url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}:{}/{}", self.host, self.port, self.db)
        } else {
            format!("redis://:{}@{}:{}/{}", self.password, self.host, self.port, self.db)
        }
    }
}

impl GradingSettings {
    pub(crate) fn grader_timeout(&self) -> Duration {
        Duration::from_secs(self.grader_timeout_seconds)
    }

    pub(crate) fn extract_timeout(&self) -> Duration {
        Duration::from_secs(self.extract_timeout_seconds)
    }

    /// How long a claim may stay in `processing` before it is considered abandoned.
    pub(crate) fn lease_duration(&self) -> Duration {
        Duration::from_secs(
            self.grader_timeout_seconds
                .saturating_add(self.extract_timeout_seconds)
                .saturating_add(self.lease_margin_seconds),
        )
    }

    pub(crate) fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_millis)
    }

    /// Delay before attempt `attempt + 1`, doubling from the base and capped.
    pub(crate) fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let seconds =
            self.backoff_base_seconds.saturating_mul(2_u64.pow(exponent)).min(self.backoff_max_seconds);
        Duration::from_secs(seconds)
    }
}

impl StorageSettings {
    pub(crate) fn max_upload_bytes(&self) -> u64 {
        self.max_upload_size_mb.saturating_mul(1024 * 1024)
    }

    /// Caps the request body and the bytes inflated from archives in one upload.
    pub(crate) fn max_total_upload_bytes(&self) -> u64 {
        self.max_upload_total_mb.saturating_mul(1024 * 1024)
    }
}

impl ServerHost {
    pub(super) fn parse(value: String) -> Result<Self, ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::InvalidHost(value));
        }

        Ok(Self(value))
    }
}

impl ServerPort {
    pub(super) fn parse(value: String) -> Result<Self, ConfigError> {
        let parsed: u16 = value.parse().map_err(|_| ConfigError::InvalidPort(value.clone()))?;
        if parsed == 0 {
            return Err(ConfigError::InvalidPort(value));
        }

        Ok(Self(parsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grading(base: u64, max: u64) -> GradingSettings {
        GradingSettings {
            worker_concurrency: 1,
            max_attempts: 3,
            backoff_base_seconds: base,
            backoff_max_seconds: max,
            grader_timeout_seconds: 120,
            extract_timeout_seconds: 60,
            lease_margin_seconds: 30,
            idle_poll_millis: 500,
            stale_check_interval_seconds: 60,
            batch_start_limit_per_minute: 10,
        }
    }

    #[test]
    fn backoff_doubles_per_attempt_and_caps() {
        let settings = grading(30, 100);
        assert_eq!(settings.backoff_for(1), Duration::from_secs(30));
        assert_eq!(settings.backoff_for(2), Duration::from_secs(60));
        assert_eq!(settings.backoff_for(3), Duration::from_secs(100));
        assert_eq!(settings.backoff_for(40), Duration::from_secs(100));
    }

    #[test]
    fn lease_covers_both_collaborator_timeouts() {
        assert_eq!(grading(30, 600).lease_duration(), Duration::from_secs(210));
    }
}
