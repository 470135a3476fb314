use super::parsing::{
    env_optional, env_or_default, is_extractable_extension, parse_bool, parse_cors_origins,
    parse_environment, parse_f64, parse_string_list, parse_u16, parse_u32, parse_u64,
};
use super::secret::load_or_create_secret_key;
use super::types::{
    ApiSettings, ConfigError, ConverterSettings, CorsSettings, DatabaseSettings, GraderSettings,
    GradingSettings, RedisSettings, RetentionSettings, RuntimeSettings, S3Settings,
    SecuritySettings, ServerHost, ServerPort, ServerSettings, Settings, StorageSettings,
    TelemetrySettings,
};

impl Settings {
    pub(crate) fn load() -> Result<Self, ConfigError> {
        let host = env_or_default("ESSAY_HOST", "0.0.0.0");
        let port = env_or_default("ESSAY_PORT", "8000");

        let environment =
            parse_environment(env_optional("ESSAY_ENV").or_else(|| env_optional("ENVIRONMENT")));
        let strict_config =
            env_optional("ESSAY_STRICT_CONFIG").map(|value| parse_bool(&value)).unwrap_or(false)
                || environment.is_production();

        let project_name = env_or_default("PROJECT_NAME", "Essay Grader API");
        let version = env_or_default("VERSION", env!("CARGO_PKG_VERSION"));
        let api_v1_str = env_or_default("API_V1_STR", "/api/v1");

        let secret_key = match env_optional("SECRET_KEY") {
            Some(value) => value,
            None => load_or_create_secret_key(),
        };
        let algorithm = env_or_default("ALGORITHM", "HS256");

        let cors_origins = parse_cors_origins(env_optional("BACKEND_CORS_ORIGINS"))?;

        let postgres_server = env_or_default("POSTGRES_SERVER", "localhost");
        let postgres_port = parse_u16("POSTGRES_PORT", env_or_default("POSTGRES_PORT", "5432"))?;
        let postgres_user = env_or_default("POSTGRES_USER", "essaygrader");
        let postgres_password = env_or_default("POSTGRES_PASSWORD", "");
        let postgres_db = env_or_default("POSTGRES_DB", "essay_grader");
        let database_url = env_optional("DATABASE_URL");
        let max_connections =
            parse_u32("DATABASE_MAX_CONNECTIONS", env_or_default("DATABASE_MAX_CONNECTIONS", "20"))?;

        let redis_host = env_or_default("REDIS_HOST", "localhost");
        let redis_port = parse_u16("REDIS_PORT", env_or_default("REDIS_PORT", "6379"))?;
        let redis_db = parse_u16("REDIS_DB", env_or_default("REDIS_DB", "0"))?;
        let redis_password = env_or_default("REDIS_PASSWORD", "");

        let grader_api_key = env_or_default("GRADER_API_KEY", "");
        let grader_base_url = env_or_default("GRADER_BASE_URL", "https://api.openai.com/v1");
        let grader_model = env_or_default("GRADER_MODEL", "gpt-4o-mini");
        let grader_max_tokens =
            parse_u32("GRADER_MAX_TOKENS", env_or_default("GRADER_MAX_TOKENS", "4000"))?;
        let grader_temperature =
            parse_f64("GRADER_TEMPERATURE", env_or_default("GRADER_TEMPERATURE", "0.2"))?;

        let converter_api_key = env_or_default("CONVERTER_API_KEY", "");
        let converter_base_url =
            env_or_default("CONVERTER_BASE_URL", "https://www.datalab.to/api/v1");
        let converter_timeout_seconds = parse_u64(
            "CONVERTER_TIMEOUT_SECONDS",
            env_or_default("CONVERTER_TIMEOUT_SECONDS", "60"),
        )?;
        let converter_poll_interval_seconds = parse_u64(
            "CONVERTER_POLL_INTERVAL_SECONDS",
            env_or_default("CONVERTER_POLL_INTERVAL_SECONDS", "2"),
        )?;
        let converter_max_poll_attempts = parse_u32(
            "CONVERTER_MAX_POLL_ATTEMPTS",
            env_or_default("CONVERTER_MAX_POLL_ATTEMPTS", "30"),
        )?;
        let converter_max_submit_retries = parse_u32(
            "CONVERTER_MAX_SUBMIT_RETRIES",
            env_or_default("CONVERTER_MAX_SUBMIT_RETRIES", "2"),
        )?;

        let worker_concurrency =
            parse_u32("GRADING_WORKERS", env_or_default("GRADING_WORKERS", "4"))? as usize;
        let max_attempts =
            parse_u32("GRADING_MAX_ATTEMPTS", env_or_default("GRADING_MAX_ATTEMPTS", "3"))?;
        let backoff_base_seconds = parse_u64(
            "GRADING_BACKOFF_BASE_SECONDS",
            env_or_default("GRADING_BACKOFF_BASE_SECONDS", "30"),
        )?;
        let backoff_max_seconds = parse_u64(
            "GRADING_BACKOFF_MAX_SECONDS",
            env_or_default("GRADING_BACKOFF_MAX_SECONDS", "600"),
        )?;
        let grader_timeout_seconds =
            parse_u64("GRADER_TIMEOUT_SECONDS", env_or_default("GRADER_TIMEOUT_SECONDS", "120"))?;
        let extract_timeout_seconds = parse_u64(
            "EXTRACT_TIMEOUT_SECONDS",
            env_or_default("EXTRACT_TIMEOUT_SECONDS", "120"),
        )?;
        let lease_margin_seconds = parse_u64(
            "GRADING_LEASE_MARGIN_SECONDS",
            env_or_default("GRADING_LEASE_MARGIN_SECONDS", "120"),
        )?;
        let idle_poll_millis =
            parse_u64("GRADING_IDLE_POLL_MS", env_or_default("GRADING_IDLE_POLL_MS", "2000"))?;
        let stale_check_interval_seconds = parse_u64(
            "GRADING_STALE_CHECK_INTERVAL_SECONDS",
            env_or_default("GRADING_STALE_CHECK_INTERVAL_SECONDS", "300"),
        )?;
        let batch_start_limit_per_minute = parse_u64(
            "BATCH_START_LIMIT_PER_MINUTE",
            env_or_default("BATCH_START_LIMIT_PER_MINUTE", "20"),
        )?;

        let max_upload_size_mb =
            parse_u64("MAX_UPLOAD_SIZE_MB", env_or_default("MAX_UPLOAD_SIZE_MB", "25"))?;
        let allowed_extensions =
            parse_string_list(env_optional("ALLOWED_ESSAY_EXTENSIONS"), &["pdf", "docx", "txt"]);
        let max_files_per_upload = parse_u32(
            "MAX_FILES_PER_UPLOAD",
            env_or_default("MAX_FILES_PER_UPLOAD", "500"),
        )? as usize;
        let max_upload_total_mb =
            parse_u64("MAX_UPLOAD_TOTAL_MB", env_or_default("MAX_UPLOAD_TOTAL_MB", "200"))?;
        let upload_limit_per_minute = parse_u64(
            "UPLOAD_LIMIT_PER_MINUTE",
            env_or_default("UPLOAD_LIMIT_PER_MINUTE", "30"),
        )?;

        let s3_endpoint = env_or_default("S3_ENDPOINT", "http://localhost:9000");
        let s3_access_key = env_or_default("S3_ACCESS_KEY", "");
        let s3_secret_key = env_or_default("S3_SECRET_KEY", "");
        let s3_bucket = env_or_default("S3_BUCKET", "essay-grader");
        let s3_region = env_or_default("S3_REGION", "us-east-1");

        let retention_days = parse_u64("RETENTION_DAYS", env_or_default("RETENTION_DAYS", "30"))?;
        let sweep_interval_seconds = parse_u64(
            "RETENTION_SWEEP_INTERVAL_SECONDS",
            env_or_default("RETENTION_SWEEP_INTERVAL_SECONDS", "3600"),
        )?;
        let sweep_batch_size = parse_u32(
            "RETENTION_SWEEP_BATCH_SIZE",
            env_or_default("RETENTION_SWEEP_BATCH_SIZE", "100"),
        )?;
        let sweep_max_pages = parse_u32(
            "RETENTION_SWEEP_MAX_PAGES",
            env_or_default("RETENTION_SWEEP_MAX_PAGES", "20"),
        )?;

        let log_level = env_or_default("ESSAY_LOG_LEVEL", "info");
        let json = env_optional("ESSAY_LOG_JSON").map(|value| parse_bool(&value)).unwrap_or(false);
        let prometheus_enabled =
            env_optional("PROMETHEUS_ENABLED").map(|value| parse_bool(&value)).unwrap_or(false);

        let settings = Self {
            server: ServerSettings {
                host: ServerHost::parse(host)?,
                port: ServerPort::parse(port)?,
            },
            runtime: RuntimeSettings { environment, strict_config },
            api: ApiSettings { project_name, version, api_v1_str },
            security: SecuritySettings { secret_key, algorithm },
            cors: CorsSettings { origins: cors_origins },
            database: DatabaseSettings {
                postgres_server,
                postgres_port,
                postgres_user,
                postgres_password,
                postgres_db,
                database_url,
                max_connections,
            },
            redis: RedisSettings {
                host: redis_host,
                port: redis_port,
                db: redis_db,
                password: redis_password,
            },
            grader: GraderSettings {
                api_key: grader_api_key,
                base_url: grader_base_url,
                model: grader_model,
                max_tokens: grader_max_tokens,
                temperature: grader_temperature,
            },
            converter: ConverterSettings {
                api_key: converter_api_key,
                base_url: converter_base_url,
                timeout_seconds: converter_timeout_seconds,
                poll_interval_seconds: converter_poll_interval_seconds,
                max_poll_attempts: converter_max_poll_attempts,
                max_submit_retries: converter_max_submit_retries,
            },
            grading: GradingSettings {
                worker_concurrency,
                max_attempts,
                backoff_base_seconds,
                backoff_max_seconds,
                grader_timeout_seconds,
                extract_timeout_seconds,
                lease_margin_seconds,
                idle_poll_millis,
                stale_check_interval_seconds,
                batch_start_limit_per_minute,
            },
            storage: StorageSettings {
                max_upload_size_mb,
                allowed_extensions,
                max_files_per_upload,
                max_upload_total_mb,
                upload_limit_per_minute,
            },
            s3: S3Settings {
                endpoint: s3_endpoint,
                access_key: s3_access_key,
                secret_key: s3_secret_key,
                bucket: s3_bucket,
                region: s3_region,
            },
            retention: RetentionSettings {
                days: retention_days,
                sweep_interval_seconds,
                sweep_batch_size,
                sweep_max_pages,
            },
            telemetry: TelemetrySettings { log_level, json, prometheus_enabled },
        };

        settings.validate()?;
        Ok(settings)
    }

    pub(crate) fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host.0, self.server.port.0)
    }

    pub(crate) fn server_host(&self) -> &str {
        &self.server.host.0
    }

    pub(crate) fn server_port(&self) -> u16 {
        self.server.port.0
    }

    pub(crate) fn api(&self) -> &ApiSettings {
        &self.api
    }

    pub(crate) fn security(&self) -> &SecuritySettings {
        &self.security
    }

    pub(crate) fn cors(&self) -> &CorsSettings {
        &self.cors
    }

    pub(crate) fn database(&self) -> &DatabaseSettings {
        &self.database
    }

    pub(crate) fn redis(&self) -> &RedisSettings {
        &self.redis
    }

    pub(crate) fn grader(&self) -> &GraderSettings {
        &self.grader
    }

    pub(crate) fn converter(&self) -> &ConverterSettings {
        &self.converter
    }

    pub(crate) fn grading(&self) -> &GradingSettings {
        &self.grading
    }

    pub(crate) fn storage(&self) -> &StorageSettings {
        &self.storage
    }

    pub(crate) fn s3(&self) -> &S3Settings {
        &self.s3
    }

    pub(crate) fn retention(&self) -> &RetentionSettings {
        &self.retention
    }

    pub(crate) fn telemetry(&self) -> &TelemetrySettings {
        &self.telemetry
    }

    pub(crate) fn runtime(&self) -> &RuntimeSettings {
        &self.runtime
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.allowed_extensions.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "ALLOWED_ESSAY_EXTENSIONS",
                value: String::from("<empty>"),
            });
        }

        for extension in &self.storage.allowed_extensions {
            if !is_extractable_extension(extension) {
                return Err(ConfigError::InvalidValue {
                    field: "ALLOWED_ESSAY_EXTENSIONS",
                    value: extension.clone(),
                });
            }
        }

        if self.grading.worker_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "GRADING_WORKERS",
                value: "0".to_string(),
            });
        }

        if self.grading.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "GRADING_MAX_ATTEMPTS",
                value: "0".to_string(),
            });
        }

        if self.grading.grader_timeout_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "GRADER_TIMEOUT_SECONDS",
                value: "0".to_string(),
            });
        }

        if self.converter.poll_interval_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "CONVERTER_POLL_INTERVAL_SECONDS",
                value: "0".to_string(),
            });
        }

        if self.converter.max_poll_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "CONVERTER_MAX_POLL_ATTEMPTS",
                value: "0".to_string(),
            });
        }

        if self.retention.days == 0 {
            return Err(ConfigError::InvalidValue {
                field: "RETENTION_DAYS",
                value: "0".to_string(),
            });
        }

        if self.retention.sweep_batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "RETENTION_SWEEP_BATCH_SIZE",
                value: "0".to_string(),
            });
        }

        if !(self.runtime.strict_config || self.runtime.environment.is_production()) {
            return Ok(());
        }

        if self.database.database_url.is_none() && self.database.postgres_password.is_empty() {
            return Err(ConfigError::MissingSecret("POSTGRES_PASSWORD"));
        }
        if self.grader.api_key.is_empty() {
            return Err(ConfigError::MissingSecret("GRADER_API_KEY"));
        }
        if self.converter.api_key.is_empty() {
            return Err(ConfigError::MissingSecret("CONVERTER_API_KEY"));
        }
        if self.s3.access_key.is_empty() || self.s3.secret_key.is_empty() {
            return Err(ConfigError::MissingSecret("S3_ACCESS_KEY/S3_SECRET_KEY"));
        }

        Ok(())
    }
}
