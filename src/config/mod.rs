// postgres-s3-backup/src/config/mod.rs
use std::fmt;
use url::Url;

use crate::errors::ConfigError;
use crate::logging::LogFormat;
use crate::utils::redact_connection_string;

const DEFAULT_GZIP_CONCURRENCY: usize = 20;
const DEFAULT_UPLOAD_CONCURRENCY: usize = 20;

#[derive(Clone)]
pub struct StorageConfig {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_name: String,
    pub region: String,
    /// Custom endpoint for S3-compatible backends. `None` uses AWS resolution.
    pub endpoint_url: Option<String>,
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("bucket_name", &self.bucket_name)
            .field("region", &self.region)
            .field("endpoint_url", &self.endpoint_url)
            .finish()
    }
}

#[derive(Clone)]
pub struct BackupConfig {
    pub database_url: String,
    pub run_on_start: bool,
    pub gzip_concurrency: usize,
    pub upload_concurrency: usize,
}

impl fmt::Debug for BackupConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupConfig")
            .field("database_url", &redact_connection_string(&self.database_url))
            .field("run_on_start", &self.run_on_start)
            .field("gzip_concurrency", &self.gzip_concurrency)
            .field("upload_concurrency", &self.upload_concurrency)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub backup: BackupConfig,
    pub storage: StorageConfig,
    pub log_format: LogFormat,
}

impl AppConfig {
    /// Reads the process environment. Call `dotenv` beforehand to pick up a `.env` file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source, collecting
    /// every problem instead of stopping at the first one.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut reader = EnvReader {
            lookup,
            problems: Vec::new(),
        };

        let database_url = reader.required("BACKUP_DATABASE_URL");
        if let Some(raw) = &database_url {
            reader.check_database_url(raw);
        }
        let run_on_start = reader.flag("RUN_ON_STARTUP", false);
        let gzip_concurrency = reader.positive("GZIP_CONCURRENCY", DEFAULT_GZIP_CONCURRENCY);
        let upload_concurrency =
            reader.positive("UPLOAD_CONCURRENCY", DEFAULT_UPLOAD_CONCURRENCY);

        let access_key_id = reader.required("AWS_ACCESS_KEY_ID");
        let secret_access_key = reader.required("AWS_SECRET_ACCESS_KEY");
        let bucket_name = reader.required("AWS_S3_BUCKET");
        let region = reader.required("AWS_S3_REGION");
        let endpoint_url = reader.optional("AWS_S3_ENDPOINT");

        let log_format = match reader.optional("LOG_FORMAT") {
            None => LogFormat::default(),
            Some(raw) => match raw.parse::<LogFormat>() {
                Ok(format) => format,
                Err(problem) => {
                    reader.problems.push(problem);
                    LogFormat::default()
                }
            },
        };

        match (database_url, access_key_id, secret_access_key, bucket_name, region) {
            (
                Some(database_url),
                Some(access_key_id),
                Some(secret_access_key),
                Some(bucket_name),
                Some(region),
            ) if reader.problems.is_empty() => Ok(AppConfig {
                backup: BackupConfig {
                    database_url,
                    run_on_start,
                    gzip_concurrency,
                    upload_concurrency,
                },
                storage: StorageConfig {
                    access_key_id,
                    secret_access_key,
                    bucket_name,
                    region,
                    endpoint_url,
                },
                log_format,
            }),
            _ => Err(ConfigError {
                problems: reader.problems,
            }),
        }
    }
}

struct EnvReader<F> {
    lookup: F,
    problems: Vec<String>,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&mut self, key: &str) -> Option<String> {
        let value = self.optional(key);
        if value.is_none() {
            self.problems
                .push(format!("{} must be set and non-empty", key));
        }
        value
    }

    fn flag(&mut self, key: &str, default: bool) -> bool {
        let Some(raw) = self.optional(key) else {
            return default;
        };
        match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => true,
            "false" | "0" | "no" => false,
            _ => {
                self.problems
                    .push(format!("{} must be a boolean, got {:?}", key, raw));
                default
            }
        }
    }

    fn positive(&mut self, key: &str, default: usize) -> usize {
        let Some(raw) = self.optional(key) else {
            return default;
        };
        match raw.parse::<usize>() {
            Ok(n) if n > 0 => n,
            _ => {
                self.problems
                    .push(format!("{} must be a positive integer, got {:?}", key, raw));
                default
            }
        }
    }

    /// Keyword/value conninfo (`host=... dbname=...`) is passed to pg_dump
    /// untouched; only the URI form is checked here.
    fn check_database_url(&mut self, raw: &str) {
        if !raw.contains("://") {
            return;
        }
        match Url::parse(raw) {
            Ok(url) if matches!(url.scheme(), "postgres" | "postgresql") => {}
            Ok(url) => self.problems.push(format!(
                "BACKUP_DATABASE_URL must use the postgres:// or postgresql:// scheme, got {}://",
                url.scheme()
            )),
            Err(e) => self
                .problems
                .push(format!("BACKUP_DATABASE_URL is not a valid URL: {}", e)),
        }
    }
}
