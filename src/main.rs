//! One-shot PostgreSQL backup to S3
//!
//! Dumps the configured database with pg_dump, gzips it in parallel while
//! streaming, uploads the archive with a multipart upload and removes the
//! local copy. Configuration comes from the environment (or a `.env` file).

// postgres-s3-backup/src/main.rs
mod backup;
mod config;
mod errors;
mod logging;
mod utils;

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

use backup::db_dump::{DumpCommand, ExternalDump};
use backup::storage::{ObjectStorage, S3Storage};
use backup::{BackupPipeline, BackupReport};
use config::{AppConfig, BackupConfig, StorageConfig};
use logging::{LogFormat, init_logging};
use utils::{format_size_iec, redact_connection_string};

#[derive(Debug)]
enum RunOutcome {
    /// `RUN_ON_STARTUP` was off; nothing was attempted.
    Skipped,
    Completed(BackupReport),
}

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env file is fine; the environment may already be populated.
    dotenv::dotenv().ok();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            init_logging(LogFormat::default());
            error!(error = %e, "Errors found while parsing environment variables");
            return ExitCode::from(1);
        }
    };
    init_logging(config.log_format);

    let result = run_app(
        &config,
        connect_storage(&config.storage),
        || prepare_pg_dump(&config.backup),
        std::env::temp_dir(),
    )
    .await;
    match &result {
        Ok(RunOutcome::Completed(report)) => log_report(report),
        Ok(RunOutcome::Skipped) => {}
        Err(e) => {
            let message = format!("{:#}", e);
            error!(error = %message, "Backup failed. Exiting..");
        }
    }
    ExitCode::from(exit_status(&result))
}

fn exit_status(result: &Result<RunOutcome>) -> u8 {
    match result {
        Ok(_) => 0,
        Err(_) => 1,
    }
}

async fn connect_storage(config: &StorageConfig) -> Arc<dyn ObjectStorage> {
    Arc::new(S3Storage::connect(config).await)
}

fn prepare_pg_dump(config: &BackupConfig) -> Result<Arc<dyn DumpCommand>> {
    let dump = ExternalDump::pg_dump(&config.database_url).context("Failed to prepare pg_dump")?;
    Ok(Arc::new(dump))
}

/// Runs one backup. `storage` and `dumper` are only built once the run is
/// enabled, and the dump never starts before the bucket has been reached.
async fn run_app<S, D>(
    config: &AppConfig,
    storage: S,
    dumper: D,
    temp_dir: PathBuf,
) -> Result<RunOutcome>
where
    S: Future<Output = Arc<dyn ObjectStorage>>,
    D: FnOnce() -> Result<Arc<dyn DumpCommand>>,
{
    if !config.backup.run_on_start {
        warn!("Skipping database backup, not configured to run on startup");
        return Ok(RunOutcome::Skipped);
    }

    let storage = storage.await;
    check_bucket(storage.as_ref()).await?;

    let dumper = dumper()?;
    run_backup(config, dumper, storage, temp_dir).await
}

async fn check_bucket(storage: &dyn ObjectStorage) -> Result<()> {
    info!(bucket = storage.bucket(), "Checking access to bucket...");
    storage
        .check_access()
        .await
        .context("Error checking bucket access")?;
    info!("Access to bucket confirmed");
    Ok(())
}

async fn run_backup(
    config: &AppConfig,
    dumper: Arc<dyn DumpCommand>,
    storage: Arc<dyn ObjectStorage>,
    temp_dir: PathBuf,
) -> Result<RunOutcome> {
    info!(
        database = %redact_connection_string(&config.backup.database_url),
        gzip_concurrency = config.backup.gzip_concurrency,
        upload_concurrency = config.backup.upload_concurrency,
        "Starting backup..."
    );
    let report = BackupPipeline::new(&config.backup, dumper, storage)
        .with_temp_dir(temp_dir)
        .run()
        .await
        .context("Error while running backup")?;
    Ok(RunOutcome::Completed(report))
}

fn log_report(report: &BackupReport) {
    info!(
        object_key = %report.dump.filename,
        archive_size = report.dump.compressed_size,
        dump_size = report.dump.uncompressed_size,
        dump_duration = ?report.dump.duration,
        upload_duration = ?report.upload.duration,
        duration = ?report.total_duration,
        resident_memory = %format_size_iec(report.memory.resident),
        virtual_memory = %format_size_iec(report.memory.virtual_size),
        "Database backup complete"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::testing::{MemoryStorage, ScriptedDump, StorageCall};
        use tempfile::TempDir;

    fn app_config(run_on_start: bool) -> AppConfig {
        AppConfig {
            backup: BackupConfig {
                database_url: "postgres://app:pw@localhost/app".to_string(),
                run_on_start,
                gzip_concurrency: 2,
                upload_concurrency: 2,
            },
            storage: StorageConfig {
                access_key_id: "AKIAEXAMPLE".to_string(),
                secret_access_key: "wrong".to_string(),
                bucket_name: "backups".to_string(),
                region: "us-east-1".to_string(),
                endpoint_url: None,
            },
            log_format: LogFormat::Text,
        }
    }

    async fn run_with(
        config: &AppConfig,
        dumper: Arc<ScriptedDump>,
        storage: Arc<MemoryStorage>,
        temp_dir: &TempDir,
    ) -> Result<RunOutcome> {
        run_app(
            config,
            async move { storage as Arc<dyn ObjectStorage> },
            move || Ok(dumper as Arc<dyn DumpCommand>),
            temp_dir.path().to_path_buf(),
        )
        .await
    }

    #[tokio::test]
    async fn test_disabled_run_exits_zero_without_work() {
        let dumper = Arc::new(ScriptedDump::new(vec![1u8; 100]));
        let storage = Arc::new(MemoryStorage::new("backups"));

        let dir = TempDir::new().unwrap();
        let result =
            run_with(&app_config(false), dumper.clone(), storage.clone(), &dir).await;

        assert!(matches!(result, Ok(RunOutcome::Skipped)));
        assert_eq!(exit_status(&result), 0);
        assert_eq!(dumper.spawn_count(), 0);
        assert!(storage.calls().is_empty());
    }

    #[tokio::test]
    async fn test_bucket_access_failure_skips_dump() {
        let dumper = Arc::new(ScriptedDump::new(vec![1u8; 100]));
        let storage = Arc::new(MemoryStorage::new("backups").denying_access());

        let dir = TempDir::new().unwrap();
        let result =
            run_with(&app_config(true), dumper.clone(), storage.clone(), &dir).await;

        assert_eq!(exit_status(&result), 1);
        assert_eq!(dumper.spawn_count(), 0);
        assert_eq!(storage.calls(), vec![StorageCall::CheckAccess]);
        let message = format!("{:#}", result.unwrap_err());
        assert!(message.starts_with("Error checking bucket access"));
    }

    #[tokio::test]
    async fn test_completed_backup_exits_zero() {
        let dumper = Arc::new(ScriptedDump::new(b"PGDMP".repeat(2_000)));
        let storage = Arc::new(MemoryStorage::new("backups"));

        let dir = TempDir::new().unwrap();
        let result =
            run_with(&app_config(true), dumper.clone(), storage.clone(), &dir).await;

        assert_eq!(exit_status(&result), 0);
        assert_eq!(dumper.spawn_count(), 1);
        let Ok(RunOutcome::Completed(report)) = result else {
            panic!("expected a completed run");
        };
        assert!(!report.dump.path.exists());
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
        assert!(storage.object(&report.dump.filename).is_some());
        assert_eq!(report.upload.summary.bytes, report.dump.compressed_size);
        log_report(&report);
    }

    #[tokio::test]
    async fn test_failed_dump_exits_one_with_marker_message() {
        let dumper = Arc::new(
            ScriptedDump::new(Vec::new())
                .with_stderr("NOTICE: foo\npg_dump: error: relation bar missing\n")
                .exiting_with_failure(),
        );
        let storage = Arc::new(MemoryStorage::new("backups"));

        let dir = TempDir::new().unwrap();
        let result = run_with(&app_config(true), dumper, storage, &dir).await;

        assert_eq!(exit_status(&result), 1);
        let err = result.unwrap_err();
        assert_eq!(err.root_cause().to_string(), "pg_dump: error: relation bar missing\n");
    }
}
