// postgres-s3-backup/src/backup/logic.rs
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::archive::{DEFAULT_BLOCK_SIZE, GzipHeader, ParallelGzipWriter};
use super::counter::ByteCounter;
use super::db_dump::{DumpCommand, stream_dump};
use super::s3_upload::{DEFAULT_PART_SIZE, MultipartUploader, UploadSummary};
use super::storage::ObjectStorage;
use crate::config::BackupConfig;
use crate::errors::{BackupError, Result};
use crate::utils::{MemoryStats, format_size_iec};

pub const CONTENT_TYPE: &str = "application/gzip";

/// Names derived from the run's start time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactNames {
    /// `Backup_<Weekday>_<Day>_<Month>_<Year>_<HH-MM-SS>_<TZ>.dump`, stored in the gzip header.
    pub basename: String,
    /// `basename` plus `.gz`; also the object key.
    pub filename: String,
    pub path: PathBuf,
}

/// The timestamp has second precision, so two runs started within the same
/// second produce the same name.
pub fn artifact_names(now: DateTime<Utc>, dir: &Path) -> ArtifactNames {
    let timestamp = now.format("%a_%d_%b_%Y_%H-%M-%S_%Z");
    let basename = format!("Backup_{}.dump", timestamp);
    let filename = format!("{}.gz", basename);
    let path = dir.join(&filename);
    ArtifactNames {
        basename,
        filename,
        path,
    }
}

#[derive(Debug, Clone)]
pub struct DumpResult {
    pub filename: String,
    pub path: PathBuf,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    /// Trimmed diagnostic text of a successful dump; empty when there were no warnings.
    pub stderr: String,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct UploadResult {
    pub duration: Duration,
    pub summary: UploadSummary,
}

#[derive(Debug, Clone)]
pub struct BackupReport {
    pub dump: DumpResult,
    pub upload: UploadResult,
    pub total_duration: Duration,
    pub memory: MemoryStats,
}

/// Owns the on-disk dump for the run. Dropping it deletes the file.
struct TempArtifact {
    path: PathBuf,
    armed: bool,
}

impl TempArtifact {
    fn new(path: PathBuf) -> Self {
        TempArtifact { path, armed: true }
    }

    /// Deletes the file and reports failures, unlike the drop path.
    async fn remove(mut self) -> Result<()> {
        self.armed = false;
        tokio::fs::remove_file(&self.path).await.map_err(|e| {
            BackupError::io(format!("failed to delete {}", self.path.display()), e)
        })
    }
}

impl Drop for TempArtifact {
    fn drop(&mut self) {
        if self.armed {
            match std::fs::remove_file(&self.path) {
                Ok(()) => debug!(path = %self.path.display(), "removed local dump after failure"),
                Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove local dump"),
            }
        }
    }
}

/// Dump, compress to a temp file, upload, delete. Stages run strictly one
/// after another; concurrency lives inside compression and upload.
pub struct BackupPipeline {
    dumper: Arc<dyn DumpCommand>,
    storage: Arc<dyn ObjectStorage>,
    temp_dir: PathBuf,
    gzip_concurrency: usize,
    upload_concurrency: usize,
    block_size: usize,
    part_size: usize,
}

impl BackupPipeline {
    pub fn new(
        config: &BackupConfig,
        dumper: Arc<dyn DumpCommand>,
        storage: Arc<dyn ObjectStorage>,
    ) -> Self {
        BackupPipeline {
            dumper,
            storage,
            temp_dir: std::env::temp_dir(),
            gzip_concurrency: config.gzip_concurrency,
            upload_concurrency: config.upload_concurrency,
            block_size: DEFAULT_BLOCK_SIZE,
            part_size: DEFAULT_PART_SIZE,
        }
    }

    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }

    #[cfg(test)]
    fn with_sizes(mut self, block_size: usize, part_size: usize) -> Self {
        self.block_size = block_size;
        self.part_size = part_size;
        self
    }

    pub async fn run(&self) -> Result<BackupReport> {
        let started = Instant::now();

        info!("Dumping database to disk...");
        let (dump, artifact) = self.dump_to_file(Utc::now()).await?;

        if dump.stderr.is_empty() {
            info!(
                filename = %dump.filename,
                compressed_filesize = %format_size_iec(dump.compressed_size),
                uncompressed_filesize = %format_size_iec(dump.uncompressed_size),
                duration = ?dump.duration,
                "Database dumped"
            );
        } else {
            warn!(
                filename = %dump.filename,
                compressed_filesize = %format_size_iec(dump.compressed_size),
                uncompressed_filesize = %format_size_iec(dump.uncompressed_size),
                duration = ?dump.duration,
                stderr = %dump.stderr,
                "Database dumped with warnings"
            );
        }

        info!(bucket = self.storage.bucket(), "Uploading backup to S3...");
        // An upload error drops `artifact`, which deletes the file.
        let upload = self.upload(&dump).await?;
        info!(
            filename_in_bucket = %dump.filename,
            duration = ?upload.duration,
            uploaded_size = %format_size_iec(upload.summary.bytes),
            parts = upload.summary.parts,
            multipart = upload.summary.multipart,
            "Backup uploaded"
        );

        info!("Deleting local file...");
        artifact.remove().await?;
        info!("Local file deleted");

        Ok(BackupReport {
            dump,
            upload,
            total_duration: started.elapsed(),
            memory: MemoryStats::current(),
        })
    }

    async fn dump_to_file(&self, now: DateTime<Utc>) -> Result<(DumpResult, TempArtifact)> {
        let names = artifact_names(now, &self.temp_dir);

        // `create_new` so a run started in the same second never clobbers another's file.
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&names.path)
            .await
            .map_err(|e| {
                BackupError::io(format!("failed to create {}", names.path.display()), e)
            })?;
        let artifact = TempArtifact::new(names.path.clone());

        let sink = ByteCounter::new(file);
        let compressed = sink.handle();
        let mut gzip = ParallelGzipWriter::new(
            sink,
            GzipHeader {
                name: names.basename.clone(),
                modified: now,
            },
        )
        .with_concurrency(self.block_size, self.gzip_concurrency);

        let started = Instant::now();
        let streamed = stream_dump(self.dumper.as_ref(), &mut gzip).await;
        // Finish even after a failed dump so pending blocks are drained and the
        // file is closed. The dump error takes precedence.
        let finished = gzip.finish().await;
        let duration = started.elapsed();

        let classified = streamed.and_then(|outcome| {
            let bytes_read = outcome.bytes_read;
            outcome.into_result().map(|stderr| (bytes_read, stderr))
        });
        let (uncompressed_size, stderr) = match classified {
            Ok(dumped) => dumped,
            Err(e) => {
                if let Err(finish_err) = &finished {
                    warn!(error = %finish_err, "failed to close archive after dump error");
                }
                return Err(e);
            }
        };
        let (sink, totals) = finished.map_err(BackupError::Compression)?;
        drop(sink);

        debug_assert_eq!(totals.uncompressed, uncompressed_size);
        debug_assert_eq!(totals.compressed, compressed.get());

        Ok((
            DumpResult {
                filename: names.filename,
                path: names.path,
                compressed_size: compressed.get(),
                uncompressed_size,
                stderr,
                duration,
            },
            artifact,
        ))
    }

    async fn upload(&self, dump: &DumpResult) -> Result<UploadResult> {
        let file = tokio::fs::File::open(&dump.path).await.map_err(|e| {
            BackupError::io(format!("failed to open {}", dump.path.display()), e)
        })?;
        let len = file
            .metadata()
            .await
            .map_err(|e| BackupError::io(format!("failed to stat {}", dump.path.display()), e))?
            .len();

        let uploader = MultipartUploader::new(Arc::clone(&self.storage))
            .with_part_size(self.part_size)
            .with_concurrency(self.upload_concurrency)
            .with_body_len(len);
        debug!(size = len, part_size = uploader.part_size(), "uploading archive");

        let started = Instant::now();
        let summary = uploader.upload(&dump.filename, CONTENT_TYPE, file).await?;

        Ok(UploadResult {
            duration: started.elapsed(),
            summary,
        })
    }
}
