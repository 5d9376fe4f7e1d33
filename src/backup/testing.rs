// postgres-s3-backup/src/backup/testing.rs
//! In-memory stand-ins for the dump process and the object store.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::AsyncRead;

use super::db_dump::{DumpCommand, DumpExit, DumpProcess};
use super::storage::{ObjectStorage, UploadedPart};
use crate::errors::{BackupError, Result};

/// A dump that emits fixed bytes, diagnostics and exit status.
pub struct ScriptedDump {
    stdout: Vec<u8>,
    stderr: String,
    success: bool,
    launch_error: bool,
    spawns: AtomicUsize,
}

impl ScriptedDump {
    pub fn new(stdout: impl Into<Vec<u8>>) -> Self {
        ScriptedDump {
            stdout: stdout.into(),
            stderr: String::new(),
            success: true,
            launch_error: false,
            spawns: AtomicUsize::new(0),
        }
    }

    pub fn with_stderr(mut self, stderr: &str) -> Self {
        self.stderr = stderr.to_string();
        self
    }

    pub fn exiting_with_failure(mut self) -> Self {
        self.success = false;
        self
    }

    pub fn unlaunchable() -> Self {
        let mut dump = ScriptedDump::new(Vec::new());
        dump.launch_error = true;
        dump
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DumpCommand for ScriptedDump {
    async fn spawn(&self) -> Result<Box<dyn DumpProcess>> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        if self.launch_error {
            return Err(BackupError::Launch("scripted launch failure".to_string()));
        }
        Ok(Box::new(ScriptedProcess {
            stdout: Some(Cursor::new(self.stdout.clone())),
            exit: DumpExit {
                success: self.success,
                status: if self.success { "exit status: 0" } else { "exit status: 1" }.to_string(),
                stderr: self.stderr.clone(),
            },
        }))
    }
}

struct ScriptedProcess {
    stdout: Option<Cursor<Vec<u8>>>,
    exit: DumpExit,
}

#[async_trait]
impl DumpProcess for ScriptedProcess {
    fn take_stdout(&mut self) -> Option<Box<dyn AsyncRead + Unpin + Send>> {
        self.stdout
            .take()
            .map(|s| Box::new(s) as Box<dyn AsyncRead + Unpin + Send>)
    }

    async fn wait(&mut self) -> Result<DumpExit> {
        Ok(self.exit.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageCall {
    CheckAccess,
    Put { key: String },
    CreateMultipart { key: String, content_type: String },
    UploadPart { key: String, part_number: i32 },
    Complete { key: String, parts: Vec<i32> },
    Abort { key: String },
}

struct PendingUpload {
    key: String,
    content_type: String,
    parts: BTreeMap<i32, Bytes>,
}

#[derive(Default)]
struct State {
    calls: Vec<StorageCall>,
    objects: HashMap<String, (String, Vec<u8>)>,
    uploads: HashMap<String, PendingUpload>,
    next_upload: usize,
}

/// A bucket held in memory. Objects appear only on put or completed upload.
pub struct MemoryStorage {
    bucket: String,
    state: Mutex<State>,
    deny_access: bool,
    failing_part: Option<i32>,
    part_delay: Option<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MemoryStorage {
    pub fn new(bucket: &str) -> Self {
        MemoryStorage {
            bucket: bucket.to_string(),
            state: Mutex::new(State::default()),
            deny_access: false,
            failing_part: None,
            part_delay: None,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn denying_access(mut self) -> Self {
        self.deny_access = true;
        self
    }

    pub fn fail_part(mut self, part_number: i32) -> Self {
        self.failing_part = Some(part_number);
        self
    }

    pub fn with_part_delay_ms(mut self, millis: u64) -> Self {
        self.part_delay = Some(Duration::from_millis(millis));
        self
    }

    pub fn calls(&self) -> Vec<StorageCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(key)
            .map(|(_, body)| body.clone())
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(key)
            .map(|(content_type, _)| content_type.clone())
    }

    pub fn max_parts_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, call: StorageCall) {
        self.state.lock().unwrap().calls.push(call);
    }
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn check_access(&self) -> Result<()> {
        self.record(StorageCall::CheckAccess);
        if self.deny_access {
            return Err(BackupError::BucketAccess(format!(
                "bucket {}: InvalidAccessKeyId",
                self.bucket
            )));
        }
        Ok(())
    }

    async fn put_object(&self, key: &str, content_type: &str, body: Bytes) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(StorageCall::Put {
            key: key.to_string(),
        });
        state
            .objects
            .insert(key.to_string(), (content_type.to_string(), body.to_vec()));
        Ok(())
    }

    async fn create_multipart_upload(&self, key: &str, content_type: &str) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(StorageCall::CreateMultipart {
            key: key.to_string(),
            content_type: content_type.to_string(),
        });
        state.next_upload += 1;
        let upload_id = format!("upload-{}", state.next_upload);
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                content_type: content_type.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<UploadedPart> {
        self.record(StorageCall::UploadPart {
            key: key.to_string(),
            part_number,
        });

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.part_delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing_part == Some(part_number) {
            return Err(BackupError::Storage(format!(
                "UploadPart {} for key {}: connection reset",
                part_number, key
            )));
        }

        let mut state = self.state.lock().unwrap();
        let upload = state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| BackupError::Storage(format!("NoSuchUpload {}", upload_id)))?;
        upload.parts.insert(part_number, body);
        Ok(UploadedPart {
            part_number,
            e_tag: format!("\"etag-{}\"", part_number),
        })
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<UploadedPart>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(StorageCall::Complete {
            key: key.to_string(),
            parts: parts.iter().map(|p| p.part_number).collect(),
        });

        let upload = state
            .uploads
            .remove(upload_id)
            .ok_or_else(|| BackupError::Storage(format!("NoSuchUpload {}", upload_id)))?;
        if upload.key != key {
            return Err(BackupError::Storage("key mismatch".to_string()));
        }
        if !parts.windows(2).all(|w| w[0].part_number < w[1].part_number) {
            return Err(BackupError::Storage("InvalidPartOrder".to_string()));
        }

        let mut body = Vec::new();
        for part in &parts {
            let data = upload
                .parts
                .get(&part.part_number)
                .ok_or_else(|| BackupError::Storage(format!("InvalidPart {}", part.part_number)))?;
            body.extend_from_slice(data);
        }
        state
            .objects
            .insert(key.to_string(), (upload.content_type, body));
        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(StorageCall::Abort {
            key: key.to_string(),
        });
        state.uploads.remove(upload_id);
        Ok(())
    }
}
