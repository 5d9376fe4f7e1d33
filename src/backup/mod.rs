pub(crate) mod archive;   // Block-parallel gzip writer
pub(crate) mod counter;   // Byte-counting reader/writer wrapper
pub(crate) mod db_dump;   // pg_dump process adapter
mod logic;                // Dump -> compress -> upload orchestration
pub(crate) mod s3_upload; // Multipart uploader
pub(crate) mod storage;   // Object storage client

#[cfg(test)]
pub(crate) mod testing;

pub use logic::{BackupPipeline, BackupReport};
