//! OTA sinks: where verified image bytes end up.
//!
//! On a device this is the platform's partition writer. [`FileSink`] stages the
//! image on disk and commits it with a rename, [`MemorySink`] keeps it in memory and
//! records what the orchestrator asked of it.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use md5::{Digest, Md5};

use crate::error::SinkError;

/// Destination of an update image.
///
/// `write` must either accept every byte or fail; a short write is a hard failure.
/// `finalize` performs the sink's own digest check against the value given to
/// `set_expected_digest` before committing.
pub trait OtaSink: Send {
    /// Prepare for an image of `total_size` bytes.
    fn begin(&mut self, total_size: u64) -> Result<(), SinkError>;

    /// Digest the committed image must have.
    fn set_expected_digest(&mut self, hex_digest: &str);

    /// Append `bytes` to the image.
    fn write(&mut self, bytes: &[u8]) -> Result<usize, SinkError>;

    /// Discard everything written since `begin`.
    fn abort(&mut self);

    /// Verify and commit the image.
    fn finalize(&mut self) -> Result<(), SinkError>;

    /// Whether the last image was committed.
    fn is_committed(&self) -> bool;
}

/// Lowercase hex rendering of a digest.
pub fn to_hex(digest: &[u8]) -> String {
    digest
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn check_digest(expected: Option<&str>, actual: &str) -> Result<(), SinkError> {
    match expected {
        Some(expected) if !expected.eq_ignore_ascii_case(actual) => {
            Err(SinkError::DigestMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            })
        },
        _ => Ok(()),
    }
}

struct Stage {
    file: File,
    total: u64,
    written: u64,
}

/// Stages the image next to its destination and renames it into place on commit.
pub struct FileSink {
    target: PathBuf,
    staging: PathBuf,
    capacity: Option<u64>,
    stage: Option<Stage>,
    expected_digest: Option<String>,
    committed: bool,
}

impl fmt::Debug for FileSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSink")
            .field("target", &self.target)
            .field("capacity", &self.capacity)
            .field("active", &self.stage.is_some())
            .field("committed", &self.committed)
            .finish()
    }
}

impl FileSink {
    /// Create a sink that commits to `target`, staging in `<target>.part`.
    pub fn new(target: impl Into<PathBuf>) -> Self {
        let target = target.into();
        let mut staging = target.clone().into_os_string();
        staging.push(".part");
        Self {
            target,
            staging: PathBuf::from(staging),
            capacity: None,
            stage: None,
            expected_digest: None,
            committed: false,
        }
    }

    /// Refuse images larger than `bytes`.
    #[must_use]
    pub fn with_capacity(mut self, bytes: u64) -> Self {
        self.capacity = Some(bytes);
        self
    }

    /// Where a committed image ends up.
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Where the image is staged while it is being received.
    pub fn staging_path(&self) -> &Path {
        &self.staging
    }

    fn remove_staging(&self) {
        match fs::remove_file(&self.staging) {
            Ok(()) => debug!("Removed {}", self.staging.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {},
            Err(e) => warn!("Failed to remove {}: {e}", self.staging.display()),
        }
    }

    fn hash_staged(&self) -> io::Result<String> {
        let mut file = File::open(&self.staging)?;
        let mut hasher = Md5::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(to_hex(&hasher.finalize()))
    }
}

impl OtaSink for FileSink {
    fn begin(&mut self, total_size: u64) -> Result<(), SinkError> {
        if self.stage.is_some() {
            warn!("Sink restarted without abort; discarding staged image");
            self.abort();
        }
        match self.capacity {
            Some(available) if total_size > available => {
                return Err(SinkError::InsufficientSpace {
                    required: total_size,
                    available,
                });
            },
            _ => {},
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.staging)
            .map_err(|e| SinkError::WriteRejected(format!("{}: {e}", self.staging.display())))?;

        self.committed = false;
        self.expected_digest = None;
        self.stage = Some(Stage {
            file,
            total: total_size,
            written: 0,
        });
        debug!("Staging {total_size} bytes in {}", self.staging.display());
        Ok(())
    }

    fn set_expected_digest(&mut self, hex_digest: &str) {
        self.expected_digest = Some(hex_digest.to_string());
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, SinkError> {
        let stage = self.stage.as_mut().ok_or(SinkError::NotStarted)?;
        if stage.written + bytes.len() as u64 > stage.total {
            return Err(SinkError::WriteRejected(format!(
                "{} bytes would overrun the {}-byte image",
                bytes.len(),
                stage.total
            )));
        }

        if let Err(e) = stage.file.write_all(bytes) {
            // Roll back to the last whole chunk so a retry appends at the right place
            let rolled_back = stage
                .file
                .set_len(stage.written)
                .and_then(|()| stage.file.seek(SeekFrom::Start(stage.written)));
            if let Err(rb) = rolled_back {
                warn!("Rollback of partial write failed: {rb}");
            }
            return Err(SinkError::WriteRejected(e.to_string()));
        }
        stage.written += bytes.len() as u64;
        Ok(bytes.len())
    }

    fn abort(&mut self) {
        if self.stage.take().is_some() {
            info!("Discarding staged image");
        }
        self.expected_digest = None;
        self.remove_staging();
    }

    fn finalize(&mut self) -> Result<(), SinkError> {
        let stage = self.stage.take().ok_or(SinkError::NotStarted)?;
        if stage.written != stage.total {
            self.remove_staging();
            return Err(SinkError::FinalizeFailed(format!(
                "image incomplete: {} of {} bytes",
                stage.written, stage.total
            )));
        }
        stage
            .file
            .sync_all()
            .map_err(|e| SinkError::FinalizeFailed(e.to_string()))?;
        drop(stage);

        let actual = self
            .hash_staged()
            .map_err(|e| SinkError::FinalizeFailed(e.to_string()))?;
        if let Err(e) = check_digest(self.expected_digest.as_deref(), &actual) {
            self.remove_staging();
            return Err(e);
        }

        fs::rename(&self.staging, &self.target)
            .map_err(|e| SinkError::FinalizeFailed(format!("{}: {e}", self.target.display())))?;
        self.committed = true;
        info!("Image committed to {}", self.target.display());
        Ok(())
    }

    fn is_committed(&self) -> bool {
        self.committed
    }
}

/// In-memory sink that records how it was driven.
#[derive(Debug, Default)]
pub struct MemorySink {
    capacity: Option<u64>,
    data: Vec<u8>,
    total: Option<u64>,
    expected_digest: Option<String>,
    committed: bool,
    reject_writes: usize,
    fail_finalize: bool,
    writes: usize,
    aborts: usize,
    finalizes: usize,
}

impl MemorySink {
    /// Create an unlimited sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse images larger than `bytes`.
    #[must_use]
    pub fn with_capacity(mut self, bytes: u64) -> Self {
        self.capacity = Some(bytes);
        self
    }

    /// Reject the next `count` writes.
    pub fn reject_next_writes(&mut self, count: usize) {
        self.reject_writes = count;
    }

    /// Make `finalize` fail even when the digest matches.
    pub fn fail_finalize(&mut self, fail: bool) {
        self.fail_finalize = fail;
    }

    /// Bytes received since `begin`.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Accepted writes since `begin`.
    pub fn writes(&self) -> usize {
        self.writes
    }

    /// Number of `abort` calls.
    pub fn aborts(&self) -> usize {
        self.aborts
    }

    /// Number of `finalize` calls.
    pub fn finalizes(&self) -> usize {
        self.finalizes
    }

    /// Digest set for the current image.
    pub fn expected_digest(&self) -> Option<&str> {
        self.expected_digest.as_deref()
    }
}

impl OtaSink for MemorySink {
    fn begin(&mut self, total_size: u64) -> Result<(), SinkError> {
        match self.capacity {
            Some(available) if total_size > available => {
                return Err(SinkError::InsufficientSpace {
                    required: total_size,
                    available,
                });
            },
            _ => {},
        }
        self.data.clear();
        self.writes = 0;
        self.total = Some(total_size);
        self.expected_digest = None;
        self.committed = false;
        Ok(())
    }

    fn set_expected_digest(&mut self, hex_digest: &str) {
        self.expected_digest = Some(hex_digest.to_string());
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, SinkError> {
        let total = self.total.ok_or(SinkError::NotStarted)?;
        if self.reject_writes > 0 {
            self.reject_writes -= 1;
            return Err(SinkError::WriteRejected("scripted rejection".into()));
        }
        if (self.data.len() + bytes.len()) as u64 > total {
            return Err(SinkError::WriteRejected("write past end of image".into()));
        }
        self.data.extend_from_slice(bytes);
        self.writes += 1;
        Ok(bytes.len())
    }

    fn abort(&mut self) {
        self.aborts += 1;
        self.total = None;
        self.data.clear();
    }

    fn finalize(&mut self) -> Result<(), SinkError> {
        self.finalizes += 1;
        let total = self.total.take().ok_or(SinkError::NotStarted)?;
        if self.data.len() as u64 != total {
            return Err(SinkError::FinalizeFailed(format!(
                "image incomplete: {} of {total} bytes",
                self.data.len()
            )));
        }
        if self.fail_finalize {
            return Err(SinkError::FinalizeFailed("scripted failure".into()));
        }
        check_digest(
            self.expected_digest.as_deref(),
            &to_hex(&Md5::digest(&self.data)),
        )?;
        self.committed = true;
        Ok(())
    }

    fn is_committed(&self) -> bool {
        self.committed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // MD5("hello world")
    const HELLO_MD5: &str = "5eb63bbbe01eeed093cb22bb8f5acdc3";

    #[test]
    fn test_to_hex() {
        assert_eq!(to_hex(&[0x00, 0x0f, 0xa5, 0xff]), "000fa5ff");
        assert_eq!(to_hex(&Md5::digest(b"hello world")), HELLO_MD5);
    }

    #[test]
    fn test_file_sink_commits_by_rename() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("app.bin");
        let mut sink = FileSink::new(&target);

        sink.begin(11).unwrap();
        sink.set_expected_digest(&HELLO_MD5.to_uppercase());
        assert_eq!(sink.write(b"hello ").unwrap(), 6);
        assert_eq!(sink.write(b"world").unwrap(), 5);
        assert!(sink.staging_path().exists());
        assert!(!target.exists());

        sink.finalize().unwrap();
        assert!(sink.is_committed());
        assert!(!sink.staging_path().exists());
        assert_eq!(fs::read(&target).unwrap(), b"hello world");
    }

    #[test]
    fn test_file_sink_digest_mismatch_discards() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("app.bin");
        let mut sink = FileSink::new(&target);

        sink.begin(11).unwrap();
        sink.set_expected_digest(HELLO_MD5);
        sink.write(b"hello World").unwrap();
        assert!(matches!(
            sink.finalize(),
            Err(SinkError::DigestMismatch { .. })
        ));
        assert!(!sink.is_committed());
        assert!(!target.exists());
        assert!(!sink.staging_path().exists());
    }

    #[test]
    fn test_file_sink_capacity_and_overrun() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sink = FileSink::new(tmp.path().join("app.bin")).with_capacity(8);
        assert_eq!(sink.begin(9), Err(SinkError::InsufficientSpace {
            required: 9,
            available: 8,
        }));
        assert_eq!(sink.write(b"x"), Err(SinkError::NotStarted));

        sink.begin(4).unwrap();
        assert!(matches!(
            sink.write(b"12345"),
            Err(SinkError::WriteRejected(_))
        ));
        sink.write(b"1234").unwrap();
        sink.abort();
        assert!(!sink.staging_path().exists());
        assert_eq!(sink.finalize(), Err(SinkError::NotStarted));
    }

    #[test]
    fn test_file_sink_incomplete_image_is_not_committed() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("app.bin");
        let mut sink = FileSink::new(&target);
        sink.begin(10).unwrap();
        sink.write(b"12345").unwrap();
        assert!(matches!(sink.finalize(), Err(SinkError::FinalizeFailed(_))));
        assert!(!target.exists());
    }

    #[test]
    fn test_memory_sink_records_calls() {
        let mut sink = MemorySink::new();
        sink.begin(11).unwrap();
        sink.set_expected_digest(HELLO_MD5);
        sink.reject_next_writes(1);
        assert!(matches!(
            sink.write(b"hello "),
            Err(SinkError::WriteRejected(_))
        ));
        sink.write(b"hello ").unwrap();
        sink.write(b"world").unwrap();
        assert_eq!(sink.writes(), 2);
        sink.finalize().unwrap();
        assert!(sink.is_committed());
        assert_eq!(sink.finalizes(), 1);
        assert_eq!(sink.aborts(), 0);

        sink.begin(3).unwrap();
        assert!(!sink.is_committed());
        sink.abort();
        assert_eq!(sink.aborts(), 1);
        assert!(sink.data().is_empty());
    }

    #[test]
    fn test_memory_sink_checks_digest_on_finalize() {
        let mut sink = MemorySink::new();
        sink.begin(11).unwrap();
        sink.set_expected_digest(HELLO_MD5);
        sink.write(b"hello worle").unwrap();
        assert!(matches!(
            sink.finalize(),
            Err(SinkError::DigestMismatch { .. })
        ));
        assert!(!sink.is_committed());
    }
}
