//! Per-worker and per-transfer state: the two mutable records the master
//! keeps outside of the database.

use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use chrono::{DateTime, Utc};
use piw_protocol::ranges::{exclude, intersect};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

/// An immutable record of one build attempt, as reported by `BUILT`.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildState {
    /// The worker that ran the build.
    pub slave_id: u32,
    /// Package name.
    pub package: String,
    /// Version string.
    pub version: String,
    /// Whether the build succeeded.
    pub status: bool,
    /// Captured build log text.
    pub output: String,
    /// Artifact file name (empty on failure).
    pub filename: String,
    /// Artifact size in bytes (zero on failure).
    pub filesize: u64,
    /// Lowercase hex SHA-256 of the artifact (empty on failure).
    pub filehash: String,
    /// Wall-clock build duration in seconds.
    pub duration: f64,
    /// Package/version tag embedded in the wheel filename.
    pub package_version_tag: String,
    /// Python version tag.
    pub py_version_tag: String,
    /// ABI tag.
    pub abi_tag: String,
    /// Platform tag.
    pub platform_tag: String,
}

/// The stage of a single worker's protocol state machine (see the worker
/// transition table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStage {
    /// Waiting for `BUILD`/`SLEEP`/`BYE`.
    Idle,
    /// A build is in progress on the worker.
    Building,
    /// The worker is uploading its artifact.
    Sending,
    /// The worker has said goodbye; its entry will be dropped.
    Dead,
}

/// Per-worker protocol context, keyed by transport address in the owning
/// task (`SlaveDriver`). Never shared outside of it.
#[derive(Debug, Clone)]
pub struct SlaveState {
    slave_id: u32,
    last_seen: DateTime<Utc>,
    stage: WorkerStage,
    /// The (package, version) most recently dispatched via `BUILD`; the
    /// worker's later `BUILT` reply doesn't repeat these; they are required
    /// to rebuild a [`BuildState`].
    dispatched: Option<(String, String)>,
    current_build: Option<BuildState>,
    terminated: bool,
}

impl SlaveState {
    /// Allocate a new worker context for a freshly-seen `slave_id`.
    pub fn new(slave_id: u32, now: DateTime<Utc>) -> Self {
        SlaveState {
            slave_id,
            last_seen: now,
            stage: WorkerStage::Idle,
            dispatched: None,
            current_build: None,
            terminated: false,
        }
    }

    /// This worker's stable numeric identity.
    pub fn slave_id(&self) -> u32 {
        self.slave_id
    }

    /// The current protocol stage.
    pub fn stage(&self) -> WorkerStage {
        self.stage
    }

    /// The build currently assigned to this worker, if any.
    pub fn current_build(&self) -> Option<&BuildState> {
        self.current_build.as_ref()
    }

    /// Whether this worker has been marked for removal.
    pub fn terminated(&self) -> bool {
        self.terminated
    }

    /// Mark this worker for removal; its next `IDLE` yields `BYE`.
    pub fn kill(&mut self) {
        self.terminated = true;
    }

    /// Record that a message was just received from this worker.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_seen = now;
    }

    /// When this worker was last heard from.
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_seen
    }

    /// Move to `Building` with a freshly dispatched (package, version).
    pub fn start_build(&mut self, package: String, version: String) {
        self.stage = WorkerStage::Building;
        self.dispatched = Some((package, version));
    }

    /// Combine the worker's `BUILT` fields with the (package, version) this
    /// worker was last dispatched, recording the result and moving to
    /// `Sending` (success) or `Idle` (failure).
    #[allow(clippy::too_many_arguments)]
    pub fn finish_build(
        &mut self,
        status: bool,
        output: String,
        filename: String,
        filesize: u64,
        filehash: String,
        duration: f64,
        package_version_tag: String,
        py_version_tag: String,
        abi_tag: String,
        platform_tag: String,
    ) -> &BuildState {
        let (package, version) = self
            .dispatched
            .take()
            .unwrap_or_else(|| (String::new(), String::new()));
        let build = BuildState {
            slave_id: self.slave_id,
            package,
            version,
            status,
            output,
            filename,
            filesize,
            filehash,
            duration,
            package_version_tag,
            py_version_tag,
            abi_tag,
            platform_tag,
        };
        self.stage = if build.status {
            WorkerStage::Sending
        } else {
            WorkerStage::Idle
        };
        self.current_build = Some(build);
        self.current_build.as_ref().expect("just set")
    }

    /// Return to `Idle`, clearing the current build (used after `DONE`).
    pub fn clear_build(&mut self) {
        self.stage = WorkerStage::Idle;
        self.current_build = None;
    }

    /// Move to `Dead` (used after replying `BYE`).
    pub fn mark_dead(&mut self) {
        self.stage = WorkerStage::Dead;
    }
}

const CHUNK_SIZE: u64 = 65536;
const PIPELINE_SIZE: u64 = 10;

/// Server-side receive state for one in-flight artifact upload.
pub struct TransferState {
    file: NamedTempFile,
    filesize: u64,
    credit: u64,
    next_offset: u64,
    missing_ranges: Vec<Range<u64>>,
}

impl TransferState {
    /// Chunk size used for both flow control and fetch-range width.
    pub const CHUNK_SIZE: u64 = CHUNK_SIZE;
    /// Maximum number of outstanding `FETCH`es per transfer.
    pub const PIPELINE_SIZE: u64 = PIPELINE_SIZE;

    /// Begin receiving a `filesize`-byte artifact, backed by a fresh
    /// temporary file created in `output_root`.
    pub fn new(filesize: u64, output_root: &Path) -> std::io::Result<Self> {
        let file = NamedTempFile::new_in(output_root)?;
        file.as_file().set_len(filesize)?;
        let credit = (filesize / CHUNK_SIZE).clamp(1, PIPELINE_SIZE);
        Ok(TransferState {
            file,
            filesize,
            credit,
            next_offset: 0,
            missing_ranges: vec![0..filesize],
        })
    }

    /// Reset this transfer to start over from scratch, reusing the same
    /// backing file handle (no new temp file is allocated).
    pub fn reset(&mut self) -> std::io::Result<()> {
        self.file.as_file().set_len(0)?;
        self.file.as_file().set_len(self.filesize)?;
        self.credit = (self.filesize / CHUNK_SIZE).clamp(1, PIPELINE_SIZE);
        self.next_offset = 0;
        self.missing_ranges = vec![0..self.filesize];
        Ok(())
    }

    /// Whether every byte of the artifact has been received.
    pub fn done(&self) -> bool {
        self.missing_ranges.is_empty()
    }

    /// Grant full pipeline credit again; used on a recovery `HELLO` after a
    /// loss storm. Logs if credit was not actually exhausted.
    pub fn reset_credit(&mut self) {
        if self.credit == 0 {
            self.credit = PIPELINE_SIZE;
        } else {
            tracing::warn!(credit = self.credit, "transfer still has credit on HELLO");
        }
    }

    /// Select the next byte range to request, decrementing credit. Returns
    /// `None` if no credit remains or nothing is missing.
    pub fn fetch(&mut self) -> Option<Range<u64>> {
        if self.credit == 0 || self.missing_ranges.is_empty() {
            return None;
        }
        for _ in 0..2 {
            let mut window = self.next_offset..(self.next_offset + CHUNK_SIZE);
            for missing in &self.missing_ranges {
                if let Some(found) = intersect(missing, &window) {
                    self.next_offset = found.end;
                    self.credit -= 1;
                    return Some(found);
                }
                if missing.start > window.start {
                    window = missing.start..(missing.start + CHUNK_SIZE);
                }
            }
            // Overshot the end; wrap to the first missing range and retry once.
            self.next_offset = self.missing_ranges[0].start;
        }
        None
    }

    /// Record `bytes` received at `offset`, updating missing-range
    /// bookkeeping and credit. Idempotent for already-received bytes.
    pub fn chunk(&mut self, offset: u64, bytes: &[u8]) -> std::io::Result<()> {
        self.file.as_file().seek(SeekFrom::Start(offset))?;
        self.file.as_file().write_all(bytes)?;
        self.missing_ranges = exclude(&self.missing_ranges, &(offset..offset + bytes.len() as u64));
        if self.missing_ranges.is_empty() {
            self.credit = 0;
        } else {
            self.credit += 1;
        }
        Ok(())
    }

    /// Hash the received file and compare it against `expected_filehash`
    /// (lowercase hex SHA-256). Does not mutate or consume the transfer, so
    /// a mismatch leaves it intact for [`Self::reset`] and a retry.
    ///
    /// This performs blocking I/O and should be run via `spawn_blocking`.
    pub fn verify(&self, expected_filehash: &str) -> std::io::Result<bool> {
        let mut file = self.file.reopen()?;
        file.seek(SeekFrom::Start(0))?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; CHUNK_SIZE as usize];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let digest = hex::encode(hasher.finalize());
        Ok(digest == expected_filehash)
    }

    /// Commit a verified transfer to `<output_root>/<package>/<filename>`
    /// with mode `0644`. Only call this after [`Self::verify`] has returned
    /// `true` — it consumes the temporary file by renaming it into place.
    ///
    /// This performs blocking I/O and should be run via `spawn_blocking`.
    pub fn commit(self, output_root: &Path, package: &str, filename: &str) -> std::io::Result<()> {
        self.file
            .as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o644))?;
        let package_dir = output_root.join(package);
        match std::fs::create_dir(&package_dir) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(err) => return Err(err),
        }
        self.file
            .persist(package_dir.join(filename))
            .map_err(|err| err.error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_respects_credit_cap() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = TransferState::new(CHUNK_SIZE * 20, dir.path()).unwrap();
        let mut fetched = 0;
        while t.fetch().is_some() {
            fetched += 1;
        }
        assert_eq!(fetched, PIPELINE_SIZE as usize);
    }

    #[test]
    fn small_file_gets_credit_of_one() {
        let dir = tempfile::tempdir().unwrap();
        let t = TransferState::new(100, dir.path()).unwrap();
        assert_eq!(t.credit, 1);
    }

    #[test]
    fn chunk_then_verify_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"hello piwheels world, this is an artifact".to_vec();
        let mut t = TransferState::new(data.len() as u64, dir.path()).unwrap();
        t.chunk(0, &data).unwrap();
        assert!(t.done());
        let hash = hex::encode(Sha256::digest(&data));
        assert!(t.verify(&hash).unwrap());
        t.commit(dir.path(), "foo", "foo-1.0.whl").unwrap();
        assert!(dir.path().join("foo/foo-1.0.whl").exists());
    }

    #[test]
    fn verify_rejects_hash_mismatch_and_leaves_transfer_intact() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"some bytes".to_vec();
        let mut t = TransferState::new(data.len() as u64, dir.path()).unwrap();
        t.chunk(0, &data).unwrap();
        assert!(!t.verify("0000deadbeef").unwrap());
        assert!(!dir.path().join("foo/foo.whl").exists());
        // the temp file survives a failed verify, so a retry can reuse it.
        t.reset().unwrap();
        assert!(!t.done());
        t.chunk(0, &data).unwrap();
        assert!(t.verify(&hex::encode(Sha256::digest(&data))).unwrap());
    }

    #[test]
    fn out_of_order_chunks_complete_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let size = CHUNK_SIZE * 2;
        let data = vec![7u8; size as usize];
        let mut t = TransferState::new(size, dir.path()).unwrap();
        t.chunk(CHUNK_SIZE, &data[CHUNK_SIZE as usize..]).unwrap();
        assert!(!t.done());
        t.chunk(0, &data[..CHUNK_SIZE as usize]).unwrap();
        assert!(t.done());
    }

    #[test]
    fn reset_credit_refills_when_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = TransferState::new(CHUNK_SIZE * 20, dir.path()).unwrap();
        while t.fetch().is_some() {}
        t.reset_credit();
        assert_eq!(t.credit, PIPELINE_SIZE);
    }
}
