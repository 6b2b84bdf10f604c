//! Shape-addressed binary array artifacts shared across worker processes
//!
//! An artifact is a raw row-major array of little-endian `f32` or `i32`
//! scalars on disk, identified by path + [`ArraySpec`]. There is no header:
//! the spec lives in configuration, and the one integrity check that
//! matters is that the file size equals the size the spec implies.
//!
//! Multi-writer protocol: exactly one creator allocates the file at full
//! size under a lock token; every worker then writes only the rows of its
//! own shard range. Disjoint ranges make the concurrent writes safe without
//! any per-row locking, provided creation happens-before the writes (the
//! callers enforce that with a barrier).
//!
//! Reads come in two forms: `map` gives a zero-copy view of a finished
//! artifact, `read_range_*` copies a row range into an owned buffer.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use memmap2::Mmap;
use quarry_core::{ArraySpec, Error, Result, ShardRange};
use tracing::{debug, info};

use crate::lock::BuildLock;

// ============================================================================
// ArtifactStore
// ============================================================================

/// Creation, range I/O, and mapping of on-disk array artifacts
///
/// Stateless; all identity lives in the `(path, spec)` pair handed to each
/// call. Exists as a struct so callers hold one value that answers for the
/// storage contract.
#[derive(Debug, Clone, Default)]
pub struct ArtifactStore;

impl ArtifactStore {
    /// Create a store handle
    pub fn new() -> Self {
        ArtifactStore
    }

    /// Allocate an artifact at full size, replacing any previous file.
    ///
    /// Only the designated creator rank calls this. A pre-existing file is
    /// removed first (recreate semantics), then the backing file is
    /// allocated under a lock token so a concurrent creator of the same
    /// directory blocks until this one finishes.
    ///
    /// Out-of-space or an unwritable device surfaces as an I/O error and
    /// must abort the run; a partially allocated artifact is never valid
    /// input to indexing.
    pub fn create(&self, path: &Path, spec: &ArraySpec) -> Result<()> {
        if path.exists() {
            fs::remove_file(path)?;
        }
        let dir = path.parent().ok_or_else(|| {
            Error::InvalidOperation(format!("artifact path {:?} has no parent directory", path))
        })?;

        let lock = BuildLock::acquire(dir)?;
        info!(path = %path.display(), bytes = spec.num_bytes(), "allocating artifact");
        let allocate = || -> Result<()> {
            let file = File::create(path)?;
            file.set_len(spec.num_bytes())?;
            file.sync_all()?;
            Ok(())
        };
        let result = allocate();
        lock.release()?;
        result
    }

    /// Write `data` rows into the artifact at the rows of `range`.
    ///
    /// The file must already exist at full size; creation is the sole
    /// creator's job and the caller barriers between creation and writes.
    /// `data` must hold exactly `range.len()` rows.
    pub fn write_range_f32(
        &self,
        path: &Path,
        spec: &ArraySpec,
        range: ShardRange,
        data: &[f32],
    ) -> Result<()> {
        let mut buf = Vec::with_capacity(data.len() * 4);
        for &v in data {
            buf.write_f32::<LittleEndian>(v)?;
        }
        self.write_range_bytes(path, spec, range, &buf)
    }

    /// `i32` variant of [`ArtifactStore::write_range_f32`]
    pub fn write_range_i32(
        &self,
        path: &Path,
        spec: &ArraySpec,
        range: ShardRange,
        data: &[i32],
    ) -> Result<()> {
        let mut buf = Vec::with_capacity(data.len() * 4);
        for &v in data {
            buf.write_i32::<LittleEndian>(v)?;
        }
        self.write_range_bytes(path, spec, range, &buf)
    }

    fn write_range_bytes(
        &self,
        path: &Path,
        spec: &ArraySpec,
        range: ShardRange,
        bytes: &[u8],
    ) -> Result<()> {
        if !path.exists() {
            return Err(Error::ArtifactMissing(path.to_path_buf()));
        }
        let expected = range.len() * spec.row_bytes();
        if bytes.len() != expected {
            return Err(Error::InvalidOperation(format!(
                "range write of {} rows needs {} bytes, got {}",
                range.len(),
                expected,
                bytes.len()
            )));
        }
        self.check_size(path, spec)?;

        let mut file = OpenOptions::new().write(true).open(path)?;
        file.seek(SeekFrom::Start((range.start * spec.row_bytes()) as u64))?;
        file.write_all(bytes)?;
        file.sync_data()?;
        debug!(
            path = %path.display(),
            start = range.start,
            rows = range.len(),
            "wrote artifact range"
        );
        Ok(())
    }

    /// Read the rows of `range` as `f32` values
    pub fn read_range_f32(
        &self,
        path: &Path,
        spec: &ArraySpec,
        range: ShardRange,
    ) -> Result<Vec<f32>> {
        let bytes = self.read_range_bytes(path, spec, range)?;
        let mut cursor = &bytes[..];
        let mut out = Vec::with_capacity(bytes.len() / 4);
        while !cursor.is_empty() {
            out.push(cursor.read_f32::<LittleEndian>()?);
        }
        Ok(out)
    }

    /// Read the rows of `range` as `i32` values
    pub fn read_range_i32(
        &self,
        path: &Path,
        spec: &ArraySpec,
        range: ShardRange,
    ) -> Result<Vec<i32>> {
        let bytes = self.read_range_bytes(path, spec, range)?;
        let mut cursor = &bytes[..];
        let mut out = Vec::with_capacity(bytes.len() / 4);
        while !cursor.is_empty() {
            out.push(cursor.read_i32::<LittleEndian>()?);
        }
        Ok(out)
    }

    fn read_range_bytes(
        &self,
        path: &Path,
        spec: &ArraySpec,
        range: ShardRange,
    ) -> Result<Vec<u8>> {
        if !path.exists() {
            return Err(Error::ArtifactMissing(path.to_path_buf()));
        }
        self.check_size(path, spec)?;

        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start((range.start * spec.row_bytes()) as u64))?;
        let mut bytes = vec![0u8; range.len() * spec.row_bytes()];
        file.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    /// Map the artifact read-only for zero-copy row access
    pub fn map(&self, path: &Path, spec: &ArraySpec) -> Result<ArtifactMap> {
        if !path.exists() {
            return Err(Error::ArtifactMissing(path.to_path_buf()));
        }
        self.check_size(path, spec)?;

        let file = File::open(path)?;
        // SAFETY: mapped read-only; the artifact is read-mostly after its
        // build phase and the callers barrier writers before readers.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(ArtifactMap {
            mmap,
            spec: spec.clone(),
        })
    }

    /// Fail with `ShapeMismatch` when the file size disagrees with the spec
    fn check_size(&self, path: &Path, spec: &ArraySpec) -> Result<()> {
        let actual = fs::metadata(path)?.len();
        let expected = spec.num_bytes();
        if actual != expected {
            return Err(Error::ShapeMismatch {
                path: path.to_path_buf(),
                expected,
                actual,
            });
        }
        Ok(())
    }
}

// ============================================================================
// ArtifactMap
// ============================================================================

/// Read-only memory-mapped view of an artifact
#[derive(Debug)]
pub struct ArtifactMap {
    mmap: Mmap,
    spec: ArraySpec,
}

impl ArtifactMap {
    /// The whole array as `f32` values
    pub fn as_f32(&self) -> &[f32] {
        // SAFETY: the file size was validated against the spec on open,
        // scalars are 4 bytes, and an mmap is page-aligned.
        unsafe {
            std::slice::from_raw_parts(self.mmap.as_ptr() as *const f32, self.spec.num_elems())
        }
    }

    /// The whole array as `i32` values
    pub fn as_i32(&self) -> &[i32] {
        // SAFETY: as in `as_f32`.
        unsafe {
            std::slice::from_raw_parts(self.mmap.as_ptr() as *const i32, self.spec.num_elems())
        }
    }

    /// The `f32` elements of rows `range`
    pub fn rows_f32(&self, range: ShardRange) -> &[f32] {
        let per_row = self.spec.row_elems();
        &self.as_f32()[range.start * per_row..range.end * per_row]
    }

    /// The `i32` elements of rows `range`
    pub fn rows_i32(&self, range: ShardRange) -> &[i32] {
        let per_row = self.spec.row_elems();
        &self.as_i32()[range.start * per_row..range.end * per_row]
    }
}
