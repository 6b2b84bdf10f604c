//! Persisted index state
//!
//! Every index variant saves and reloads its fitted structure through the
//! same envelope so a rebuild can be skipped on later runs.
//!
//! ## File format
//!
//! ```text
//! [magic 4B]           — per-variant tag
//! [version u32 LE]
//! [payload_len u64 LE]
//! [crc32 u32 LE]       — checksum of the payload
//! [payload]            — bincode-encoded structure
//! ```

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use quarry_core::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

/// Current envelope version
const VERSION: u32 = 1;

/// Serialize `value` at `path` under `magic`, via tmp-file + rename
pub(crate) fn save_state<T: Serialize>(path: &Path, magic: &[u8; 4], value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let payload = bincode::serialize(value)?;
    let crc = crc32fast::hash(&payload);

    let tmp = path.with_extension("tmp");
    let mut file = File::create(&tmp)?;
    file.write_all(magic)?;
    file.write_u32::<LittleEndian>(VERSION)?;
    file.write_u64::<LittleEndian>(payload.len() as u64)?;
    file.write_u32::<LittleEndian>(crc)?;
    file.write_all(&payload)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path)?;

    info!(path = %path.display(), bytes = payload.len(), "saved index state");
    Ok(())
}

/// Load a structure saved by [`save_state`]
pub(crate) fn load_state<T: DeserializeOwned>(path: &Path, magic: &[u8; 4]) -> Result<T> {
    if !path.exists() {
        return Err(Error::ArtifactMissing(path.to_path_buf()));
    }
    let mut file = File::open(path)?;

    let mut found_magic = [0u8; 4];
    file.read_exact(&mut found_magic)?;
    if &found_magic != magic {
        return Err(Error::Corruption(format!(
            "bad magic in {:?}: expected {:?}, found {:?}",
            path, magic, found_magic
        )));
    }
    let version = file.read_u32::<LittleEndian>()?;
    if version != VERSION {
        return Err(Error::Corruption(format!(
            "unsupported index state version {} in {:?}",
            version, path
        )));
    }
    let len = file.read_u64::<LittleEndian>()? as usize;
    let crc = file.read_u32::<LittleEndian>()?;

    let mut payload = vec![0u8; len];
    file.read_exact(&mut payload)?;
    if crc32fast::hash(&payload) != crc {
        return Err(Error::Corruption(format!("checksum mismatch in {:?}", path)));
    }

    Ok(bincode::deserialize(&payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MAGIC: &[u8; 4] = b"QTST";

    #[test]
    fn test_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.idx");
        let value = vec![(1u32, 0.5f32), (2, 1.5)];

        save_state(&path, MAGIC, &value).unwrap();
        let loaded: Vec<(u32, f32)> = load_state(&path, MAGIC).unwrap();
        assert_eq!(loaded, value);
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = load_state::<u32>(&dir.path().join("nope.idx"), MAGIC).unwrap_err();
        assert!(matches!(err, Error::ArtifactMissing(_)));
    }

    #[test]
    fn test_wrong_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.idx");
        save_state(&path, MAGIC, &42u32).unwrap();

        let err = load_state::<u32>(&path, b"QOTH").unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }

    #[test]
    fn test_corrupted_payload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.idx");
        save_state(&path, MAGIC, &vec![7u64; 16]).unwrap();

        // flip a payload byte past the header
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let err = load_state::<Vec<u64>>(&path, MAGIC).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }
}
