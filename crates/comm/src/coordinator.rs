//! The coordination contract between worker processes
//!
//! Collectives mirror the handful of operations the pipeline needs:
//! barriers to order artifact creation before writes and writes before
//! reads, all-gather to collect per-rank partials, broadcast to share the
//! main rank's decisions.

use byteorder::{ByteOrder, LittleEndian};
use quarry_core::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Rank/world-size collective operations
///
/// Every rank must issue the same sequence of collective calls; a rank that
/// skips one leaves the others blocked (there are no timeouts, matching the
/// lock-token model).
pub trait Coordinator {
    /// This process's rank, in `0..world_size`
    fn rank(&self) -> usize;

    /// Number of cooperating processes
    fn world_size(&self) -> usize;

    /// True on the rank that owns single-writer duties (rank 0)
    fn is_main(&self) -> bool {
        self.rank() == 0
    }

    /// Block until every rank has entered this barrier
    fn barrier(&self) -> Result<()>;

    /// Gather one byte payload per rank, ordered by ascending rank.
    ///
    /// The local contribution occupies its own rank's slot regardless of
    /// arrival order elsewhere.
    fn all_gather_bytes(&self, local: &[u8]) -> Result<Vec<Vec<u8>>>;

    /// Send `local` from rank `from` to every rank; returns the sender's
    /// payload everywhere (on the sender itself, an owned copy of `local`).
    fn broadcast_bytes(&self, local: &[u8], from: usize) -> Result<Vec<u8>>;

    /// Typed all-gather via `bincode`
    fn all_gather<T: Serialize + DeserializeOwned>(&self, local: &T) -> Result<Vec<T>>
    where
        Self: Sized,
    {
        let payload = bincode::serialize(local)?;
        let gathered = self.all_gather_bytes(&payload)?;
        let mut out = Vec::with_capacity(gathered.len());
        for bytes in gathered {
            out.push(bincode::deserialize(&bytes)?);
        }
        Ok(out)
    }

    /// Typed broadcast via `bincode`
    fn broadcast<T: Serialize + DeserializeOwned>(&self, local: &T, from: usize) -> Result<T>
    where
        Self: Sized,
    {
        let payload = bincode::serialize(local)?;
        let bytes = self.broadcast_bytes(&payload, from)?;
        Ok(bincode::deserialize(&bytes)?)
    }

    /// Gather per-rank `f32` rows and concatenate them in rank order
    fn all_gather_f32(&self, local: &[f32]) -> Result<Vec<f32>>
    where
        Self: Sized,
    {
        let mut payload = vec![0u8; local.len() * 4];
        LittleEndian::write_f32_into(local, &mut payload);
        let gathered = self.all_gather_bytes(&payload)?;
        let total: usize = gathered.iter().map(|b| b.len() / 4).sum();
        let mut out = Vec::with_capacity(total);
        for bytes in gathered {
            let mut chunk = vec![0f32; bytes.len() / 4];
            LittleEndian::read_f32_into(&bytes, &mut chunk);
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}
