//! Single-process degenerate coordinator

use quarry_core::Result;

use crate::coordinator::Coordinator;

/// Identity coordinator for world size 1
///
/// Every collective is a no-op or returns the local value; the pipeline
/// code stays oblivious to whether it runs distributed.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl Coordinator for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }

    fn all_gather_bytes(&self, local: &[u8]) -> Result<Vec<Vec<u8>>> {
        Ok(vec![local.to_vec()])
    }

    fn broadcast_bytes(&self, local: &[u8], _from: usize) -> Result<Vec<u8>> {
        Ok(local.to_vec())
    }
}
