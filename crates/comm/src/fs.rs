//! Filesystem rendezvous coordinator
//!
//! Cross-process transport for this system is the filesystem, so the
//! collectives are built on it too: every operation gets a fresh epoch
//! number, each rank publishes an arrival/payload file for that epoch via
//! tmp-file + rename (atomic appearance), and peers discover the files by
//! polling with a fixed backoff.
//!
//! All ranks must issue the same sequence of collective calls against the
//! same rendezvous directory, and the directory must be fresh per run
//! (epoch numbers restart at zero). A crashed peer leaves the others
//! polling forever; recovery is external restart, matching the lock-token
//! model.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use quarry_core::{Error, Result};
use tracing::debug;

use crate::coordinator::Coordinator;

/// Backoff between polls for a peer's file
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Coordinator rendezvousing through a shared directory
#[derive(Debug)]
pub struct FsCoordinator {
    dir: PathBuf,
    rank: usize,
    world: usize,
    epoch: AtomicU64,
}

impl FsCoordinator {
    /// Join the rendezvous at `dir` as `rank` of `world`.
    ///
    /// `dir` is created if missing. Use a run-scoped directory: epochs
    /// restart at zero, so files left by a previous run would be mistaken
    /// for this run's arrivals.
    pub fn new(dir: impl Into<PathBuf>, rank: usize, world: usize) -> Result<Self> {
        if world == 0 {
            return Err(Error::InvalidOperation("world size must be positive".into()));
        }
        if rank >= world {
            return Err(Error::InvalidOperation(format!(
                "rank {} out of range for world size {}",
                rank, world
            )));
        }
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(FsCoordinator {
            dir,
            rank,
            world,
            epoch: AtomicU64::new(0),
        })
    }

    fn next_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::Relaxed)
    }

    /// Publish `bytes` at `name` so it appears atomically to pollers
    fn publish(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let tmp = self.dir.join(format!("{}.tmp{}", name, self.rank));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, self.dir.join(name))?;
        Ok(())
    }

    /// Poll until `name` exists, then read it
    fn await_file(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.dir.join(name);
        loop {
            match fs::read(&path) {
                Ok(bytes) => return Ok(bytes),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    thread::sleep(POLL_INTERVAL)
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Poll until `path` exists, without reading it
    fn await_presence(&self, path: &Path) {
        while !path.exists() {
            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl Coordinator for FsCoordinator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world
    }

    fn barrier(&self) -> Result<()> {
        let epoch = self.next_epoch();
        debug!(rank = self.rank, epoch, "entering barrier");
        self.publish(&format!("barrier-{:08}-{}", epoch, self.rank), b"")?;
        for peer in 0..self.world {
            let path = self.dir.join(format!("barrier-{:08}-{}", epoch, peer));
            self.await_presence(&path);
        }
        Ok(())
    }

    fn all_gather_bytes(&self, local: &[u8]) -> Result<Vec<Vec<u8>>> {
        let epoch = self.next_epoch();
        self.publish(&format!("gather-{:08}-{}", epoch, self.rank), local)?;

        let mut slots = Vec::with_capacity(self.world);
        for peer in 0..self.world {
            if peer == self.rank {
                // own slot comes from memory, not from disk
                slots.push(local.to_vec());
            } else {
                slots.push(self.await_file(&format!("gather-{:08}-{}", epoch, peer))?);
            }
        }
        Ok(slots)
    }

    fn broadcast_bytes(&self, local: &[u8], from: usize) -> Result<Vec<u8>> {
        let epoch = self.next_epoch();
        let name = format!("bcast-{:08}", epoch);
        if self.rank == from {
            self.publish(&name, local)?;
            Ok(local.to_vec())
        } else {
            self.await_file(&name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Run `f` on every rank of a `world`-sized group sharing one dir
    fn run_group<F, T>(world: usize, f: F) -> Vec<T>
    where
        F: Fn(FsCoordinator) -> T + Send + Sync + 'static,
        T: Send + 'static,
    {
        let dir = TempDir::new().unwrap();
        let f = Arc::new(f);
        let handles: Vec<_> = (0..world)
            .map(|rank| {
                let path = dir.path().to_path_buf();
                let f = Arc::clone(&f);
                thread::spawn(move || f(FsCoordinator::new(path, rank, world).unwrap()))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn test_rejects_bad_rank() {
        let dir = TempDir::new().unwrap();
        assert!(FsCoordinator::new(dir.path(), 3, 2).is_err());
        assert!(FsCoordinator::new(dir.path(), 0, 0).is_err());
    }

    #[test]
    fn test_barrier_releases_all_ranks() {
        let results = run_group(3, |coord| {
            coord.barrier().unwrap();
            coord.barrier().unwrap();
            coord.rank()
        });
        assert_eq!(results.len(), 3);
    }

    #[test]
    fn test_all_gather_orders_by_rank() {
        // each rank contributes a distinct payload; everyone must see them
        // in ascending rank order regardless of arrival order
        let results = run_group(4, |coord| {
            if coord.rank() % 2 == 0 {
                // stagger arrivals
                thread::sleep(Duration::from_millis(20));
            }
            let local = vec![coord.rank() as u32 * 10; coord.rank() + 1];
            coord.all_gather(&local).unwrap()
        });
        for gathered in results {
            assert_eq!(
                gathered,
                vec![vec![0], vec![10, 10], vec![20, 20, 20], vec![30, 30, 30, 30]]
            );
        }
    }

    #[test]
    fn test_all_gather_f32_concatenates_in_rank_order() {
        let results = run_group(2, |coord| {
            let local = vec![coord.rank() as f32; 2];
            coord.all_gather_f32(&local).unwrap()
        });
        for cat in results {
            assert_eq!(cat, vec![0.0, 0.0, 1.0, 1.0]);
        }
    }

    #[test]
    fn test_broadcast_from_main() {
        let results = run_group(3, |coord| {
            let local = if coord.is_main() {
                "decision".to_string()
            } else {
                String::new()
            };
            coord.broadcast(&local, 0).unwrap()
        });
        assert!(results.iter().all(|r| r == "decision"));
    }

    #[test]
    fn test_broadcast_from_nonzero_rank() {
        let results = run_group(3, |coord| {
            let local = if coord.rank() == 2 { vec![7u8, 8] } else { vec![] };
            coord.broadcast(&local, 2).unwrap()
        });
        assert!(results.iter().all(|r| r == &vec![7u8, 8]));
    }

    #[test]
    fn test_mixed_sequence_of_collectives() {
        let results = run_group(2, |coord| {
            coord.barrier().unwrap();
            let sums: Vec<u64> = coord.all_gather(&(coord.rank() as u64 + 1)).unwrap();
            coord.barrier().unwrap();
            let chosen = coord.broadcast(&sums.iter().sum::<u64>(), 0).unwrap();
            chosen
        });
        assert_eq!(results, vec![3, 3]);
    }
}
