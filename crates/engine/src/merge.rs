//! Merging per-rank partial results and persisting the final map
//!
//! Query shards are disjoint, but merging stays per-query-correct even if
//! two ranks answered the same query: candidate lists concatenate, then
//! rank and cut as one.

use std::fs;
use std::path::Path;

use quarry_core::{DocId, Error, QueryId, Result, ResultMap, ScoredDoc};
use rustc_hash::FxHashMap;
use tracing::info;

/// Combines per-rank partial maps into one globally ranked result
#[derive(Debug, Clone, Copy)]
pub struct ResultMerger {
    /// Per-query cutoff after merging; `0` keeps everything, unordered
    pub hits: usize,
}

impl ResultMerger {
    /// Create a merger with the given cutoff
    pub fn new(hits: usize) -> Self {
        ResultMerger { hits }
    }

    /// Merge partials (one map per rank, in rank order) into the final
    /// result: per query, candidates concatenate across ranks, sort by
    /// descending score with ascending-id tie-break, and cut to `hits`.
    pub fn merge(&self, partials: Vec<ResultMap>) -> ResultMap {
        let mut merged: ResultMap = FxHashMap::default();
        for partial in partials {
            for (query, candidates) in partial {
                merged.entry(query).or_default().extend(candidates);
            }
        }
        if self.hits > 0 {
            for candidates in merged.values_mut() {
                candidates.sort_by(ScoredDoc::rank_cmp);
                candidates.truncate(self.hits);
            }
        }
        merged
    }
}

// ============================================================================
// Result persistence
// ============================================================================

/// Write the id-only result map at `path`, via tmp-file + rename.
///
/// Only the designated writer calls this, only after every rank's partial
/// has been gathered, so a partial result never reaches the final path.
pub fn save_result_ids(path: &Path, results: &ResultMap) -> Result<()> {
    let ids: FxHashMap<QueryId, Vec<DocId>> = results
        .iter()
        .map(|(&q, candidates)| (q, candidates.iter().map(|s| s.doc).collect()))
        .collect();
    write_bincode(path, &ids)?;
    info!(path = %path.display(), queries = ids.len(), "saved retrieval result");
    Ok(())
}

/// Write the score-retaining result variant at `path`
pub fn save_result_scores(path: &Path, results: &ResultMap) -> Result<()> {
    write_bincode(path, results)?;
    info!(path = %path.display(), queries = results.len(), "saved scored retrieval result");
    Ok(())
}

/// Load an id-only result map saved by [`save_result_ids`]
pub fn load_result_ids(path: &Path) -> Result<FxHashMap<QueryId, Vec<DocId>>> {
    read_bincode(path)
}

/// Load a scored result map saved by [`save_result_scores`]
pub fn load_result_scores(path: &Path) -> Result<ResultMap> {
    read_bincode(path)
}

fn write_bincode<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bincode::serialize(value)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_bincode<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Err(Error::ArtifactMissing(path.to_path_buf()));
    }
    Ok(bincode::deserialize(&fs::read(path)?)?)
}
