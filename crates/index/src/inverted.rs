//! Inverted posting-list index over sparse token weights
//!
//! `fit` turns a token-id/weight artifact into per-token posting lists of
//! `(document, weight)` pairs; `search` scores each query's candidates as a
//! weighted dot product over shared tokens. Postings are immutable after
//! `fit`.

use dashmap::DashMap;
use quarry_core::{DocId, Error, Result, ResultMap, ScoredDoc, TokenId};
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::persist;
use crate::verifier::Verifier;
use crate::SearchStats;

const MAGIC: &[u8; 4] = b"QINV";

/// One entry of a posting list
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Posting {
    /// Document holding the token
    pub doc: DocId,
    /// The token's weight in that document
    pub weight: f32,
}

/// Construction options for [`InvertedIndex::fit`]
#[derive(Debug, Clone)]
pub struct InvertedIndexOptions {
    /// Number of posting lists (vocabulary entries)
    pub vocab_size: usize,
    /// Rows the artifact handed to `fit` must hold
    pub corpus_size: usize,
    /// Token ids excluded from the index (special tokens)
    pub special_tokens: Vec<TokenId>,
    /// Parallel construction slices over the document rows
    pub shards: usize,
    /// Drop postings with weight below this value; `0.0` disables
    pub prune_weight: f32,
    /// Cap each posting list, keeping the highest-weight entries; `0` disables
    pub prune_len: usize,
}

impl Default for InvertedIndexOptions {
    fn default() -> Self {
        InvertedIndexOptions {
            vocab_size: 0,
            corpus_size: 0,
            special_tokens: Vec::new(),
            shards: 1,
            prune_weight: 0.0,
            prune_len: 0,
        }
    }
}

/// Posting lists keyed by token id
#[derive(Debug, Serialize, Deserialize)]
pub struct InvertedIndex {
    corpus_size: usize,
    postings: Vec<Vec<Posting>>,
    special_tokens: FxHashSet<TokenId>,
}

impl InvertedIndex {
    /// Build posting lists from a sparse encoding.
    ///
    /// `token_ids` and `weights` are row-major `(rows, token_len)` slices;
    /// `doc_offset` is the global id of row 0, so a worker can index only
    /// its corpus shard. Negative token ids (padding) and zero weights are
    /// skipped, as are the configured special tokens.
    pub fn fit(
        token_ids: &[i32],
        weights: &[f32],
        token_len: usize,
        doc_offset: usize,
        opts: &InvertedIndexOptions,
    ) -> Result<Self> {
        if token_len == 0 || token_ids.len() % token_len != 0 {
            return Err(Error::InvalidOperation(format!(
                "token id buffer of {} elements does not divide into rows of {}",
                token_ids.len(),
                token_len
            )));
        }
        let rows = token_ids.len() / token_len;
        if rows != opts.corpus_size {
            return Err(Error::CorpusSizeMismatch {
                expected: opts.corpus_size,
                actual: rows,
            });
        }
        if weights.len() != token_ids.len() {
            return Err(Error::InvalidOperation(format!(
                "weight buffer holds {} elements, token ids {}",
                weights.len(),
                token_ids.len()
            )));
        }

        let special: FxHashSet<TokenId> = opts.special_tokens.iter().copied().collect();
        info!(rows, vocab = opts.vocab_size, shards = opts.shards, "fitting inverted index");

        // shards fill the shared map concurrently; a normalization pass
        // below restores deterministic per-list order
        let map: DashMap<TokenId, Vec<Posting>> = DashMap::new();
        let shards = opts.shards.max(1);
        let rows_per_shard = (rows + shards - 1) / shards;
        (0..shards).into_par_iter().for_each(|shard| {
            let start = shard * rows_per_shard;
            let end = ((shard + 1) * rows_per_shard).min(rows);
            for row in start..end {
                for col in 0..token_len {
                    let tok = token_ids[row * token_len + col];
                    if tok < 0 {
                        continue;
                    }
                    let tok = tok as TokenId;
                    let weight = weights[row * token_len + col];
                    if weight == 0.0
                        || special.contains(&tok)
                        || tok as usize >= opts.vocab_size
                    {
                        continue;
                    }
                    map.entry(tok).or_default().push(Posting {
                        doc: (doc_offset + row) as DocId,
                        weight,
                    });
                }
            }
        });

        let mut postings: Vec<Vec<Posting>> = (0..opts.vocab_size).map(|_| Vec::new()).collect();
        for (tok, mut list) in map.into_iter() {
            list.sort_by(|a, b| {
                a.doc
                    .cmp(&b.doc)
                    .then_with(|| b.weight.partial_cmp(&a.weight).unwrap_or(std::cmp::Ordering::Equal))
            });
            postings[tok as usize] = list;
        }

        let mut index = InvertedIndex {
            corpus_size: rows,
            postings,
            special_tokens: special,
        };
        index.prune(opts.prune_weight, opts.prune_len);
        Ok(index)
    }

    /// Drop postings below `min_weight` and cap lists at `max_len`,
    /// keeping the highest-weight entries.
    ///
    /// Bounds memory and query latency at the cost of recall.
    fn prune(&mut self, min_weight: f32, max_len: usize) {
        if min_weight <= 0.0 && max_len == 0 {
            return;
        }
        let mut dropped = 0usize;
        for list in &mut self.postings {
            let before = list.len();
            if min_weight > 0.0 {
                list.retain(|p| p.weight >= min_weight);
            }
            if max_len > 0 && list.len() > max_len {
                list.sort_by(|a, b| {
                    b.weight
                        .partial_cmp(&a.weight)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.doc.cmp(&b.doc))
                });
                list.truncate(max_len);
                list.sort_by_key(|p| p.doc);
            }
            dropped += before - list.len();
        }
        if dropped > 0 {
            info!(dropped, "pruned postings");
        }
    }

    /// Documents the index was fitted over
    pub fn corpus_size(&self) -> usize {
        self.corpus_size
    }

    /// The posting list for one token
    pub fn postings(&self, token: TokenId) -> &[Posting] {
        &self.postings[token as usize]
    }

    /// Score each query against the postings of its nonzero tokens.
    ///
    /// Query rows are `(count, token_len)`; global query ids start at
    /// `query_offset`. Scores accumulate `q_weight * d_weight` over shared
    /// tokens. With `hits > 0` each list is ranked and cut; a verifier, if
    /// present, then re-scores and may re-cut. The stats report the mean
    /// posting entries touched per query.
    pub fn search(
        &self,
        token_ids: &[i32],
        weights: &[f32],
        token_len: usize,
        query_offset: usize,
        hits: usize,
        verifier: Option<&Verifier>,
    ) -> (ResultMap, SearchStats) {
        let count = if token_len == 0 { 0 } else { token_ids.len() / token_len };
        let mut results = ResultMap::default();
        let mut touched = 0usize;

        for q in 0..count {
            let mut scores: FxHashMap<DocId, f32> = FxHashMap::default();
            for col in 0..token_len {
                let tok = token_ids[q * token_len + col];
                if tok < 0 {
                    continue;
                }
                let tok = tok as TokenId;
                let weight = weights[q * token_len + col];
                if weight == 0.0
                    || self.special_tokens.contains(&tok)
                    || tok as usize >= self.postings.len()
                {
                    continue;
                }
                let list = &self.postings[tok as usize];
                touched += list.len();
                for posting in list {
                    *scores.entry(posting.doc).or_insert(0.0) += weight * posting.weight;
                }
            }

            let mut ranked: Vec<ScoredDoc> = scores
                .into_iter()
                .map(|(doc, score)| ScoredDoc::new(doc, score))
                .collect();
            if hits > 0 {
                ranked.sort_by(ScoredDoc::rank_cmp);
                ranked.truncate(hits);
            }
            if let Some(verifier) = verifier {
                ranked = verifier.rescore(q, ranked);
            }
            results.insert((query_offset + q) as u32, ranked);
        }

        let stats = SearchStats {
            queries: count,
            mean_visited: if count == 0 {
                0.0
            } else {
                touched as f64 / count as f64
            },
        };
        (results, stats)
    }

    /// Persist the fitted structure
    pub fn save(&self, path: &Path) -> Result<()> {
        persist::save_state(path, MAGIC, self)
    }

    /// Reload a structure persisted by [`InvertedIndex::save`]
    pub fn load(path: &Path) -> Result<Self> {
        persist::load_state(path, MAGIC)
    }
}
