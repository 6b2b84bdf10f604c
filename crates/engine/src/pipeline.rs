//! The distributed encode → index → retrieve → verify pipeline
//!
//! One `RetrievalPipeline` value per worker process. The phases respect
//! the run's ordering contract: artifact creation happens-before shard
//! writes, all writes happen-before `fit`, `fit` happens-before `search`,
//! and the final result file is written only by the main rank, only after
//! every rank's partial has been gathered.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use quarry_beam::{decode, NextTokenScorer, SequenceScorer};
use quarry_comm::Coordinator;
use quarry_core::{ArraySpec, Dtype, Error, QueryId, Result, ResultMap, ShardRange};
use quarry_index::{
    IndexBackend, IndexKind, InvertedIndex, InvertedIndexOptions, PqState, QueryBatch,
    SearchStats, TrieIndex, TrieIndexOptions, VectorIndex, VectorIndexOptions, VectorKind,
    Verifier,
};
use quarry_store::{ArtifactMap, ArtifactStore, BuildLock, CacheLayout};
use tracing::{info, warn};

use crate::config::{EngineConfig, VerifierKind};
use crate::encode::{encode_split, gate_weights, EncodeOutput};
use crate::encoder::{Dataset, Encoder};
use crate::merge::{save_result_ids, save_result_scores, ResultMerger};

// ============================================================================
// Metrics
// ============================================================================

/// Run-level diagnostics collected as the pipeline goes
#[derive(Debug, Default)]
pub struct Metrics {
    inner: Mutex<BTreeMap<String, f64>>,
}

impl Metrics {
    /// Record (or overwrite) a named value
    pub fn record(&self, name: &str, value: f64) {
        self.inner.lock().insert(name.to_string(), value);
    }

    /// Read a recorded value
    pub fn get(&self, name: &str) -> Option<f64> {
        self.inner.lock().get(name).copied()
    }

    /// Snapshot of everything recorded so far
    pub fn all(&self) -> BTreeMap<String, f64> {
        self.inner.lock().clone()
    }
}

// ============================================================================
// RetrievalPipeline
// ============================================================================

/// Orchestrates one worker's share of a retrieval run
pub struct RetrievalPipeline<'a, C: Coordinator> {
    config: &'a EngineConfig,
    coord: &'a C,
    store: ArtifactStore,
    layout: CacheLayout,
    metrics: Metrics,
}

impl<'a, C: Coordinator> RetrievalPipeline<'a, C> {
    /// Build a pipeline for this worker; validates the configuration once
    pub fn new(config: &'a EngineConfig, coord: &'a C) -> Result<Self> {
        config.validate()?;
        Ok(RetrievalPipeline {
            config,
            coord,
            store: ArtifactStore::new(),
            layout: CacheLayout::new(&config.cache_root, &config.model),
            metrics: Metrics::default(),
        })
    }

    /// Diagnostics recorded so far
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    // ========================================================================
    // Encode
    // ========================================================================

    /// Encode (or load) this worker's corpus shard
    pub fn encode_text<D, E>(&self, dataset: &D, encoder: &E) -> Result<EncodeOutput>
    where
        D: Dataset,
        E: Encoder<D::Record>,
    {
        let variant = &self.config.text_variant;
        let mut output = encode_split(
            &self.store,
            self.coord,
            dataset,
            encoder,
            &self.layout.text_token_ids(variant),
            &self.layout.text_embeddings(variant),
            self.config.encode.load_encode,
            self.config.encode.save_encode,
            "text",
        )?;

        let gate_k = self.config.encode.gate_k;
        if gate_k > 0 {
            if output.weight_dim == 1 {
                info!(gate_k, "gating text token weights");
                gate_weights(&mut output.weights, output.token_len, gate_k);
            } else {
                warn!("weight gating needs scalar token weights, skipping");
            }
        }
        Ok(output)
    }

    /// Encode (or load) this worker's query shard
    pub fn encode_query<D, E>(&self, dataset: &D, encoder: &E) -> Result<EncodeOutput>
    where
        D: Dataset,
        E: Encoder<D::Record>,
    {
        let eval_set = &self.config.eval_set;
        encode_split(
            &self.store,
            self.coord,
            dataset,
            encoder,
            &self.layout.query_token_ids(eval_set),
            &self.layout.query_embeddings(eval_set),
            self.config.encode.load_encode,
            self.config.encode.save_encode,
            "query",
        )
    }

    // ========================================================================
    // Fit
    // ========================================================================

    /// Build or load the configured backend from the encoded corpus.
    ///
    /// `None` is the valid handle of a non-owning rank in single-owner
    /// modes (exact flat search builds only on the main rank).
    pub fn fit_index(&self, text: &EncodeOutput) -> Result<Option<IndexBackend>> {
        match self.config.index.kind {
            IndexKind::Inverted => Ok(Some(IndexBackend::Inverted(self.fit_inverted(text)?))),
            IndexKind::Flat => self.fit_flat(text),
            IndexKind::Ivf => Ok(Some(IndexBackend::Vector(self.fit_ivf(text)?))),
            IndexKind::Trie => Ok(Some(IndexBackend::Trie(self.fit_trie(text.total_rows)?))),
        }
    }

    fn fit_inverted(&self, text: &EncodeOutput) -> Result<InvertedIndex> {
        if text.weight_dim != 1 {
            return Err(Error::InvalidOperation(
                "inverted index needs scalar token weights".into(),
            ));
        }
        // each rank indexes its own corpus shard
        let path = self
            .layout
            .index_dir("inverted")
            .join(format!("postings.r{}.idx", self.coord.rank()));
        if self.config.index.load_index {
            info!(path = %path.display(), "loading inverted index");
            return InvertedIndex::load(&path);
        }

        let cfg = &self.config.index;
        let index = InvertedIndex::fit(
            &text.token_ids,
            &text.weights,
            text.token_len,
            text.shard.start,
            &InvertedIndexOptions {
                vocab_size: cfg.vocab_size,
                corpus_size: text.shard.len(),
                special_tokens: cfg.special_tokens.clone(),
                shards: cfg.shards,
                prune_weight: cfg.prune_weight,
                prune_len: cfg.prune_len,
            },
        )?;
        if self.config.index.save_index {
            index.save(&path)?;
        }
        Ok(index)
    }

    /// Exact flat search is single-owner: only the main rank holds the
    /// index, fitted over the full, non-sharded embedding set.
    fn fit_flat(&self, text: &EncodeOutput) -> Result<Option<IndexBackend>> {
        if text.token_len != 1 {
            return Err(Error::InvalidOperation(
                "vector index needs one embedding row per document".into(),
            ));
        }
        if !self.coord.is_main() {
            return Ok(None);
        }

        let path = self.layout.index_dir("flat").join("vectors.idx");
        if self.config.index.load_index {
            info!(path = %path.display(), "loading flat vector index");
            return Ok(Some(IndexBackend::Vector(VectorIndex::load(&path)?)));
        }

        let full = self.map_full_embeddings(text, true)?;
        let embeddings = match &full {
            Some(map) => map.as_f32(),
            None => &text.weights[..],
        };
        let cfg = &self.config.index;
        let index = VectorIndex::fit(
            embeddings,
            &VectorIndexOptions {
                kind: VectorKind::Flat,
                metric: cfg.metric,
                dim: text.weight_dim,
                corpus_size: text.total_rows,
                doc_offset: 0,
                nlist: cfg.nlist,
                train_iters: cfg.train_iters,
                seed: cfg.seed,
                nprobe: cfg.nprobe,
            },
        )?;
        if self.config.index.save_index {
            index.save(&path)?;
        }
        Ok(Some(IndexBackend::Vector(index)))
    }

    fn fit_ivf(&self, text: &EncodeOutput) -> Result<VectorIndex> {
        if text.token_len != 1 {
            return Err(Error::InvalidOperation(
                "vector index needs one embedding row per document".into(),
            ));
        }
        let path = self
            .layout
            .index_dir("ivf")
            .join(format!("vectors.r{}.idx", self.coord.rank()));
        if self.config.index.load_index {
            info!(path = %path.display(), "loading ivf vector index");
            return VectorIndex::load(&path);
        }

        let cfg = &self.config.index;
        let index = VectorIndex::fit(
            &text.weights,
            &VectorIndexOptions {
                kind: VectorKind::Ivf,
                metric: cfg.metric,
                dim: text.weight_dim,
                corpus_size: text.total_rows,
                doc_offset: text.shard.start,
                nlist: cfg.nlist,
                train_iters: cfg.train_iters,
                seed: cfg.seed,
                nprobe: cfg.nprobe,
            },
        )?;
        if self.config.index.save_index {
            index.save(&path)?;
        }
        Ok(index)
    }

    /// Build or load the code trie. Tries are identical across ranks, so
    /// only the main rank persists one.
    pub fn fit_trie(&self, corpus_size: usize) -> Result<TrieIndex> {
        let path = self.layout.index_dir("trie").join("trie.idx");
        if self.config.index.load_index {
            info!(path = %path.display(), "loading trie index");
            return TrieIndex::load(&path);
        }

        let cfg = &self.config.index;
        let codes_path = self.layout.codes_path(&cfg.code_kind, cfg.code_len);
        let spec = ArraySpec::new(&[corpus_size, cfg.code_len], Dtype::I32);
        let codes = self.store.map(&codes_path, &spec)?;

        let trie = TrieIndex::fit(
            codes.as_i32(),
            cfg.code_len,
            0,
            &TrieIndexOptions {
                corpus_size,
                skip_leading: true,
                shards: cfg.shards,
            },
        )?;
        if self.config.index.save_index && self.coord.is_main() {
            trie.save(&path)?;
        }
        Ok(trie)
    }

    /// Map the full embedding artifact for one side; `None` when this
    /// worker's buffer already covers every row. Readers borrow the mapped
    /// rows instead of copying the table.
    fn map_full_embeddings(
        &self,
        output: &EncodeOutput,
        corpus: bool,
    ) -> Result<Option<ArtifactMap>> {
        if output.shard.len() == output.total_rows {
            return Ok(None);
        }
        let path = if corpus {
            self.layout.text_embeddings(&self.config.text_variant)
        } else {
            self.layout.query_embeddings(&self.config.eval_set)
        };
        if !path.exists() {
            return Err(Error::InvalidOperation(format!(
                "distributed retrieval needs the full embedding artifact at {:?}; \
                 enable save_encode or load_encode",
                path
            )));
        }
        Ok(Some(self.store.map(&path, &output.weight_spec())?))
    }

    /// Map the full query token-id artifact; `None` when this worker's
    /// buffer already covers every row.
    fn map_full_query_tokens(&self, query: &EncodeOutput) -> Result<Option<ArtifactMap>> {
        if query.shard.len() == query.total_rows {
            return Ok(None);
        }
        let path = self.layout.query_token_ids(&self.config.eval_set);
        if !path.exists() {
            return Err(Error::InvalidOperation(format!(
                "distributed retrieval needs the full query artifact at {:?}; \
                 enable save_encode or load_encode",
                path
            )));
        }
        Ok(Some(self.store.map(&path, &query.token_spec())?))
    }

    // ========================================================================
    // Verify
    // ========================================================================

    /// Construct the configured verifier over cached embeddings/codes.
    ///
    /// `load_all` widens the slices to the full query and corpus ranges
    /// (single-owner backends verify everything on the main rank). A
    /// missing verifier artifact degrades to no verification, with a
    /// warning.
    pub fn init_verifier(
        &self,
        query_rows: usize,
        query_range: ShardRange,
        text_rows: usize,
        text_range: ShardRange,
    ) -> Result<Option<Verifier>> {
        let cfg = &self.config.verifier;
        if cfg.kind == VerifierKind::None {
            return Ok(None);
        }
        let src = self.config.verifier_src();
        let src_layout = CacheLayout::new(&self.config.cache_root, src);
        info!(src, kind = ?cfg.kind, "initializing verifier");

        let query_spec = ArraySpec::new(&[query_rows, cfg.dim], Dtype::F32);
        let query_path = src_layout.query_embeddings(&self.config.eval_set);
        let query_embeddings =
            match self
                .store
                .read_range_f32(&query_path, &query_spec, query_range)
            {
                Ok(values) => values,
                Err(Error::ArtifactMissing(path)) => {
                    warn!(path = %path.display(), "verifier artifact missing, skipping verification");
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };

        match cfg.kind {
            VerifierKind::Flat => {
                let text_spec = ArraySpec::new(&[text_rows, cfg.dim], Dtype::F32);
                let text_path = src_layout.text_embeddings(&self.config.text_variant);
                let text_embeddings =
                    match self.store.read_range_f32(&text_path, &text_spec, text_range) {
                        Ok(values) => values,
                        Err(Error::ArtifactMissing(path)) => {
                            warn!(path = %path.display(), "verifier artifact missing, skipping verification");
                            return Ok(None);
                        }
                        Err(e) => return Err(e),
                    };
                Ok(Some(Verifier::flat(
                    query_embeddings,
                    text_embeddings,
                    cfg.dim,
                    text_range.start,
                    self.config.index.metric,
                    cfg.hits,
                )))
            }
            VerifierKind::Pq => {
                let pq_path = src_layout.index_dir("pq").join("pq.idx");
                let state = match PqState::load(&pq_path) {
                    Ok(state) => state,
                    Err(Error::ArtifactMissing(path)) => {
                        warn!(path = %path.display(), "verifier artifact missing, skipping verification");
                        return Ok(None);
                    }
                    Err(e) => return Err(e),
                };
                Ok(Some(Verifier::pq(
                    query_embeddings,
                    state.dim,
                    state.m,
                    state.ksub,
                    state.codebooks,
                    state.codes,
                    cfg.hits,
                )))
            }
            // handled by the early return above
            VerifierKind::None => Ok(None),
        }
    }

    // ========================================================================
    // Search
    // ========================================================================

    /// Query the fitted backend.
    ///
    /// The sparse and ivf backends hold per-rank corpus shards, so every
    /// rank answers the full query set against its shard and the merge
    /// combines candidates per query across ranks. The flat backend is
    /// single-owner: the main rank answers everything, a `None` handle
    /// yields an empty partial.
    pub fn search(
        &self,
        index: Option<&IndexBackend>,
        query: &EncodeOutput,
        verifier: Option<&Verifier>,
    ) -> Result<(ResultMap, SearchStats)> {
        let index = match index {
            Some(index) => index,
            None => return Ok((ResultMap::default(), SearchStats::default())),
        };

        match self.config.index.kind {
            IndexKind::Inverted => {
                if query.weight_dim != 1 {
                    return Err(Error::InvalidOperation(
                        "inverted search needs scalar query weights".into(),
                    ));
                }
                let token_map = self.map_full_query_tokens(query)?;
                let weight_map = self.map_full_embeddings(query, false)?;
                let token_ids = match &token_map {
                    Some(map) => map.as_i32(),
                    None => &query.token_ids[..],
                };
                let weights = match &weight_map {
                    Some(map) => map.as_f32(),
                    None => &query.weights[..],
                };
                index.search(
                    QueryBatch::Sparse {
                        token_ids,
                        weights,
                        token_len: query.token_len,
                    },
                    0,
                    self.config.hits,
                    verifier,
                )
            }
            IndexKind::Ivf | IndexKind::Flat => {
                let weight_map = self.map_full_embeddings(query, false)?;
                let embeddings = match &weight_map {
                    Some(map) => map.as_f32(),
                    None => &query.weights[..],
                };
                index.search(
                    QueryBatch::Dense { embeddings },
                    0,
                    self.config.hits,
                    verifier,
                )
            }
            IndexKind::Trie => Err(Error::Unsupported(
                "trie retrieval is driven by constrained decoding".into(),
            )),
        }
    }

    // ========================================================================
    // Retrieve
    // ========================================================================

    /// Full run for the sparse and dense backends: encode both sides,
    /// fit, search, verify, gather, merge, persist.
    ///
    /// Returns the merged result on the main rank, `None` elsewhere.
    pub fn retrieve<DT, ET, DQ, EQ>(
        &self,
        text_dataset: &DT,
        text_encoder: &ET,
        query_dataset: &DQ,
        query_encoder: &EQ,
    ) -> Result<Option<ResultMap>>
    where
        DT: Dataset,
        ET: Encoder<DT::Record>,
        DQ: Dataset,
        EQ: Encoder<DQ::Record>,
    {
        let text = self.encode_text(text_dataset, text_encoder)?;
        let index = self.fit_index(&text)?;
        let query = self.encode_query(query_dataset, query_encoder)?;

        // every searching rank answers the full query set; its candidates
        // come from the corpus rows its index covers
        let owner_only = self.config.index.kind == IndexKind::Flat;
        let verifier = if owner_only && !self.coord.is_main() {
            None
        } else {
            let text_range = if owner_only {
                ShardRange::full(text.total_rows)
            } else {
                text.shard
            };
            self.init_verifier(
                query.total_rows,
                ShardRange::full(query.total_rows),
                text.total_rows,
                text_range,
            )?
        };

        info!(rank = self.coord.rank(), "searching");
        let (partial, stats) = self.search(index.as_ref(), &query, verifier.as_ref())?;
        self.finalize(partial, stats, verifier.is_some())
    }

    /// Full run for the generative backend: fit the code trie, decode
    /// this worker's query shard against it, gather, merge, persist.
    pub fn retrieve_generative<S: NextTokenScorer>(
        &self,
        scorer: &S,
        seq_scorer: Option<&dyn SequenceScorer>,
        corpus_size: usize,
        query_count: usize,
    ) -> Result<Option<ResultMap>> {
        let trie = self.fit_trie(corpus_size)?;
        let shard = ShardRange::for_rank(query_count, self.coord.world_size(), self.coord.rank());
        let opts = self.config.beam.decode_options();

        info!(rank = self.coord.rank(), queries = shard.len(), "decoding");
        let mut partial = ResultMap::default();
        for q in shard.start..shard.end {
            let mut ranked = decode(q as QueryId, scorer, &trie, &opts, seq_scorer);
            if self.config.hits > 0 {
                ranked.truncate(self.config.hits);
            }
            partial.insert(q as QueryId, ranked);
        }
        self.finalize(partial, SearchStats::default(), false)
    }

    /// Gather per-rank partials, merge and persist on the main rank.
    ///
    /// The result directory is guarded by a lock token: every rank waits
    /// for a foreign lock to clear, a barrier keeps latecomers from racing
    /// the new lock, and only the main rank writes.
    fn finalize(
        &self,
        partial: ResultMap,
        stats: SearchStats,
        verified: bool,
    ) -> Result<Option<ResultMap>> {
        // run-level cost diagnostic: per-rank means, summed
        let means: Vec<f64> = self.coord.all_gather(&stats.mean_visited)?;
        self.metrics
            .record("mean_visited", means.iter().sum::<f64>());

        let retrieve_dir = self.layout.retrieve_dir(&self.config.eval_set);
        BuildLock::wait_clear(&retrieve_dir);
        self.coord.barrier()?;
        let lock = if self.coord.is_main() {
            Some(BuildLock::acquire(&retrieve_dir)?)
        } else {
            None
        };

        let partials = self.coord.all_gather(&partial)?;

        if let Some(lock) = lock {
            let hits = if verified {
                self.config.verifier.hits
            } else {
                self.config.hits
            };
            let merged = ResultMerger::new(hits).merge(partials);

            let eval_set = &self.config.eval_set;
            let name = &self.config.result_name;
            save_result_ids(&self.layout.result_path(eval_set, name), &merged)?;
            if self.config.save_scores {
                save_result_scores(&self.layout.result_with_scores_path(eval_set, name), &merged)?;
            }
            lock.release()?;
            Ok(Some(merged))
        } else {
            Ok(None)
        }
    }
}
