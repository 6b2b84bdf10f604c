//! Prefix tree over per-document discrete code sequences
//!
//! Each document's code (a short token-id list) is inserted into a shared
//! trie whose nodes record every document passing through them. The trie
//! is not searched directly: constrained decoding walks it by asking
//! "which tokens continue this node" and "which documents remain reachable
//! here", so generation can never leave the set of codes that exist.
//!
//! Nodes live in an arena indexed by `NodeId`; children stay sorted by
//! token id, so walks are deterministic.

use quarry_core::{DocId, Error, Result, TokenId, CODE_PAD};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::persist;

const MAGIC: &[u8; 4] = b"QTRI";

/// Arena index of a trie node
pub type NodeId = u32;

/// The root node; decoding for every query starts here
pub const ROOT: NodeId = 0;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TrieNode {
    /// `(token, child)` pairs sorted by token id
    children: Vec<(TokenId, NodeId)>,
    /// Documents whose code passes through this node
    docs: Vec<DocId>,
}

/// Construction options for [`TrieIndex::fit`]
#[derive(Debug, Clone)]
pub struct TrieIndexOptions {
    /// Rows the code artifact handed to `fit` must hold
    pub corpus_size: usize,
    /// Drop the first token of every code (a shared decoder-start marker
    /// that would otherwise add one uninformative level)
    pub skip_leading: bool,
    /// Parallel construction slices merged into one structure
    pub shards: usize,
}

impl Default for TrieIndexOptions {
    fn default() -> Self {
        TrieIndexOptions {
            corpus_size: 0,
            skip_leading: true,
            shards: 1,
        }
    }
}

/// Shared prefix tree, read-only after `fit`
#[derive(Debug, Serialize, Deserialize)]
pub struct TrieIndex {
    nodes: Vec<TrieNode>,
    corpus_size: usize,
}

impl TrieIndex {
    fn empty() -> Self {
        TrieIndex {
            nodes: vec![TrieNode::default()],
            corpus_size: 0,
        }
    }

    /// Build the trie from row-major `(rows, code_len)` codes.
    ///
    /// A row is the document's code: optionally a leading start marker,
    /// then tokens, terminated by `CODE_PAD` padding. Row `i` is document
    /// `doc_offset + i`. Shards build independent tries over contiguous
    /// row slices, merged in order so document lists stay ascending.
    pub fn fit(
        codes: &[i32],
        code_len: usize,
        doc_offset: usize,
        opts: &TrieIndexOptions,
    ) -> Result<Self> {
        if code_len == 0 || codes.len() % code_len != 0 {
            return Err(Error::InvalidOperation(format!(
                "code buffer of {} elements does not divide into rows of {}",
                codes.len(),
                code_len
            )));
        }
        let rows = codes.len() / code_len;
        if rows != opts.corpus_size {
            return Err(Error::CorpusSizeMismatch {
                expected: opts.corpus_size,
                actual: rows,
            });
        }

        let shards = opts.shards.max(1);
        let rows_per_shard = (rows + shards - 1) / shards;
        let mut partials: Vec<TrieIndex> = (0..shards)
            .into_par_iter()
            .map(|shard| {
                let start = shard * rows_per_shard;
                let end = ((shard + 1) * rows_per_shard).min(rows);
                let mut trie = TrieIndex::empty();
                for row in start..end {
                    trie.insert(
                        &codes[row * code_len..(row + 1) * code_len],
                        (doc_offset + row) as DocId,
                        opts.skip_leading,
                    );
                }
                trie
            })
            .collect();

        let mut merged = partials.remove(0);
        for partial in partials {
            merged.merge(partial);
        }
        merged.corpus_size = rows;
        info!(rows, nodes = merged.nodes.len(), "fitted trie index");
        Ok(merged)
    }

    fn insert(&mut self, code: &[i32], doc: DocId, skip_leading: bool) {
        let tokens = code
            .iter()
            .skip(if skip_leading { 1 } else { 0 })
            .take_while(|&&t| t != CODE_PAD);

        self.nodes[ROOT as usize].docs.push(doc);
        let mut node = ROOT;
        for &tok in tokens {
            debug_assert!(tok >= 0, "non-padding code token {} is negative", tok);
            let tok = tok as TokenId;
            let next = match self.nodes[node as usize]
                .children
                .binary_search_by_key(&tok, |&(t, _)| t)
            {
                Ok(pos) => self.nodes[node as usize].children[pos].1,
                Err(pos) => {
                    let id = self.nodes.len() as NodeId;
                    self.nodes.push(TrieNode::default());
                    self.nodes[node as usize].children.insert(pos, (tok, id));
                    id
                }
            };
            self.nodes[next as usize].docs.push(doc);
            node = next;
        }
    }

    /// Graft `other` into `self`; `other`'s documents must all be greater
    /// than `self`'s (contiguous ascending shards), so lists stay sorted
    /// by plain extension.
    fn merge(&mut self, other: TrieIndex) {
        let mut stack = vec![(ROOT, ROOT)];
        while let Some((into, from)) = stack.pop() {
            self.nodes[into as usize]
                .docs
                .extend_from_slice(&other.nodes[from as usize].docs);
            for &(tok, from_child) in &other.nodes[from as usize].children {
                let into_child = match self.nodes[into as usize]
                    .children
                    .binary_search_by_key(&tok, |&(t, _)| t)
                {
                    Ok(pos) => self.nodes[into as usize].children[pos].1,
                    Err(pos) => {
                        let id = self.nodes.len() as NodeId;
                        self.nodes.push(TrieNode::default());
                        self.nodes[into as usize].children.insert(pos, (tok, id));
                        id
                    }
                };
                stack.push((into_child, from_child));
            }
        }
    }

    /// Documents the trie was fitted over
    pub fn corpus_size(&self) -> usize {
        self.corpus_size
    }

    /// Node count, root included
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// The child reached from `node` by `token`, if the trie contains it
    pub fn child(&self, node: NodeId, token: TokenId) -> Option<NodeId> {
        let children = &self.nodes[node as usize].children;
        children
            .binary_search_by_key(&token, |&(t, _)| t)
            .ok()
            .map(|pos| children[pos].1)
    }

    /// The `(token, child)` continuations of `node`, ascending by token
    pub fn children(&self, node: NodeId) -> &[(TokenId, NodeId)] {
        &self.nodes[node as usize].children
    }

    /// Documents whose code passes through `node`
    pub fn docs(&self, node: NodeId) -> &[DocId] {
        &self.nodes[node as usize].docs
    }

    /// Number of documents reachable from `node`
    pub fn doc_count(&self, node: NodeId) -> usize {
        self.nodes[node as usize].docs.len()
    }

    /// True when `node` has no continuations
    pub fn is_terminal(&self, node: NodeId) -> bool {
        self.nodes[node as usize].children.is_empty()
    }

    /// Persist the fitted structure.
    ///
    /// Tries built by different ranks over the full corpus are identical,
    /// so only one rank needs to save.
    pub fn save(&self, path: &Path) -> Result<()> {
        persist::save_state(path, MAGIC, self)
    }

    /// Reload a structure persisted by [`TrieIndex::save`]
    pub fn load(path: &Path) -> Result<Self> {
        persist::load_state(path, MAGIC)
    }
}
