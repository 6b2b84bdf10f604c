//! On-disk cache layout
//!
//! Every artifact a run produces lives under one cache root, at a path
//! derived from the run's configuration. The layout is stable across runs
//! of the same configuration, which is what makes `load_*` shortcuts and
//! cross-run reuse possible:
//!
//! ```text
//! <root>/encode/<model>/text/<variant>/{token_ids,embeddings}.mmp
//! <root>/encode/<model>/query/<eval_set>/{token_ids,embeddings}.mmp
//! <root>/index/<model>/<index_kind>/...
//! <root>/codes/<code_kind>/<code_len>/codes.mmp
//! <root>/retrieve/<model>/<eval_set>/<name>.bin
//! <root>/retrieve/<model>/<eval_set>/<name>_with_scores.bin
//! ```

use std::path::{Path, PathBuf};

/// Token-id artifact file name
pub const TOKEN_IDS_FILE: &str = "token_ids.mmp";
/// Embedding/weight artifact file name
pub const EMBEDDINGS_FILE: &str = "embeddings.mmp";
/// Discrete-code artifact file name
pub const CODES_FILE: &str = "codes.mmp";

/// Path builder rooted at the cache directory
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
    model: String,
}

impl CacheLayout {
    /// Create a layout for one model under `root`
    pub fn new(root: impl Into<PathBuf>, model: impl Into<String>) -> Self {
        CacheLayout {
            root: root.into(),
            model: model.into(),
        }
    }

    /// The cache root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding corpus-side encodings for `variant`
    pub fn text_dir(&self, variant: &str) -> PathBuf {
        self.root.join("encode").join(&self.model).join("text").join(variant)
    }

    /// Directory holding query-side encodings for `eval_set`
    pub fn query_dir(&self, eval_set: &str) -> PathBuf {
        self.root
            .join("encode")
            .join(&self.model)
            .join("query")
            .join(eval_set)
    }

    /// Corpus token-id artifact
    pub fn text_token_ids(&self, variant: &str) -> PathBuf {
        self.text_dir(variant).join(TOKEN_IDS_FILE)
    }

    /// Corpus weight/embedding artifact
    pub fn text_embeddings(&self, variant: &str) -> PathBuf {
        self.text_dir(variant).join(EMBEDDINGS_FILE)
    }

    /// Query token-id artifact
    pub fn query_token_ids(&self, eval_set: &str) -> PathBuf {
        self.query_dir(eval_set).join(TOKEN_IDS_FILE)
    }

    /// Query weight/embedding artifact
    pub fn query_embeddings(&self, eval_set: &str) -> PathBuf {
        self.query_dir(eval_set).join(EMBEDDINGS_FILE)
    }

    /// Directory for a persisted index structure
    pub fn index_dir(&self, index_kind: &str) -> PathBuf {
        self.root.join("index").join(&self.model).join(index_kind)
    }

    /// Discrete-code artifact for the generative backend
    pub fn codes_path(&self, code_kind: &str, code_len: usize) -> PathBuf {
        self.root
            .join("codes")
            .join(code_kind)
            .join(code_len.to_string())
            .join(CODES_FILE)
    }

    /// Directory for final retrieval results of `eval_set`
    pub fn retrieve_dir(&self, eval_set: &str) -> PathBuf {
        self.root.join("retrieve").join(&self.model).join(eval_set)
    }

    /// Final result file (document ids only)
    pub fn result_path(&self, eval_set: &str, name: &str) -> PathBuf {
        self.retrieve_dir(eval_set).join(format!("{}.bin", name))
    }

    /// Result variant that retains scores
    pub fn result_with_scores_path(&self, eval_set: &str, name: &str) -> PathBuf {
        self.retrieve_dir(eval_set)
            .join(format!("{}_with_scores.bin", name))
    }
}
