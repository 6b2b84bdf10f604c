//! Trie-constrained decoding for one query
//!
//! Each step restricts the model's next-token distribution to the tokens
//! that continue the beam's current trie node. Anything outside the trie
//! gets zero probability by construction, because only trie children are
//! ever expanded. Continuations are chosen by cumulative log-probability,
//! or sampled when a sampling strategy is configured.
//!
//! A beam freezes early once its node's reachable-document set is small
//! enough: the partial code already pins down few enough candidates that
//! generating further tokens cannot help.

use quarry_core::{DocId, QueryId, ScoredDoc, TokenId};
use quarry_index::trie::{NodeId, TrieIndex, ROOT};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::{DecodeOptions, DecodeStrategy, NextTokenScorer, ScoreSource, SequenceScorer};

/// One partial output sequence
///
/// Owned exclusively by the decode loop of a single query and discarded
/// when that query's decoding completes.
#[derive(Debug, Clone)]
struct Beam {
    tokens: Vec<TokenId>,
    node: NodeId,
    /// Cumulative log-probability of `tokens`
    score: f32,
    /// Frozen beams are complete and no longer extended
    frozen: bool,
}

/// A candidate continuation of one live beam
struct Candidate {
    beam_idx: usize,
    token: TokenId,
    child: NodeId,
    /// Cumulative log-probability after appending `token`
    total: f32,
    /// The token's probability within its beam's allowed set (sampling)
    prob: f32,
}

/// Decode one query against the trie, returning every reachable document
/// with the best score among the completed beams that reach it.
///
/// Documents reachable via several beams are deduplicated by max, never
/// summed. The result is ranked by descending score, ties broken by
/// ascending document id.
pub fn decode<S: NextTokenScorer>(
    query: QueryId,
    scorer: &S,
    trie: &TrieIndex,
    opts: &DecodeOptions,
    seq_scorer: Option<&dyn SequenceScorer>,
) -> Vec<ScoredDoc> {
    // distinct stream per query, reproducible across runs; unused in
    // pure beam mode
    let seed = match &opts.strategy {
        DecodeStrategy::Beam => 0,
        DecodeStrategy::Sample(params) => params.seed ^ (query as u64),
    };
    let mut rng = StdRng::seed_from_u64(seed);

    let mut beams = vec![Beam {
        tokens: Vec::new(),
        node: ROOT,
        score: 0.0,
        frozen: false,
    }];

    for step in 0..opts.max_new_tokens {
        let live: Vec<usize> = beams
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.frozen && !trie.is_terminal(b.node))
            .map(|(i, _)| i)
            .collect();
        let carried = beams.len() - live.len();
        let quota = opts.nbeam.saturating_sub(carried);
        if live.is_empty() || quota == 0 {
            break;
        }

        let mut candidates = Vec::new();
        for &beam_idx in &live {
            let beam = &beams[beam_idx];
            let log_probs = scorer.log_probs(query, &beam.tokens);
            candidates.extend(expand_beam(beam_idx, beam, trie, &log_probs, opts));
        }
        if candidates.is_empty() {
            break;
        }

        let chosen = match &opts.strategy {
            DecodeStrategy::Beam => select_top(candidates, quota),
            DecodeStrategy::Sample(_) => sample_without_replacement(candidates, quota, &mut rng),
        };

        let mut next: Vec<Beam> = Vec::with_capacity(carried + chosen.len());
        for beam in &beams {
            if beam.frozen || trie.is_terminal(beam.node) {
                next.push(beam.clone());
            }
        }
        for cand in chosen {
            let parent = &beams[cand.beam_idx];
            let mut tokens = parent.tokens.clone();
            tokens.push(cand.token);
            let generated = tokens.len();
            let frozen = opts.threshold > 0
                && generated >= opts.trsd_start_len
                && trie.doc_count(cand.child) < opts.threshold;
            next.push(Beam {
                tokens,
                node: cand.child,
                score: cand.total,
                frozen,
            });
        }
        beams = next;
        trace!(query, step, beams = beams.len(), "decode step");
    }

    collect_results(query, &beams, trie, opts, seq_scorer)
}

/// Continuations of `beam` restricted to its node's trie children
fn expand_beam(
    beam_idx: usize,
    beam: &Beam,
    trie: &TrieIndex,
    log_probs: &[f32],
    opts: &DecodeOptions,
) -> Vec<Candidate> {
    let children = trie.children(beam.node);
    let mut allowed: Vec<(TokenId, NodeId, f32)> = children
        .iter()
        .filter(|&&(tok, _)| (tok as usize) < log_probs.len())
        .map(|&(tok, child)| (tok, child, log_probs[tok as usize]))
        .collect();
    if allowed.is_empty() {
        return Vec::new();
    }

    if opts.renormalize {
        // log-softmax over the allowed set only
        let max = allowed.iter().map(|&(_, _, lp)| lp).fold(f32::NEG_INFINITY, f32::max);
        let lse = max
            + allowed
                .iter()
                .map(|&(_, _, lp)| (lp - max).exp())
                .sum::<f32>()
                .ln();
        for entry in &mut allowed {
            entry.2 -= lse;
        }
    }

    let probs = match &opts.strategy {
        DecodeStrategy::Beam => vec![0.0; allowed.len()],
        DecodeStrategy::Sample(params) => filter_probs(&mut allowed, params),
    };

    allowed
        .into_iter()
        .zip(probs)
        .filter(|((_, _, lp), _)| lp.is_finite())
        .map(|((token, child, lp), prob)| Candidate {
            beam_idx,
            token,
            child,
            total: beam.score + lp,
            prob,
        })
        .collect()
}

/// Temperature, top-k, nucleus, and typical filtering over one beam's
/// allowed tokens. Filtered-out entries get their log-probability set to
/// `-inf`; survivors' probabilities are renormalized and returned.
fn filter_probs(allowed: &mut [(TokenId, NodeId, f32)], params: &crate::SamplingParams) -> Vec<f32> {
    let n = allowed.len();
    let temperature = if params.temperature > 0.0 { params.temperature } else { 1.0 };

    // softmax of scaled logits
    let scaled: Vec<f32> = allowed.iter().map(|&(_, _, lp)| lp / temperature).collect();
    let max = scaled.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp: Vec<f32> = scaled.iter().map(|&s| (s - max).exp()).collect();
    let sum: f32 = exp.iter().sum();
    let mut probs: Vec<f32> = exp.iter().map(|&e| e / sum).collect();

    let mut keep = vec![true; n];
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| probs[b].partial_cmp(&probs[a]).unwrap_or(std::cmp::Ordering::Equal));

    if params.top_k > 0 {
        for &i in order.iter().skip(params.top_k) {
            keep[i] = false;
        }
    }
    if let Some(top_p) = params.top_p {
        let mut cum = 0.0;
        let mut cut = false;
        for &i in &order {
            if !keep[i] {
                continue;
            }
            if cut {
                keep[i] = false;
            } else {
                cum += probs[i];
                if cum >= top_p {
                    cut = true;
                }
            }
        }
    }
    if let Some(typical_p) = params.typical_p {
        // keep tokens whose surprisal is closest to the distribution's
        // entropy, up to cumulative mass typical_p
        let entropy: f32 = probs
            .iter()
            .filter(|&&p| p > 0.0)
            .map(|&p| -p * p.ln())
            .sum();
        let mut by_typicality: Vec<usize> = (0..n).filter(|&i| keep[i]).collect();
        by_typicality.sort_by(|&a, &b| {
            let da = (-probs[a].ln() - entropy).abs();
            let db = (-probs[b].ln() - entropy).abs();
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        });
        let mut cum = 0.0;
        let mut cut = false;
        for &i in &by_typicality {
            if cut {
                keep[i] = false;
            } else {
                cum += probs[i];
                if cum >= typical_p {
                    cut = true;
                }
            }
        }
    }

    let kept_mass: f32 = (0..n).filter(|&i| keep[i]).map(|i| probs[i]).sum();
    for i in 0..n {
        if keep[i] {
            probs[i] /= kept_mass;
        } else {
            probs[i] = 0.0;
            allowed[i].2 = f32::NEG_INFINITY;
        }
    }
    probs
}

/// Highest cumulative log-probability first; deterministic tie-break by
/// originating beam then token id
fn select_top(mut candidates: Vec<Candidate>, quota: usize) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        b.total
            .partial_cmp(&a.total)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.beam_idx.cmp(&b.beam_idx))
            .then_with(|| a.token.cmp(&b.token))
    });
    candidates.truncate(quota);
    candidates
}

/// Weighted sampling of `quota` distinct continuations.
///
/// A candidate's weight blends how likely its beam is with how likely the
/// token is within the beam's filtered distribution.
fn sample_without_replacement(
    mut candidates: Vec<Candidate>,
    quota: usize,
    rng: &mut StdRng,
) -> Vec<Candidate> {
    let mut chosen = Vec::with_capacity(quota.min(candidates.len()));
    // stable weight base: softmax over beam cumulative scores
    let max_total = candidates
        .iter()
        .map(|c| c.total)
        .fold(f32::NEG_INFINITY, f32::max);
    let mut weights: Vec<f64> = candidates
        .iter()
        .map(|c| ((c.total - max_total).exp() as f64) * (c.prob.max(1e-12) as f64))
        .collect();

    while chosen.len() < quota && !candidates.is_empty() {
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            break;
        }
        let mut draw = rng.gen_range(0.0..total);
        let mut picked = weights.len() - 1;
        for (i, &w) in weights.iter().enumerate() {
            if draw < w {
                picked = i;
                break;
            }
            draw -= w;
        }
        chosen.push(candidates.swap_remove(picked));
        weights.swap_remove(picked);
    }
    chosen
}

/// Best score per reachable document across every completed beam
fn collect_results(
    query: QueryId,
    beams: &[Beam],
    trie: &TrieIndex,
    opts: &DecodeOptions,
    seq_scorer: Option<&dyn SequenceScorer>,
) -> Vec<ScoredDoc> {
    let mut best: FxHashMap<DocId, f32> = FxHashMap::default();
    for beam in beams {
        let score = match opts.score_source {
            ScoreSource::LogProb => beam.score,
            ScoreSource::Sequence => seq_scorer
                .map(|s| s.score_sequence(query, &beam.tokens))
                .unwrap_or(beam.score),
        };
        for &doc in trie.docs(beam.node) {
            let entry = best.entry(doc).or_insert(f32::NEG_INFINITY);
            if score > *entry {
                *entry = score;
            }
        }
    }

    let mut ranked: Vec<ScoredDoc> = best
        .into_iter()
        .map(|(doc, score)| ScoredDoc::new(doc, score))
        .collect();
    ranked.sort_by(ScoredDoc::rank_cmp);
    ranked
}
