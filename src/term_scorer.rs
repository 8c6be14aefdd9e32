//! TF-IDF relevance scoring used by the glossary extractor to decide which chunks are
//! worth sampling for new-term candidates.
//!
//! Grounded on the teacher's double-buffered shared state pattern (`aggregator.rs` swaps
//! a whole snapshot rather than mutating one in place) generalized from `Arc<Mutex<_>>`
//! to `arc_swap::ArcSwap` so readers never block on a rebuild in progress — a rebuild
//! publishes a brand new `TermScorerState` atomically, it never half-updates the old one.
//!
//! This is a closed-vocabulary scorer: the only terms it ever scores are the glossary's
//! own `source_term` keys, matched against each document/chunk as whole substrings
//! rather than through a general-purpose tokenizer. The source corpus is Chinese prose
//! with no reliable word boundaries, and glossary keys for this domain are almost always
//! multi-character (character names, cultivation realms), so an open-vocabulary
//! per-codepoint tokenizer would never agree with them.

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct TermScorerState {
    /// document frequency: how many documents (chapters sampled so far) each glossary
    /// term appears in at least once
    document_frequency: HashMap<String, usize>,
    document_count: usize,
}

impl TermScorerState {
    /// Builds the document-frequency table restricted to `terms` (the glossary's current
    /// keys): for each term, counts how many of `documents` contain it at least once.
    /// Terms absent from every document are omitted entirely, same as a df of zero.
    pub fn fit(documents: &[String], terms: &[String]) -> Self {
        let mut document_frequency: HashMap<String, usize> = HashMap::new();
        for term in terms {
            if term.is_empty() {
                continue;
            }
            let df = documents.iter().filter(|doc| doc.contains(term.as_str())).count();
            if df > 0 {
                document_frequency.insert(term.clone(), df);
            }
        }
        TermScorerState {
            document_frequency,
            document_count: documents.len(),
        }
    }

    /// Scores every fitted term that occurs in `chunk` by `tf * log(D / df)`, omitting
    /// terms absent from the chunk entirely. A term with `df >= D` (appears in every
    /// sampled document so far, i.e. near-universal) scores zero rather than a negative
    /// or NaN value, since `log(D/df) <= 0` in that case carries no discriminative signal.
    pub fn score_chunk(&self, chunk: &str) -> HashMap<String, f64> {
        if self.document_count == 0 {
            return HashMap::new();
        }
        let d = self.document_count as f64;
        self.document_frequency
            .iter()
            .filter_map(|(term, &df)| {
                let tf = chunk.matches(term.as_str()).count();
                if tf == 0 {
                    return None;
                }
                let df = df as f64;
                let score = if df <= 0.0 || df >= d {
                    0.0
                } else {
                    (tf as f64) * (d / df).ln()
                };
                Some((term.clone(), score.max(0.0)))
            })
            .collect()
    }

    pub fn document_count(&self) -> usize {
        self.document_count
    }
}

/// Double-buffered holder: `rebuild` publishes a new `Arc<TermScorerState>` in one
/// atomic swap, so a reader mid-`score_chunk` on the old state is never disturbed and
/// never observes a partially-built index.
pub struct TermScorer {
    state: ArcSwap<TermScorerState>,
}

impl Default for TermScorer {
    fn default() -> Self {
        TermScorer {
            state: ArcSwap::from_pointee(TermScorerState::default()),
        }
    }
}

impl TermScorer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rebuild(&self, documents: &[String], terms: &[String]) {
        self.state.store(Arc::new(TermScorerState::fit(documents, terms)));
    }

    pub fn score_chunk(&self, chunk: &str) -> HashMap<String, f64> {
        self.state.load().score_chunk(chunk)
    }

    pub fn document_count(&self) -> usize {
        self.state.load().document_count()
    }

    /// Ranks the top `n` terms of `chunk` by descending score, for use when picking
    /// sample passages to hand the glossary extractor's LLM call.
    pub fn top_terms(&self, chunk: &str, n: usize) -> Vec<(String, f64)> {
        let mut scored: Vec<(String, f64)> = self.score_chunk(chunk).into_iter().collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(n);
        scored
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn near_universal_terms_score_zero() {
        let docs = vec!["常见词".to_string(), "常见词".to_string(), "常见词".to_string()];
        let terms = vec!["常见词".to_string()];
        let scorer = TermScorer::new();
        scorer.rebuild(&docs, &terms);
        let scores = scorer.score_chunk("常见词出现在这句话里");
        assert_eq!(scores.get("常见词"), Some(&0.0));
    }

    #[test]
    fn rare_term_scores_higher_than_common_term() {
        let docs = vec![
            "常见词常见词稀有词".to_string(),
            "常见词".to_string(),
            "常见词".to_string(),
        ];
        let terms = vec!["常见词".to_string(), "稀有词".to_string()];
        let scorer = TermScorer::new();
        scorer.rebuild(&docs, &terms);
        let scores = scorer.score_chunk("常见词稀有词");
        let common = scores.get("常见词").copied().unwrap_or(0.0);
        let rare = scores.get("稀有词").copied().unwrap_or(0.0);
        assert!(rare >= common);
    }

    #[test]
    fn multi_character_glossary_terms_match_whole() {
        let docs = vec!["张三走进了房间".to_string(), "李四离开了房间".to_string()];
        let terms = vec!["张三".to_string(), "李四".to_string()];
        let scorer = TermScorer::new();
        scorer.rebuild(&docs, &terms);
        let scores = scorer.score_chunk("张三又来了");
        assert!(scores.contains_key("张三"));
        assert!(!scores.contains_key("李四"));
    }

    #[test]
    fn terms_absent_from_every_document_are_never_scored() {
        let docs = vec!["无关内容".to_string()];
        let terms = vec!["张三".to_string()];
        let scorer = TermScorer::new();
        scorer.rebuild(&docs, &terms);
        let scores = scorer.score_chunk("张三出场了");
        assert!(scores.is_empty());
    }

    #[test]
    fn empty_state_scores_nothing() {
        let scorer = TermScorer::new();
        assert!(scorer.score_chunk("some text").is_empty());
    }
}
