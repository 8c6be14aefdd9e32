//! Background task that periodically mines newly translated chapters for glossary
//! candidates and merges them under the glossary's writer lock.
//!
//! Grounded on the teacher's `aggregator.rs` long-lived background task pattern (a task
//! spawned alongside workers, polling a shared queue on an interval, never propagating
//! its own failures upward) generalized from progress aggregation to LLM-driven term
//! mining.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::events::PipelineEvent;
use crate::glossary::GlossaryStore;
use crate::llm::LlmClient;
use crate::models::{GlossaryCategory, GlossaryEntry, MergeMode};
use crate::term_scorer::TermScorer;

pub struct GlossaryExtractorConfig {
    pub batch_interval: Duration,
    pub sample_size_chars: usize,
    pub sample_chapters: usize,
    pub min_entries: usize,
    pub max_entries: usize,
    pub wait_timeout: Duration,
    /// Once the glossary version has advanced this far past the scorer's last rebuild,
    /// the extractor opportunistically rebuilds it from the corpus it has observed —
    /// the extractor-side twin of the same threshold the translator consumers check
    /// before their own next chapter (§4.3's rebuild policy applies at both sites).
    pub scorer_rebuild_threshold: u64,
    /// When true, seed and batch sampling draw `sample_chapters` entries uniformly at
    /// random from the pending queue instead of strictly FIFO — avoids biasing the
    /// mined vocabulary toward whichever chapters happened to crawl first.
    pub random_sample: bool,
    /// Term extraction is a factual-recall task, not a creative one; a low temperature
    /// keeps candidate terms consistent across batches.
    pub temperature: f32,
}

/// Queue of (chapter_index, source_text) pairs the extractor hasn't sampled yet, plus a
/// `Notify` so `seed_ready` can be signaled once the initial generation completes. Also
/// retains every source text ever pushed (`corpus`) so the extractor can rebuild the
/// term scorer without re-reading chapter files from disk.
pub struct GlossaryExtractorQueue {
    pending: Mutex<VecDeque<(u32, String)>>,
    corpus: Mutex<Vec<String>>,
    seed_ready: Notify,
    seeded: std::sync::atomic::AtomicBool,
}

impl Default for GlossaryExtractorQueue {
    fn default() -> Self {
        GlossaryExtractorQueue {
            pending: Mutex::new(VecDeque::new()),
            corpus: Mutex::new(Vec::new()),
            seed_ready: Notify::new(),
            seeded: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

impl GlossaryExtractorQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, chapter_index: u32, source_text: String) {
        self.corpus.lock().await.push(source_text.clone());
        self.pending.lock().await.push_back((chapter_index, source_text));
    }

    /// Drains up to `n` entries from the pending queue. FIFO by default; when
    /// `random_sample` is set, draws a uniform random subset instead, leaving the
    /// remainder in its original relative order.
    async fn drain_up_to(&self, n: usize, random_sample: bool) -> Vec<(u32, String)> {
        let mut guard = self.pending.lock().await;
        let take = n.min(guard.len());
        if !random_sample || take == guard.len() {
            return guard.drain(..take).collect();
        }
        let mut indices: Vec<usize> = (0..guard.len()).collect();
        indices.shuffle(&mut rand::thread_rng());
        indices.truncate(take);
        indices.sort_unstable_by(|a, b| b.cmp(a));
        indices.into_iter().map(|idx| guard.remove(idx).unwrap()).collect()
    }

    async fn corpus_snapshot(&self) -> Vec<String> {
        self.corpus.lock().await.clone()
    }

    fn mark_seeded(&self) {
        self.seeded.store(true, std::sync::atomic::Ordering::Release);
        self.seed_ready.notify_waiters();
    }

    /// Waits for the initial glossary generation to complete, up to `timeout`. Returns
    /// immediately if seeding already happened. On timeout, translation proceeds with
    /// whatever glossary state exists (possibly empty) per the spec's non-blocking rule.
    pub async fn wait_for_seed(&self, timeout: Duration) {
        if self.seeded.load(std::sync::atomic::Ordering::Acquire) {
            return;
        }
        let _ = tokio::time::timeout(timeout, self.seed_ready.notified()).await;
    }
}

pub struct GlossaryExtractor<L: LlmClient + ?Sized> {
    llm: Arc<L>,
    glossary: Arc<GlossaryStore>,
    scorer: Arc<TermScorer>,
    queue: Arc<GlossaryExtractorQueue>,
    config: GlossaryExtractorConfig,
    events: Option<mpsc::UnboundedSender<PipelineEvent>>,
    last_fit_version: AtomicU64,
}

impl<L: LlmClient + ?Sized> GlossaryExtractor<L> {
    pub fn new(
        llm: Arc<L>,
        glossary: Arc<GlossaryStore>,
        scorer: Arc<TermScorer>,
        queue: Arc<GlossaryExtractorQueue>,
        config: GlossaryExtractorConfig,
    ) -> Self {
        GlossaryExtractor {
            llm,
            glossary,
            scorer,
            queue,
            config,
            events: None,
            last_fit_version: AtomicU64::new(0),
        }
    }

    /// Publishes a `glossary.updated` event after every batch that actually merges new
    /// terms. `None` by default, matching every other optional-sink builder in this crate.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<PipelineEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Runs until `cancel` fires. Never returns an error: all extraction failures are
    /// logged and swallowed, per the spec's "best-effort enrichment" rule.
    pub async fn run(&self, cancel: CancellationToken) {
        if self.glossary.len().await == 0 {
            self.run_initial_seed(&cancel).await;
        } else {
            self.queue.mark_seeded();
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.batch_interval) => {
                    self.run_one_batch().await;
                }
                _ = cancel.cancelled() => {
                    info!("glossary extractor stopping on cancellation");
                    return;
                }
            }
        }
    }

    async fn run_initial_seed(&self, cancel: &CancellationToken) {
        info!("waiting for initial chapters to seed the glossary");
        let deadline = tokio::time::Instant::now() + self.config.wait_timeout;
        loop {
            if self.glossary.len().await >= self.config.min_entries {
                break;
            }
            let available = self
                .queue
                .drain_up_to(self.config.sample_chapters, self.config.random_sample)
                .await;
            if !available.is_empty() {
                self.extract_and_merge(available).await;
                continue;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("timed out waiting for chapters to seed the glossary; starting with whatever was found");
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                _ = cancel.cancelled() => break,
            }
        }
        self.queue.mark_seeded();
    }

    async fn run_one_batch(&self) {
        let batch = self
            .queue
            .drain_up_to(self.config.sample_chapters.max(1), self.config.random_sample)
            .await;
        if batch.is_empty() {
            return;
        }
        self.extract_and_merge(batch).await;
    }

    async fn extract_and_merge(&self, batch: Vec<(u32, String)>) {
        let sample: String = batch
            .iter()
            .map(|(_, text)| truncate_chars(text, self.config.sample_size_chars))
            .collect::<Vec<_>>()
            .join("\n\n---\n\n");

        let system_prompt = "You identify proper nouns and recurring terminology in serialized fiction \
            that a translator should keep consistent: character names, place names, cultivation \
            realms, special techniques, organizations, and notable items. Respond with one \
            `source_term -> target_term` pair per line.";

        match self.llm.complete(system_prompt, &sample, self.config.temperature).await {
            Ok(response) => {
                let candidates = parse_candidates(&response);
                if candidates.is_empty() {
                    return;
                }
                let capped: Vec<_> = candidates.into_iter().take(self.config.max_entries).collect();
                match self.glossary.add(capped, MergeMode::Merge).await {
                    Ok(added) if added > 0 => {
                        info!(added, "glossary extractor merged new terms");
                        if let Some(tx) = &self.events {
                            let _ = tx.send(PipelineEvent::GlossaryUpdated {
                                version: self.glossary.version(),
                                entry_count: self.glossary.len().await,
                            });
                        }
                        self.maybe_rebuild_scorer().await;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "glossary extractor failed to persist new terms"),
                }
            }
            Err(e) => {
                warn!(error = %e, "glossary extractor LLM call failed; skipping this batch");
            }
        }
    }
}

impl<L: LlmClient + ?Sized> GlossaryExtractor<L> {
    /// Opportunistic rebuild on the extractor side: the translator consumers already
    /// rebuild before their own next chapter (§4.3), but a long-idle worker pool
    /// between batches would otherwise leave the scorer stale for longer than the
    /// configured threshold. Harmless if it races a consumer's own rebuild — both
    /// publish through the same double-buffered `ArcSwap`.
    async fn maybe_rebuild_scorer(&self) {
        let version = self.glossary.version();
        if version.saturating_sub(self.last_fit_version.load(Ordering::Acquire)) < self.config.scorer_rebuild_threshold
        {
            return;
        }
        let documents = self.queue.corpus_snapshot().await;
        if documents.is_empty() {
            return;
        }
        let terms: Vec<String> = self.glossary.snapshot().await.into_keys().collect();
        self.scorer.rebuild(&documents, &terms);
        self.last_fit_version.store(version, Ordering::Release);
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Parses `source -> target` lines (tolerating `：`, `:`, `=`, or `->` separators) into
/// glossary entries, skipping malformed lines rather than failing the whole batch.
fn parse_candidates(response: &str) -> Vec<GlossaryEntry> {
    response
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            let separators = ["->", "：", ":", "="];
            let split = separators.iter().find_map(|sep| line.split_once(sep));
            split.map(|(source, target)| GlossaryEntry {
                source_term: source.trim().to_string(),
                target_term: target.trim().to_string(),
                category: GlossaryCategory::General,
                notes: None,
            })
        })
        .filter(|e| !e.source_term.is_empty() && !e.target_term.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::fixtures::{ScriptedLlmClient, ScriptedResponse};
    use tempfile::tempdir;

    fn config() -> GlossaryExtractorConfig {
        GlossaryExtractorConfig {
            batch_interval: Duration::from_millis(10),
            sample_size_chars: 100,
            sample_chapters: 2,
            min_entries: 1,
            max_entries: 10,
            wait_timeout: Duration::from_millis(200),
            scorer_rebuild_threshold: 2,
            random_sample: false,
            temperature: 0.2,
        }
    }

    #[test]
    fn parses_arrow_separated_candidates() {
        let response = "张三 -> Zhang San\n李四 -> Li Si\nmalformed line";
        let candidates = parse_candidates(response);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].source_term, "张三");
    }

    #[tokio::test]
    async fn initial_seed_waits_for_chapters_then_merges() {
        let dir = tempdir().unwrap();
        let glossary = Arc::new(GlossaryStore::load(dir.path()).unwrap());
        let scorer = Arc::new(TermScorer::new());
        let queue = Arc::new(GlossaryExtractorQueue::new());
        let llm = Arc::new(ScriptedLlmClient::new(vec![ScriptedResponse::Ok(
            "张三 -> Zhang San".to_string(),
        )]));
        let extractor = GlossaryExtractor::new(llm, glossary.clone(), scorer, queue.clone(), config());

        queue.push(1, "张三走进了房间。".to_string()).await;
        let cancel = CancellationToken::new();
        extractor.run_initial_seed(&cancel).await;

        let snapshot = glossary.snapshot().await;
        assert_eq!(snapshot.get("张三").unwrap().target_term, "Zhang San");
    }

    #[tokio::test]
    async fn initial_seed_times_out_with_no_chapters() {
        let dir = tempdir().unwrap();
        let glossary = Arc::new(GlossaryStore::load(dir.path()).unwrap());
        let scorer = Arc::new(TermScorer::new());
        let queue = Arc::new(GlossaryExtractorQueue::new());
        let llm = Arc::new(ScriptedLlmClient::echo());
        let extractor = GlossaryExtractor::new(llm, glossary, scorer, queue.clone(), config());

        let cancel = CancellationToken::new();
        let start = tokio::time::Instant::now();
        extractor.run_initial_seed(&cancel).await;
        assert!(start.elapsed() >= Duration::from_millis(150));

        queue.wait_for_seed(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn llm_failure_is_swallowed() {
        let dir = tempdir().unwrap();
        let glossary = Arc::new(GlossaryStore::load(dir.path()).unwrap());
        let scorer = Arc::new(TermScorer::new());
        let queue = Arc::new(GlossaryExtractorQueue::new());
        let llm = Arc::new(ScriptedLlmClient::new(vec![ScriptedResponse::Err]));
        let extractor = GlossaryExtractor::new(llm, glossary.clone(), scorer, queue.clone(), config());

        queue.push(1, "测试内容".to_string()).await;
        extractor.run_one_batch().await;

        assert_eq!(glossary.len().await, 0);
    }
}
