//! Streaming pipeline orchestrator: spawns the crawl producer, `workers` translator
//! consumers, the progressive glossary extractor, and a stats publisher, wires them
//! together through the unbounded handoff channel, and owns cancellation and the
//! `all_done` termination condition.
//!
//! Grounded on the teacher's `tasks.rs` long-lived-loop pattern (`check_new_chap_loop`,
//! `send_notifications_loop`: a `tokio::time::interval` driving a fallible batch of work,
//! errors logged and swallowed rather than propagated) generalized from a fixed polling
//! loop into a full producer/consumer/background-task pipeline with cooperative
//! cancellation via `tokio_util::sync::CancellationToken`, the concurrency primitive the
//! downloader and translation engine already use at their own suspension points.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::downloader::{Downloader, DownloaderConfig};
use crate::ebook::EbookAssembler;
use crate::error::TranslationError;
use crate::events::PipelineEvent;
use crate::fetcher::HttpFetcher;
use crate::glossary::GlossaryStore;
use crate::glossary_extractor::{GlossaryExtractor, GlossaryExtractorConfig, GlossaryExtractorQueue};
use crate::llm::LlmClient;
use crate::models::{ChapterRange, ChapterStatus, ChapterWorkItem, PipelineMode, PipelineResult};
use crate::patterns::{discover_book_metadata, discover_chapter_links, PatternAnalyzer};
use crate::progress_store::{self, raw_path, ProgressStore};
use crate::rate_limit::CrawlDelayLimiter;
use crate::style::StyleTemplate;
use crate::term_scorer::TermScorer;
use crate::translation::{TranslationEngine, TranslationEngineConfig};

/// Cadence for `Orchestrator::spawn_stats_publisher`'s progress snapshots, independent
/// of any work event so a stalled worker still shows up in the last published counts.
const STATS_PUBLISH_INTERVAL: Duration = Duration::from_secs(2);

/// The external collaborators the orchestrator depends on but does not implement
/// itself (see `PURPOSE & SCOPE`): a fetcher, one `LlmClient` per task the spec
/// distinguishes, a pattern analyzer, and an ebook assembler. Bundled behind `Arc<dyn _>`
/// so the CLI binary can construct one concrete set and hand it to any number of runs.
pub struct PipelineDeps {
    pub fetcher: Arc<dyn HttpFetcher>,
    pub pattern_analyzer: Arc<dyn PatternAnalyzer>,
    pub llm_crawl: Arc<dyn LlmClient>,
    pub llm_glossary: Arc<dyn LlmClient>,
    pub llm_translate: Arc<dyn LlmClient>,
    pub ebook_assembler: Arc<dyn EbookAssembler>,
}

pub struct RunRequest {
    pub book_dir: PathBuf,
    /// Required to open a brand new book (pattern discovery + chapter-list discovery);
    /// ignored (may be empty) when the book directory already has a `book.json`.
    pub source_url: Option<String>,
    pub mode: PipelineMode,
    pub range: ChapterRange,
    pub workers: usize,
    pub force: bool,
    pub style: StyleTemplate,
    pub cancel: CancellationToken,
    /// Progress events are pushed here if present; the CLI surface subscribes by
    /// passing a sender and draining the receiver on another task.
    pub events: Option<mpsc::UnboundedSender<PipelineEvent>>,
}

pub struct Orchestrator {
    config: Config,
    deps: PipelineDeps,
}

impl Orchestrator {
    pub fn new(config: Config, deps: PipelineDeps) -> Self {
        Orchestrator { config, deps }
    }

    #[tracing::instrument(name = "Running pipeline", skip(self, request), fields(book_dir = %request.book_dir.display(), mode = ?request.mode))]
    pub async fn run(&self, request: RunRequest) -> anyhow::Result<PipelineResult> {
        let RunRequest {
            book_dir,
            source_url,
            mode,
            range,
            workers,
            force,
            style,
            cancel,
            events,
        } = request;
        anyhow::ensure!(workers > 0, "workers must be positive");

        std::fs::create_dir_all(&book_dir)?;
        let mut progress = progress_store::load_or_create(&book_dir, source_url.as_deref().unwrap_or(""))?;
        let is_fresh_book = progress.chapters.is_empty();

        if is_fresh_book {
            let url = source_url
                .clone()
                .filter(|u| !u.is_empty())
                .ok_or_else(|| anyhow::anyhow!("a source_url is required to open a new book"))?;
            self.discover_book(&mut progress, &url).await?;
        }
        progress_store::save(&book_dir, &progress)?;

        let store = Arc::new(ProgressStore::new(book_dir.clone(), progress));
        let glossary = Arc::new(GlossaryStore::load(&book_dir)?);
        let scorer = Arc::new(TermScorer::new());
        let last_fit_version = Arc::new(AtomicU64::new(0));

        if is_fresh_book {
            self.translate_title(&store).await;
        }

        let (to_crawl, to_translate_initial) = {
            let snapshot = store.snapshot().await;
            compute_working_set(&snapshot, mode, range, force)
        };

        let translation_enabled = matches!(mode, PipelineMode::Full | PipelineMode::TranslateOnly);

        let (tx, rx) = mpsc::unbounded_channel::<ChapterWorkItem>();
        let extractor_queue = Arc::new(GlossaryExtractorQueue::new());

        for index in &to_translate_initial {
            let _ = tx.send(ChapterWorkItem {
                book_dir: book_dir.clone(),
                chapter_index: *index,
            });
            if let Some(chapter) = store.snapshot().await.chapter(*index) {
                if let Ok(text) = tokio::fs::read_to_string(raw_path(&book_dir, chapter)).await {
                    extractor_queue.push(*index, text).await;
                }
            }
        }

        let internal_stop = CancellationToken::new();

        let extractor_handle = if translation_enabled {
            Some(self.spawn_extractor(
                glossary.clone(),
                scorer.clone(),
                extractor_queue.clone(),
                events.clone(),
                cancel.clone(),
                internal_stop.clone(),
            ))
        } else {
            None
        };

        let stats_handle = self.spawn_stats_publisher(
            store.clone(),
            glossary.clone(),
            events.clone(),
            internal_stop.clone(),
        );
        let worker_tags: Arc<std::sync::Mutex<BTreeMap<u32, String>>> = Arc::new(std::sync::Mutex::new(
            (0..workers).map(|w| (w as u32, "idle".to_string())).collect(),
        ));

        let producer_handle = self.spawn_producer(
            store.clone(),
            to_crawl,
            tx,
            translation_enabled,
            extractor_queue.clone(),
            events.clone(),
            cancel.clone(),
        );

        let mut consumer_handles = Vec::with_capacity(workers);
        if translation_enabled {
            // Shared behind one mutex: every consumer locks it only for the instant it
            // takes to pull its next item, so contention stays low even with `workers`
            // tasks pulling from the same unbounded channel.
            let shared_rx = Arc::new(tokio::sync::Mutex::new(rx));
            for worker_id in 0..workers as u32 {
                consumer_handles.push(self.spawn_consumer(
                    worker_id,
                    shared_rx.clone(),
                    store.clone(),
                    glossary.clone(),
                    scorer.clone(),
                    last_fit_version.clone(),
                    extractor_queue.clone(),
                    worker_tags.clone(),
                    style.clone(),
                    events.clone(),
                    cancel.clone(),
                ));
            }
        }

        producer_handle.await??;
        for handle in consumer_handles {
            handle.await?;
        }

        internal_stop.cancel();
        if let Some(handle) = extractor_handle {
            handle.await?;
        }
        stats_handle.await?;

        let final_progress = store.snapshot().await;
        let cancelled = cancel.is_cancelled();
        let all_done = !cancelled && range_fully_done(&final_progress, mode, range);

        if let Some(tx) = &events {
            let _ = tx.send(PipelineEvent::Done { all_done, cancelled });
        }

        if all_done {
            if let Err(e) = self.assemble_ebook_if_possible(&book_dir, &final_progress).await {
                warn!(error = %e, "ebook assembly failed; translated chapters remain on disk");
            }
        }

        Ok(PipelineResult { all_done, cancelled })
    }

    async fn discover_book(&self, progress: &mut crate::models::BookProgress, url: &str) -> anyhow::Result<()> {
        let patterns = self.deps.pattern_analyzer.analyze(url).await?;
        let links = discover_chapter_links(
            self.deps.fetcher.as_ref(),
            url,
            &patterns.chapter_link_selector,
            Duration::from_secs(self.config.crawl_timeout_s),
        )
        .await?;

        let (title, author) = discover_book_metadata(
            self.deps.fetcher.as_ref(),
            url,
            &patterns,
            Duration::from_secs(self.config.crawl_timeout_s),
        )
        .await
        .unwrap_or_else(|e| {
            warn!(error = %e, "book title/author discovery failed; leaving fields empty");
            (String::new(), String::new())
        });

        progress.source_url = url.to_string();
        progress.title = title;
        progress.author = author;
        progress.patterns = Some(patterns);
        progress.chapters = links
            .into_iter()
            .map(|link| {
                let mut chapter = crate::models::Chapter::new(link.index);
                chapter.source_url = link.url;
                chapter.title_source = link.title;
                chapter
            })
            .collect();
        info!(chapter_count = progress.chapters.len(), "discovered chapter list for new book");
        Ok(())
    }

    /// Issues one LLM call (via the `translate` task's client) to translate the book's
    /// title and author. Best-effort: failure is logged and leaves the translated
    /// fields empty rather than failing the whole run over a single non-chapter call.
    async fn translate_title(&self, store: &ProgressStore) {
        let snapshot = store.snapshot().await;
        if snapshot.title.is_empty() && snapshot.author.is_empty() {
            return;
        }
        let prompt = format!("Title: {}\nAuthor: {}", snapshot.title, snapshot.author);
        match self
            .deps
            .llm_translate
            .complete(
                "Translate the following book title and author into the target language. \
                 Respond with exactly two lines: `Title: ...` then `Author: ...`.",
                &prompt,
                0.3,
            )
            .await
        {
            Ok(response) => {
                let (title, author) = parse_title_author(&response);
                if let Err(e) = store.set_title_translation(title, author).await {
                    warn!(error = %e, "failed to persist translated title/author");
                }
            }
            Err(e) => warn!(error = %e, "title/author translation failed; leaving fields empty"),
        }
    }

    fn spawn_producer(
        &self,
        store: Arc<ProgressStore>,
        to_crawl: Vec<u32>,
        tx: mpsc::UnboundedSender<ChapterWorkItem>,
        translation_enabled: bool,
        extractor_queue: Arc<GlossaryExtractorQueue>,
        events: Option<mpsc::UnboundedSender<PipelineEvent>>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        let fetcher = self.deps.fetcher.clone();
        let limiter = Arc::new(CrawlDelayLimiter::new(Duration::from_millis(self.config.crawl_delay_ms)));
        let downloader_config = DownloaderConfig {
            max_retries: self.config.crawl_max_retries,
            timeout: Duration::from_secs(self.config.crawl_timeout_s),
            base_backoff: Duration::from_millis(500),
        };
        let book_dir = store.book_dir().to_path_buf();

        tokio::spawn(async move {
            let downloader = ArcFetcherDownloader::new(fetcher, limiter, downloader_config);
            for index in to_crawl {
                if cancel.is_cancelled() {
                    info!("producer stopping on cancellation");
                    break;
                }
                let (url, patterns) = {
                    let snapshot = store.snapshot().await;
                    let chapter = match snapshot.chapter(index) {
                        Some(c) => c.clone(),
                        None => continue,
                    };
                    let patterns = match snapshot.patterns.clone() {
                        Some(p) => p,
                        None => {
                            warn!(index, "no discovered patterns; skipping chapter");
                            continue;
                        }
                    };
                    (chapter.source_url, patterns)
                };
                match downloader.download_chapter(&store, index, &url, &patterns, &cancel).await {
                    Ok(()) => {
                        if let Some(tx) = &events {
                            let title = store
                                .snapshot()
                                .await
                                .chapter(index)
                                .map(|c| c.title_source.clone())
                                .unwrap_or_default();
                            let _ = tx.send(PipelineEvent::ChapterCrawled { index, title_source: title });
                        }
                        if translation_enabled {
                            let _ = tx.send(ChapterWorkItem { book_dir: book_dir.clone(), chapter_index: index });
                            if let Ok(text) = tokio::fs::read_to_string(
                                store
                                    .snapshot()
                                    .await
                                    .chapter(index)
                                    .map(|c| raw_path(&book_dir, c))
                                    .unwrap_or_else(|| book_dir.join("raw").join(format!("{:04}.txt", index))),
                            )
                            .await
                            {
                                extractor_queue.push(index, text).await;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(index, error = %e, "chapter crawl failed permanently; continuing with next chapter");
                        if let Some(tx) = &events {
                            let _ = tx.send(PipelineEvent::ChapterError { index, reason: e.to_string() });
                        }
                    }
                }
            }
            // Dropping `tx` here (end of scope) closes the handoff channel so idle
            // consumers observe end-of-stream once it is drained.
            Ok(())
        })
    }

    /// One translator worker: pulls chapters off the shared receiver one at a time,
    /// translates each against `self.deps.llm_translate`, and publishes its own
    /// `worker.status` tag before and after every chapter (and every chunk within it).
    /// Exits once the channel is drained and closed, or immediately before picking up
    /// a new chapter if `cancel` has fired — the chapter already in flight is left to
    /// `TranslationEngine::translate_chapter`'s own cancellation checks.
    #[allow(clippy::too_many_arguments)]
    fn spawn_consumer(
        &self,
        worker_id: u32,
        rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<ChapterWorkItem>>>,
        store: Arc<ProgressStore>,
        glossary: Arc<GlossaryStore>,
        scorer: Arc<TermScorer>,
        last_fit_version: Arc<AtomicU64>,
        extractor_queue: Arc<GlossaryExtractorQueue>,
        worker_tags: Arc<std::sync::Mutex<BTreeMap<u32, String>>>,
        style: StyleTemplate,
        events: Option<mpsc::UnboundedSender<PipelineEvent>>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let llm = self.deps.llm_translate.clone();
        let config = self.config.clone();
        let rebuild_threshold = self.config.glossary_scorer_rebuild_threshold;
        let seed_wait_timeout = Duration::from_secs(self.config.glossary_wait_timeout_s);

        tokio::spawn(async move {
            // Every worker waits on the same readiness gate before touching its first
            // chapter; `wait_for_seed` returns immediately once seeding has already
            // happened (or timed out) for any earlier worker, so this costs nothing
            // after the first call.
            set_worker_tag(&worker_tags, &events, worker_id, "waiting for glossary seed".to_string());
            tokio::select! {
                _ = extractor_queue.wait_for_seed(seed_wait_timeout) => {}
                _ = cancel.cancelled() => {}
            }
            set_worker_tag(&worker_tags, &events, worker_id, "idle".to_string());

            loop {
                if cancel.is_cancelled() {
                    info!(worker_id, "consumer stopping on cancellation");
                    break;
                }
                let item = {
                    let mut guard = rx.lock().await;
                    guard.recv().await
                };
                let item = match item {
                    Some(item) => item,
                    None => break,
                };
                let index = item.chapter_index;
                set_worker_tag(&worker_tags, &events, worker_id, format!("translating chapter {}", index));

                maybe_rebuild_scorer(&store, &glossary, &scorer, &last_fit_version, rebuild_threshold).await;

                let chunk_total = {
                    let snapshot = store.snapshot().await;
                    match snapshot.chapter(index) {
                        Some(chapter) => tokio::fs::read_to_string(raw_path(store.book_dir(), chapter))
                            .await
                            .map(|text| crate::chunker::chunk_text(&text, config.chunk_size).len())
                            .unwrap_or(0),
                        None => 0,
                    }
                };

                let worker_tags_progress = worker_tags.clone();
                let events_progress = events.clone();
                let engine = TranslationEngine::new(
                    llm.as_ref(),
                    glossary.as_ref(),
                    scorer.as_ref(),
                    TranslationEngineConfig::from_config(&config),
                )
                .with_style(style.clone())
                .with_chunk_progress(move |k, n| {
                    set_worker_tag(
                        &worker_tags_progress,
                        &events_progress,
                        worker_id,
                        format!("translating chunk {}/{} of chapter {}", k, n, index),
                    );
                });

                match engine.translate_chapter(&store, index, &cancel).await {
                    Ok(()) => {
                        if let Some(tx) = &events {
                            let _ = tx.send(PipelineEvent::ChapterTranslated { index, chunk_count: chunk_total });
                        }
                    }
                    Err(TranslationError::Cancelled) => {
                        if let Some(tx) = &events {
                            let _ = tx.send(PipelineEvent::ChapterError { index, reason: "cancelled".to_string() });
                        }
                    }
                    Err(e) => {
                        let reason = e.to_string();
                        if let Err(store_err) = store
                            .update_chapter(index, |c| {
                                c.status = ChapterStatus::Error;
                                c.last_error = Some(reason.clone());
                            })
                            .await
                        {
                            warn!(index, error = %store_err, "failed to persist chapter error status");
                        }
                        if let Some(tx) = &events {
                            let _ = tx.send(PipelineEvent::ChapterError { index, reason });
                        }
                    }
                }

                set_worker_tag(&worker_tags, &events, worker_id, "idle".to_string());
            }
        })
    }

    /// Spawns the background glossary extractor, stopping it on whichever of `cancel`
    /// (user cancellation) or `internal_stop` (producer and consumers have finished)
    /// fires first.
    fn spawn_extractor(
        &self,
        glossary: Arc<GlossaryStore>,
        scorer: Arc<TermScorer>,
        queue: Arc<GlossaryExtractorQueue>,
        events: Option<mpsc::UnboundedSender<PipelineEvent>>,
        cancel: CancellationToken,
        internal_stop: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let llm = self.deps.llm_glossary.clone();
        let temperature = self.config.llm.resolve_glossary().temperature.unwrap_or(0.2);
        let config = GlossaryExtractorConfig {
            batch_interval: Duration::from_secs(self.config.glossary_batch_interval_s),
            sample_size_chars: self.config.glossary_sample_size,
            sample_chapters: self.config.glossary_sample_chapters,
            min_entries: self.config.glossary_min_entries,
            max_entries: self.config.glossary_max_entries,
            wait_timeout: Duration::from_secs(self.config.glossary_wait_timeout_s),
            scorer_rebuild_threshold: self.config.glossary_scorer_rebuild_threshold,
            random_sample: self.config.glossary_random_sample,
            temperature,
        };

        let stop_token = CancellationToken::new();
        let stop_token_signal = stop_token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = internal_stop.cancelled() => {}
            }
            stop_token_signal.cancel();
        });

        tokio::spawn(async move {
            let mut extractor = GlossaryExtractor::new(llm, glossary, scorer, queue, config);
            if let Some(tx) = events {
                extractor = extractor.with_events(tx);
            }
            extractor.run(stop_token).await;
        })
    }

    /// Publishes a `PipelineEvent::Progress` snapshot at a fixed cadence, independent of
    /// work events, until `stop` fires.
    fn spawn_stats_publisher(
        &self,
        store: Arc<ProgressStore>,
        glossary: Arc<GlossaryStore>,
        events: Option<mpsc::UnboundedSender<PipelineEvent>>,
        stop: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATS_PUBLISH_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let Some(tx) = events.as_ref() else { continue };
                        let snapshot = store.snapshot().await;
                        let mut pending = 0usize;
                        let mut crawled = 0usize;
                        let mut translated = 0usize;
                        let mut error = 0usize;
                        for chapter in &snapshot.chapters {
                            match chapter.status {
                                ChapterStatus::Pending => pending += 1,
                                ChapterStatus::Crawled => crawled += 1,
                                ChapterStatus::Translated => translated += 1,
                                ChapterStatus::Error => error += 1,
                            }
                        }
                        let glossary_entry_count = glossary.len().await;
                        let _ = tx.send(PipelineEvent::Progress {
                            pending,
                            crawled,
                            translated,
                            error,
                            glossary_entry_count,
                        });
                    }
                    _ = stop.cancelled() => {
                        info!("stats publisher stopping");
                        return;
                    }
                }
            }
        })
    }

    /// Writes the finished book to `book_dir/book.epub`. Only called once `all_done`,
    /// so every chapter in `progress` is TRANSLATED.
    async fn assemble_ebook_if_possible(
        &self,
        book_dir: &Path,
        progress: &crate::models::BookProgress,
    ) -> anyhow::Result<()> {
        let bytes = self.deps.ebook_assembler.assemble_epub(book_dir, progress).await?;
        let out_path = book_dir.join("book.epub");
        tokio::fs::write(&out_path, &bytes).await?;
        info!(path = %out_path.display(), "assembled epub from translated chapters");
        Ok(())
    }
}

fn set_worker_tag(
    worker_tags: &Arc<std::sync::Mutex<BTreeMap<u32, String>>>,
    events: &Option<mpsc::UnboundedSender<PipelineEvent>>,
    worker_id: u32,
    tag: String,
) {
    worker_tags.lock().unwrap().insert(worker_id, tag.clone());
    if let Some(tx) = events {
        let _ = tx.send(PipelineEvent::WorkerStatus { worker_id, tag });
    }
}

/// Opportunistically rescoring before a worker starts its next chapter keeps glossary
/// ranking fresh without a dedicated poller. The corpus is every non-pending chapter's
/// source text already on disk, not the glossary entries themselves.
async fn maybe_rebuild_scorer(
    store: &ProgressStore,
    glossary: &GlossaryStore,
    scorer: &TermScorer,
    last_fit_version: &AtomicU64,
    threshold: u64,
) {
    let version = glossary.version();
    if version.saturating_sub(last_fit_version.load(Ordering::Acquire)) < threshold {
        return;
    }
    let snapshot = store.snapshot().await;
    let book_dir = store.book_dir();
    let mut documents = Vec::with_capacity(snapshot.chapters.len());
    for chapter in &snapshot.chapters {
        if chapter.status == ChapterStatus::Pending {
            continue;
        }
        if let Ok(text) = tokio::fs::read_to_string(raw_path(book_dir, chapter)).await {
            documents.push(text);
        }
    }
    if documents.is_empty() {
        return;
    }
    let terms: Vec<String> = glossary.snapshot().await.into_keys().collect();
    scorer.rebuild(&documents, &terms);
    last_fit_version.store(version, Ordering::Release);
}

/// Placeholder that keeps type inference simple; replaced below by a free function
/// because `LlmClient` is behind `Arc<dyn LlmClient>` in `PipelineDeps`, not a generic
/// parameter, and trait methods can't be generic over `dyn` without a second hop.
struct ArcFetcherDownloader {
    inner: Downloader<DynFetcher>,
}

impl ArcFetcherDownloader {
    fn new(fetcher: Arc<dyn HttpFetcher>, limiter: Arc<CrawlDelayLimiter>, config: DownloaderConfig) -> Self {
        ArcFetcherDownloader {
            inner: Downloader::new(DynFetcher(fetcher), (*limiter).clone_handle(), config),
        }
    }

    async fn download_chapter(
        &self,
        store: &ProgressStore,
        chapter_index: u32,
        chapter_url: &str,
        patterns: &crate::models::PatternRecord,
        cancel: &CancellationToken,
    ) -> Result<(), crate::error::DownloaderError> {
        self.inner
            .download_chapter(store, chapter_index, chapter_url, patterns, cancel)
            .await
    }
}

struct DynFetcher(Arc<dyn HttpFetcher>);

#[async_trait::async_trait]
impl HttpFetcher for DynFetcher {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<crate::fetcher::FetchedPage, crate::error::FetchError> {
        self.0.fetch(url, timeout).await
    }
}

fn parse_title_author(response: &str) -> (String, String) {
    let mut title = String::new();
    let mut author = String::new();
    for line in response.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("Title:") {
            title = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("Author:") {
            author = rest.trim().to_string();
        }
    }
    (title, author)
}

/// Computes the crawl and translate working sets per §4.8 step 2.
fn compute_working_set(
    progress: &crate::models::BookProgress,
    mode: PipelineMode,
    range: ChapterRange,
    force: bool,
) -> (Vec<u32>, Vec<u32>) {
    let in_range: Vec<&crate::models::Chapter> =
        progress.chapters.iter().filter(|c| range.contains(c.index)).collect();

    let to_crawl = match mode {
        PipelineMode::TranslateOnly => Vec::new(),
        PipelineMode::Full | PipelineMode::CrawlOnly => {
            if force {
                in_range.iter().map(|c| c.index).collect()
            } else {
                in_range
                    .iter()
                    .filter(|c| c.status == ChapterStatus::Pending)
                    .map(|c| c.index)
                    .collect()
            }
        }
    };

    let to_translate = match mode {
        PipelineMode::CrawlOnly => Vec::new(),
        PipelineMode::Full | PipelineMode::TranslateOnly => {
            if force {
                in_range
                    .iter()
                    .filter(|c| c.status != ChapterStatus::Pending)
                    .map(|c| c.index)
                    .collect()
            } else {
                in_range
                    .iter()
                    .filter(|c| c.status == ChapterStatus::Crawled)
                    .map(|c| c.index)
                    .collect()
            }
        }
    };

    // A chapter about to be freshly crawled this run is enqueued by the producer on
    // success, not pre-enqueued here, so drop any overlap to avoid double-processing.
    let to_crawl_set: std::collections::HashSet<u32> = to_crawl.iter().copied().collect();
    let to_translate = to_translate.into_iter().filter(|i| !to_crawl_set.contains(i)).collect();

    (to_crawl, to_translate)
}

fn range_fully_done(progress: &crate::models::BookProgress, mode: PipelineMode, range: ChapterRange) -> bool {
    let terminal = if mode == PipelineMode::CrawlOnly {
        ChapterStatus::Crawled
    } else {
        ChapterStatus::Translated
    };
    progress
        .chapters
        .iter()
        .filter(|c| range.contains(c.index))
        .all(|c| c.status == terminal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BookProgress, Chapter};

    fn progress_with(statuses: &[ChapterStatus]) -> BookProgress {
        let mut progress = BookProgress::new("https://example.com/book".into());
        for (i, status) in statuses.iter().enumerate() {
            let mut chapter = Chapter::new((i + 1) as u32);
            chapter.status = *status;
            progress.chapters.push(chapter);
        }
        progress
    }

    #[test]
    fn full_mode_splits_pending_and_crawled() {
        let progress = progress_with(&[ChapterStatus::Pending, ChapterStatus::Crawled, ChapterStatus::Translated]);
        let (to_crawl, to_translate) = compute_working_set(&progress, PipelineMode::Full, ChapterRange::default(), false);
        assert_eq!(to_crawl, vec![1]);
        assert_eq!(to_translate, vec![2]);
    }

    #[test]
    fn force_resets_full_mode_to_entire_range() {
        let progress = progress_with(&[ChapterStatus::Translated, ChapterStatus::Translated]);
        let (to_crawl, to_translate) = compute_working_set(&progress, PipelineMode::Full, ChapterRange::default(), true);
        assert_eq!(to_crawl, vec![1, 2]);
        // Both chapters are about to be re-crawled this run, so they are not
        // pre-enqueued for translation; the producer re-enqueues them on success.
        assert!(to_translate.is_empty());
    }

    #[test]
    fn crawl_only_never_populates_translate_set() {
        let progress = progress_with(&[ChapterStatus::Pending, ChapterStatus::Crawled]);
        let (to_crawl, to_translate) = compute_working_set(&progress, PipelineMode::CrawlOnly, ChapterRange::default(), false);
        assert_eq!(to_crawl, vec![1]);
        assert!(to_translate.is_empty());
    }

    #[test]
    fn translate_only_never_populates_crawl_set() {
        let progress = progress_with(&[ChapterStatus::Pending, ChapterStatus::Crawled]);
        let (to_crawl, to_translate) = compute_working_set(&progress, PipelineMode::TranslateOnly, ChapterRange::default(), false);
        assert!(to_crawl.is_empty());
        assert_eq!(to_translate, vec![2]);
    }

    #[test]
    fn range_fully_done_checks_translated_by_default() {
        let progress = progress_with(&[ChapterStatus::Translated, ChapterStatus::Translated]);
        assert!(range_fully_done(&progress, PipelineMode::Full, ChapterRange::default()));
        let partial = progress_with(&[ChapterStatus::Translated, ChapterStatus::Crawled]);
        assert!(!range_fully_done(&partial, PipelineMode::Full, ChapterRange::default()));
    }

    #[test]
    fn range_fully_done_checks_crawled_for_crawl_only() {
        let progress = progress_with(&[ChapterStatus::Crawled]);
        assert!(range_fully_done(&progress, PipelineMode::CrawlOnly, ChapterRange::default()));
    }

    #[test]
    fn parses_title_and_author_lines() {
        let (title, author) = parse_title_author("Title: The Sword\nAuthor: Someone\nextra line");
        assert_eq!(title, "The Sword");
        assert_eq!(author, "Someone");
    }
}
