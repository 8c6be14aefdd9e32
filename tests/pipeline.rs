//! End-to-end scenarios driving `Orchestrator::run` against fixture HTTP and LLM
//! backends instead of live network/LLM calls. Mirrors the teacher's own preference for
//! exercising whole call chains over a fixture transport rather than mocking individual
//! collaborators.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use noveldich::config::Config;
use noveldich::ebook::DefaultEbookAssembler;
use noveldich::fetcher::fixtures::FixtureFetcher;
use noveldich::fetcher::HttpFetcher;
use noveldich::glossary::GlossaryStore;
use noveldich::llm::fixtures::{ScriptedLlmClient, ScriptedResponse};
use noveldich::llm::LlmClient;
use noveldich::models::{Chapter, ChapterRange, ChapterStatus, PipelineMode};
use noveldich::orchestrator::{Orchestrator, PipelineDeps, RunRequest};
use noveldich::patterns::HeuristicPatternAnalyzer;
use noveldich::progress_store::{self, raw_path, translated_path};
use noveldich::style::StyleTemplate;

const INDEX_URL: &str = "https://example.com/book";

/// Builds an index page linking three chapters, plus the three chapter pages
/// themselves, each with `total_chars / 100` one-hundred-character `<p>` paragraphs so
/// the chunker's char-accumulation produces a predictable chunk count.
fn seed_fetcher(chapter_chars: &[usize]) -> FixtureFetcher {
    let mut links = String::new();
    for i in 1..=chapter_chars.len() {
        links.push_str(&format!(r#"<a href="https://example.com/book/c/{i}">Chapter {i}</a>"#));
    }
    let index_html = format!(
        r#"<html><body><div class="chapter-list">{links}</div></body></html>"#
    );

    let mut fetcher = FixtureFetcher::new().with_page(INDEX_URL, index_html.into_bytes(), Some("utf-8"));
    for (i, &chars) in chapter_chars.iter().enumerate() {
        let url = format!("https://example.com/book/c/{}", i + 1);
        fetcher = fetcher.with_page(&url, chapter_html(i + 1, chars).into_bytes(), Some("utf-8"));
    }
    fetcher
}

fn chapter_html(index: usize, total_chars: usize) -> String {
    const PARAGRAPH_LEN: usize = 100;
    let mut body = String::new();
    let mut written = 0;
    while written < total_chars {
        let this_len = PARAGRAPH_LEN.min(total_chars - written);
        body.push_str("<p>");
        body.push_str(&"文".repeat(this_len));
        body.push_str("</p>");
        written += this_len;
    }
    format!(
        r#"<html><body><h1>Chapter {index}</h1><div class="chapter-content">{body}</div></body></html>"#
    )
}

fn raw_text(total_chars: usize) -> String {
    const PARAGRAPH_LEN: usize = 100;
    let mut written = 0;
    let mut lines = Vec::new();
    while written < total_chars {
        let this_len = PARAGRAPH_LEN.min(total_chars - written);
        lines.push("文".repeat(this_len));
        written += this_len;
    }
    lines.join("\n")
}

fn deps(fetcher: Arc<dyn HttpFetcher>, llm_translate: Arc<dyn LlmClient>) -> PipelineDeps {
    let pattern_analyzer = Arc::new(HeuristicPatternAnalyzer::new(fetcher.clone(), Duration::from_secs(5)));
    PipelineDeps {
        fetcher,
        pattern_analyzer,
        llm_crawl: Arc::new(ScriptedLlmClient::echo()),
        llm_glossary: Arc::new(ScriptedLlmClient::echo()),
        llm_translate,
        ebook_assembler: Arc::new(DefaultEbookAssembler),
    }
}

fn fast_config() -> Config {
    Config {
        chunk_size: 2000,
        glossary_min_entries: 1,
        glossary_max_entries: 5,
        glossary_sample_chapters: 1,
        glossary_sample_size: 500,
        glossary_wait_timeout_s: 1,
        glossary_batch_interval_s: 1,
        crawl_delay_ms: 0,
        ..Config::default()
    }
}

fn run_request(book_dir: PathBuf, mode: PipelineMode, workers: usize, force: bool, cancel: CancellationToken) -> RunRequest {
    RunRequest {
        book_dir,
        source_url: Some(INDEX_URL.to_string()),
        mode,
        range: ChapterRange::default(),
        workers,
        force,
        style: StyleTemplate::default(),
        cancel,
        events: None,
    }
}

/// S1: a fresh three-chapter book runs end to end — crawl, chunk, translate, assemble —
/// with the chunk counts (2, 1, 2) that 2000-char chunking over 2500/1800/3500 chars of
/// 100-char paragraphs produces.
#[tokio::test]
async fn fresh_book_completes_full_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher: Arc<dyn HttpFetcher> = Arc::new(seed_fetcher(&[2500, 1800, 3500]));
    let llm = Arc::new(ScriptedLlmClient::echo());
    let orchestrator = Orchestrator::new(fast_config(), deps(fetcher, llm.clone()));

    let result = orchestrator
        .run(run_request(dir.path().to_path_buf(), PipelineMode::Full, 1, false, CancellationToken::new()))
        .await
        .unwrap();

    assert!(result.all_done);
    assert!(!result.cancelled);

    let progress = progress_store::load(dir.path()).unwrap();
    assert_eq!(progress.chapters.len(), 3);
    for chapter in &progress.chapters {
        assert_eq!(chapter.status, ChapterStatus::Translated, "chapter {} not translated", chapter.index);
        let translated = std::fs::read_to_string(translated_path(dir.path(), chapter)).unwrap();
        assert!(!translated.is_empty());
    }

    // 2000-char chunking over 2500/1800/3500 chars of 100-char paragraphs: 2 + 1 + 2 = 5.
    assert_eq!(llm.call_count(), 5);
    assert!(dir.path().join("book.epub").exists());
}

/// S2: resuming a book whose first two chapters are already TRANSLATED only translates
/// the remaining CRAWLED chapter, never re-touching the finished ones.
#[tokio::test]
async fn resumes_after_crash_translating_only_remaining_chapters() {
    let dir = tempfile::tempdir().unwrap();
    let mut progress = noveldich::models::BookProgress::new(INDEX_URL.to_string());
    progress.patterns = Some(noveldich::models::PatternRecord {
        chapter_link_selector: ".chapter-list a".into(),
        content_selector: ".chapter-content".into(),
        title_selector: Some("h1".into()),
        book_title_selector: None,
        book_author_selector: None,
    });

    let chapter_chars = [2500usize, 1800, 3500];
    for i in 0..chapter_chars.len() {
        let mut chapter = Chapter::new((i + 1) as u32);
        chapter.source_url = format!("https://example.com/book/c/{}", i + 1);
        chapter.status = if i < 2 { ChapterStatus::Translated } else { ChapterStatus::Crawled };
        progress.chapters.push(chapter);
    }
    progress_store::save(dir.path(), &progress).unwrap();

    for (i, &chars) in chapter_chars.iter().enumerate() {
        let chapter = progress.chapter((i + 1) as u32).unwrap();
        std::fs::write(raw_path(dir.path(), chapter), raw_text(chars)).unwrap();
        if i < 2 {
            std::fs::write(translated_path(dir.path(), chapter), raw_text(chars)).unwrap();
        }
    }

    let fetcher: Arc<dyn HttpFetcher> = Arc::new(seed_fetcher(&chapter_chars));
    let llm = Arc::new(ScriptedLlmClient::echo());
    let orchestrator = Orchestrator::new(fast_config(), deps(fetcher, llm.clone()));

    let result = orchestrator
        .run(run_request(dir.path().to_path_buf(), PipelineMode::TranslateOnly, 1, false, CancellationToken::new()))
        .await
        .unwrap();

    assert!(result.all_done);
    // Only chapter 3 (2 chunks over 3500 chars) needed translating.
    assert_eq!(llm.call_count(), 2);

    let reloaded = progress_store::load(dir.path()).unwrap();
    for chapter in &reloaded.chapters {
        assert_eq!(chapter.status, ChapterStatus::Translated);
    }
}

/// S3: cancelling mid-run lets the chapter already in flight finish, marks the chapter
/// whose turn is interrupted as an `Error("cancelled")`, and never starts the chapter
/// behind it.
#[tokio::test]
async fn cancellation_mid_run_stops_remaining_work() {
    struct CancelAfterN {
        inner: ScriptedLlmClient,
        threshold: usize,
        cancel: CancellationToken,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl LlmClient for CancelAfterN {
        async fn complete(
            &self,
            system_prompt: &str,
            user_prompt: &str,
            temperature: f32,
        ) -> Result<String, noveldich::error::LlmError> {
            let result = self.inner.complete(system_prompt, user_prompt, temperature).await;
            if self.calls.fetch_add(1, Ordering::AcqRel) + 1 >= self.threshold {
                self.cancel.cancel();
            }
            result
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let chapter_chars = [2500usize, 1800, 3500];
    let fetcher: Arc<dyn HttpFetcher> = Arc::new(seed_fetcher(&chapter_chars));
    let cancel = CancellationToken::new();
    // Chapter 1 needs 2 chunk calls; cancel right after it finishes so chapter 2 never
    // starts its own chunk.
    let llm: Arc<dyn LlmClient> = Arc::new(CancelAfterN {
        inner: ScriptedLlmClient::echo(),
        threshold: 2,
        cancel: cancel.clone(),
        calls: AtomicUsize::new(0),
    });
    let orchestrator = Orchestrator::new(fast_config(), deps(fetcher, llm));

    let result = orchestrator
        .run(run_request(dir.path().to_path_buf(), PipelineMode::Full, 1, false, cancel))
        .await
        .unwrap();

    assert!(result.cancelled);
    assert!(!result.all_done);

    let progress = progress_store::load(dir.path()).unwrap();
    assert_eq!(progress.chapter(1).unwrap().status, ChapterStatus::Translated);
    // Chapter 2 was either never picked up or interrupted mid-flight; either way it
    // never reaches TRANSLATED.
    assert_ne!(progress.chapter(2).unwrap().status, ChapterStatus::Translated);
    assert_ne!(progress.chapter(3).unwrap().status, ChapterStatus::Translated);
}

/// S4: the LLM fails the first two calls with a retryable error; the translation
/// engine's own retry/backoff recovers without any chapter ending in `Error`.
#[tokio::test]
async fn transient_llm_failures_recover_via_retry() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher: Arc<dyn HttpFetcher> = Arc::new(seed_fetcher(&[2500, 1800, 3500]));
    let llm = Arc::new(ScriptedLlmClient::new(vec![ScriptedResponse::Err, ScriptedResponse::Err]));
    let mut config = fast_config();
    config.crawl_max_retries = 5; // translation engine reuses this as its retry budget
    let orchestrator = Orchestrator::new(config, deps(fetcher, llm.clone()));

    let result = orchestrator
        .run(run_request(dir.path().to_path_buf(), PipelineMode::Full, 1, false, CancellationToken::new()))
        .await
        .unwrap();

    assert!(result.all_done);
    let progress = progress_store::load(dir.path()).unwrap();
    for chapter in &progress.chapters {
        assert_eq!(chapter.status, ChapterStatus::Translated);
        assert!(chapter.last_error.is_none());
    }
    assert!(llm.call_count() > 5, "expected at least two retried calls on top of the five chunks");
}

/// S5: four workers pulling from the same glossary concurrently never corrupt it — the
/// version counter only ever moves forward and the persisted CSV matches the in-memory
/// snapshot once the run settles.
#[tokio::test]
async fn concurrent_workers_keep_glossary_consistent() {
    let dir = tempfile::tempdir().unwrap();
    let chapter_chars = [2500usize, 1800, 3500, 1200, 2200];
    let fetcher: Arc<dyn HttpFetcher> = Arc::new(seed_fetcher(&chapter_chars));
    let llm_translate = Arc::new(ScriptedLlmClient::echo());
    let mut pdeps = deps(fetcher, llm_translate);
    // A glossary LLM that always proposes the same candidate pair keeps the extractor
    // productive across every batch without needing scripted call-count bookkeeping.
    pdeps.llm_glossary = Arc::new(ScriptedLlmClient::new(
        std::iter::repeat_with(|| ScriptedResponse::Ok("文 -> word".to_string()))
            .take(32)
            .collect(),
    ));
    let orchestrator = Orchestrator::new(fast_config(), pdeps);

    let result = orchestrator
        .run(run_request(dir.path().to_path_buf(), PipelineMode::Full, 4, false, CancellationToken::new()))
        .await
        .unwrap();

    assert!(result.all_done);

    let glossary = GlossaryStore::load(dir.path()).unwrap();
    let snapshot = glossary.snapshot().await;
    // The persisted CSV must agree with what's in memory at the end of the run.
    let reloaded = GlossaryStore::load(dir.path()).unwrap();
    assert_eq!(reloaded.snapshot().await.len(), snapshot.len());
    assert!(glossary.version() >= snapshot.len() as u64 || snapshot.is_empty());
}

/// S6: `force` on an already-fully-translated book re-crawls and re-translates every
/// chapter in range rather than treating it as a no-op.
#[tokio::test]
async fn force_replays_already_translated_chapters() {
    let dir = tempfile::tempdir().unwrap();
    let chapter_chars = [2500usize, 1800, 3500];
    let fetcher: Arc<dyn HttpFetcher> = Arc::new(seed_fetcher(&chapter_chars));
    let llm = Arc::new(ScriptedLlmClient::echo());
    let orchestrator = Orchestrator::new(fast_config(), deps(fetcher.clone(), llm.clone()));

    orchestrator
        .run(run_request(dir.path().to_path_buf(), PipelineMode::Full, 1, false, CancellationToken::new()))
        .await
        .unwrap();
    let calls_after_first_run = llm.call_count();
    assert_eq!(calls_after_first_run, 5);

    // A non-forced second run would add zero further chunk calls — everything is
    // already TRANSLATED.
    let orchestrator = Orchestrator::new(fast_config(), deps(fetcher.clone(), llm.clone()));
    orchestrator
        .run(run_request(dir.path().to_path_buf(), PipelineMode::Full, 1, false, CancellationToken::new()))
        .await
        .unwrap();
    assert_eq!(llm.call_count(), calls_after_first_run);

    // A forced run re-translates every chapter, adding the same five chunk calls again.
    let orchestrator = Orchestrator::new(fast_config(), deps(fetcher, llm.clone()));
    let result = orchestrator
        .run(run_request(dir.path().to_path_buf(), PipelineMode::Full, 1, true, CancellationToken::new()))
        .await
        .unwrap();

    assert!(result.all_done);
    assert_eq!(llm.call_count(), calls_after_first_run * 2);

    let progress = progress_store::load(dir.path()).unwrap();
    for chapter in &progress.chapters {
        assert_eq!(chapter.status, ChapterStatus::Translated);
    }
}
