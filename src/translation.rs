//! Per-chapter translation engine: chunks a crawled chapter, translates each chunk
//! sequentially with a carried trailing-context tail, optionally polishes the draft,
//! writes the translated file, and advances the chapter to TRANSLATED.
//!
//! Grounded on the teacher's sequential per-chapter conversion flow in
//! `calibre::generate_mobi` (one unit of work fully handled, retried, and persisted
//! before moving to the next) and on the pack's `pdftrans` chunk-context-carry pattern.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::chunker::chunk_text;
use crate::config::Config;
use crate::error::{LlmError, TranslationError};
use crate::glossary::GlossaryStore;
use crate::llm::LlmClient;
use crate::models::{Chapter, ChapterStatus};
use crate::progress_store::{raw_path, translated_path, ProgressStore};
use crate::style::StyleTemplate;
use crate::term_scorer::TermScorer;

/// A chunk response shorter than this fraction of the source chunk's length is treated
/// as a likely truncation and retried once before being accepted as-is.
const SHORT_RESPONSE_RATIO: f64 = 0.10;

pub struct TranslationEngineConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub temperature: f32,
    pub enable_polish_pass: bool,
    pub polish_temperature: f32,
    pub polish_max_retries: u32,
    pub max_glossary_entries: usize,
    pub min_glossary_entries: usize,
}

impl TranslationEngineConfig {
    pub fn from_config(config: &Config) -> Self {
        TranslationEngineConfig {
            chunk_size: config.chunk_size,
            chunk_overlap: config.chunk_overlap,
            max_retries: config.crawl_max_retries,
            base_backoff: Duration::from_millis(500),
            temperature: config.llm.resolve_translate().temperature.unwrap_or(0.7),
            enable_polish_pass: config.enable_polish_pass,
            polish_temperature: config.polish_temperature,
            polish_max_retries: config.polish_max_retries,
            max_glossary_entries: config.glossary_max_entries,
            min_glossary_entries: config.glossary_min_entries,
        }
    }
}

pub struct TranslationEngine<'a, L: LlmClient + ?Sized> {
    llm: &'a L,
    glossary: &'a GlossaryStore,
    scorer: &'a TermScorer,
    config: TranslationEngineConfig,
    style: StyleTemplate,
    /// Invoked as `(chunk_index_1_based, total_chunks)` before each chunk is sent to the
    /// LLM, so a caller can publish a `"translating chunk k/n of chapter X"` worker
    /// status tag. `None` by default; existing callers that never set one see no change
    /// in behavior.
    chunk_progress: Option<Box<dyn Fn(usize, usize) + Send + Sync>>,
}

impl<'a, L: LlmClient + ?Sized> TranslationEngine<'a, L> {
    pub fn new(
        llm: &'a L,
        glossary: &'a GlossaryStore,
        scorer: &'a TermScorer,
        config: TranslationEngineConfig,
    ) -> Self {
        TranslationEngine {
            llm,
            glossary,
            scorer,
            config,
            style: StyleTemplate::default(),
            chunk_progress: None,
        }
    }

    pub fn with_style(mut self, style: StyleTemplate) -> Self {
        self.style = style;
        self
    }

    pub fn with_chunk_progress(mut self, sink: impl Fn(usize, usize) + Send + Sync + 'static) -> Self {
        self.chunk_progress = Some(Box::new(sink));
        self
    }

    #[tracing::instrument(name = "Translating chapter", skip(self, store, cancel), fields(chapter_index = chapter_index))]
    pub async fn translate_chapter(
        &self,
        store: &ProgressStore,
        chapter_index: u32,
        cancel: &CancellationToken,
    ) -> Result<(), TranslationError> {
        let book_dir = store.book_dir().to_path_buf();
        let chapter = store
            .snapshot()
            .await
            .chapter(chapter_index)
            .cloned()
            .ok_or(TranslationError::Progress(
                crate::error::ProgressStoreError::ChapterNotFound(chapter_index as usize),
            ))?;

        let source_text = tokio::fs::read_to_string(raw_path(&book_dir, &chapter))
            .await
            .map_err(|e| TranslationError::Io(e.to_string()))?;

        if cancel.is_cancelled() {
            self.mark_cancelled(store, chapter_index).await?;
            return Err(TranslationError::Cancelled);
        }

        let chunks = chunk_text(&source_text, self.config.chunk_size);
        let mut translated_chunks = Vec::with_capacity(chunks.len());
        let mut prior_output_tail = String::new();

        for (i, chunk) in chunks.iter().enumerate() {
            if cancel.is_cancelled() {
                self.mark_cancelled(store, chapter_index).await?;
                return Err(TranslationError::Cancelled);
            }
            if let Some(sink) = &self.chunk_progress {
                sink(i + 1, chunks.len());
            }
            let translated = self
                .translate_one_chunk(chunk, &prior_output_tail, cancel)
                .await?;
            prior_output_tail = tail(&translated, self.config.chunk_overlap);
            translated_chunks.push(translated);
        }

        let draft = translated_chunks.join("\n\n");

        let final_text = if self.config.enable_polish_pass {
            match self.polish(&source_text, &draft, cancel).await {
                PolishOutcome::Polished(text) => text,
                PolishOutcome::CancelledBeforeStart => {
                    self.mark_cancelled(store, chapter_index).await?;
                    return Err(TranslationError::Cancelled);
                }
                PolishOutcome::FellBackToDraft => draft,
            }
        } else {
            draft
        };

        self.write_and_mark_translated(store, &book_dir, chapter_index, &final_text)
            .await?;
        info!(chapter_index, "chapter translated");
        Ok(())
    }

    async fn translate_one_chunk(
        &self,
        chunk: &str,
        prior_output_tail: &str,
        cancel: &CancellationToken,
    ) -> Result<String, TranslationError> {
        let glossary_excerpt = self.format_relevant_excerpt(chunk).await;
        let system_prompt = self.system_prompt();
        let user_prompt = self.user_prompt(&glossary_excerpt, prior_output_tail, chunk);

        let mut attempt = 0;
        let mut soft_retried = false;
        loop {
            if cancel.is_cancelled() {
                return Err(TranslationError::Cancelled);
            }
            match self.llm.complete(&system_prompt, &user_prompt, self.config.temperature).await {
                Ok(text) => {
                    let is_short = (text.chars().count() as f64)
                        < (chunk.chars().count() as f64) * SHORT_RESPONSE_RATIO;
                    if is_short && !soft_retried {
                        warn!("chunk response looked truncated, retrying once");
                        soft_retried = true;
                        continue;
                    }
                    return Ok(text);
                }
                Err(e) if attempt < self.config.max_retries => {
                    attempt += 1;
                    let backoff = self.config.base_backoff * 2u32.pow(attempt - 1);
                    warn!(attempt, ?backoff, error = %e, "retrying chunk translation");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => return Err(TranslationError::Cancelled),
                    }
                }
                Err(e) => return Err(TranslationError::Llm(e)),
            }
        }
    }

    async fn format_relevant_excerpt(&self, chunk: &str) -> String {
        self.glossary
            .format_relevant(chunk, self.scorer, self.config.max_glossary_entries, self.config.min_glossary_entries)
            .await
    }

    async fn polish(&self, source_text: &str, draft: &str, cancel: &CancellationToken) -> PolishOutcome {
        let system_prompt = "You are an expert editor. Improve fluency and consistency of the translated draft without re-translating from scratch.";
        let user_prompt = format!(
            "Source chapter:\n{}\n\nDraft translation to edit:\n{}",
            source_text, draft
        );

        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return PolishOutcome::CancelledBeforeStart;
            }
            match self.llm.complete(system_prompt, &user_prompt, self.config.polish_temperature).await {
                Ok(text) => return PolishOutcome::Polished(text),
                Err(_) if attempt < self.config.polish_max_retries => {
                    attempt += 1;
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.base_backoff * 2u32.pow(attempt - 1)) => {}
                        _ = cancel.cancelled() => return PolishOutcome::CancelledBeforeStart,
                    }
                }
                Err(e) => {
                    warn!(error = %e, "polish pass failed after retries; falling back to draft");
                    return PolishOutcome::FellBackToDraft;
                }
            }
        }
    }

    fn system_prompt(&self) -> String {
        let mut sections = vec![format!(
            "You are an expert {} translator. Translate faithfully, preserving tone, \
             dialogue formatting, and the glossary's fixed terminology choices.",
            self.style.language_pair
        )];
        if !self.style.guidelines.is_empty() {
            sections.push(format!("Style guidelines:\n- {}", self.style.guidelines.join("\n- ")));
        }
        if !self.style.vocabulary.is_empty() {
            sections.push(format!("Vocabulary preferences:\n- {}", self.style.vocabulary.join("\n- ")));
        }
        sections.join("\n\n")
    }

    fn user_prompt(&self, glossary_excerpt: &str, prior_output_tail: &str, chunk: &str) -> String {
        let mut sections = Vec::new();
        if !glossary_excerpt.is_empty() {
            sections.push(format!("Glossary:\n{}", glossary_excerpt));
        }
        if !prior_output_tail.is_empty() {
            sections.push(format!("Prior translated context:\n{}", prior_output_tail));
        }
        sections.push(format!("Text to translate:\n{}", chunk));
        sections.join("\n\n")
    }

    async fn mark_cancelled(&self, store: &ProgressStore, chapter_index: u32) -> Result<(), TranslationError> {
        store
            .update_chapter(chapter_index, |c: &mut Chapter| {
                c.status = ChapterStatus::Error;
                c.last_error = Some("cancelled".to_string());
            })
            .await
            .map_err(TranslationError::Progress)
    }

    async fn write_and_mark_translated(
        &self,
        store: &ProgressStore,
        book_dir: &std::path::Path,
        chapter_index: u32,
        text: &str,
    ) -> Result<(), TranslationError> {
        let chapter = store
            .snapshot()
            .await
            .chapter(chapter_index)
            .cloned()
            .ok_or(TranslationError::Progress(
                crate::error::ProgressStoreError::ChapterNotFound(chapter_index as usize),
            ))?;
        let path = translated_path(book_dir, &chapter);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TranslationError::Io(e.to_string()))?;
        }
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| TranslationError::Io(e.to_string()))?;
        file.write_all(text.as_bytes())
            .await
            .map_err(|e| TranslationError::Io(e.to_string()))?;

        store
            .update_chapter(chapter_index, |c: &mut Chapter| {
                c.status = ChapterStatus::Translated;
                c.last_error = None;
            })
            .await
            .map_err(TranslationError::Progress)
    }
}

enum PolishOutcome {
    Polished(String),
    CancelledBeforeStart,
    FellBackToDraft,
}

fn tail(text: &str, chars: usize) -> String {
    let total = text.chars().count();
    if total <= chars {
        text.to_string()
    } else {
        text.chars().skip(total - chars).collect()
    }
}

/// Alias kept here so callers don't need to reach into `error` directly for the common
/// "is this an LLM problem" check.
pub fn is_llm_error(error: &TranslationError) -> bool {
    matches!(error, TranslationError::Llm(LlmError::Request(_)) | TranslationError::Llm(LlmError::Timeout))
}
