//! Component-scoped error taxonomy.
//!
//! Each component that touches the outside world (disk, network, an LLM) owns a narrow
//! error enum built with `derive_more`, the way the teacher scopes errors per-module in
//! `royalroad/error.rs` and `calibre/errors.rs`. Only initialization failures ever escape
//! the orchestrator as `anyhow::Error`; per-chapter failures are captured as strings on
//! `Chapter::last_error` and never propagate past the worker loop (see `orchestrator.rs`).

use derive_more::{Display, Error, From};

#[derive(Debug, Display, From, Error)]
pub enum ProgressStoreError {
    #[display(fmt = "I/O error reading or writing book.json: {}", _0)]
    Io(std::io::Error),
    #[display(fmt = "book.json is not valid JSON: {}", _0)]
    Json(serde_json::Error),
    #[from(ignore)]
    #[display(fmt = "chapter index {} is out of range", _0)]
    ChapterNotFound(#[error(not(source))] usize),
}

#[derive(Debug, Display, From, Error)]
pub enum GlossaryError {
    #[display(fmt = "I/O error reading or writing glossary.csv: {}", _0)]
    Io(std::io::Error),
    #[display(fmt = "malformed glossary.csv: {}", _0)]
    Csv(csv::Error),
}

#[derive(Debug, Display, From, Error)]
pub enum DownloaderError {
    #[display(fmt = "fetch failed: {}", _0)]
    Fetch(FetchError),
    #[from(ignore)]
    #[display(fmt = "extracted chapter text was too short ({} chars)", _0)]
    ContentTooShort(#[error(not(source))] usize),
    #[display(fmt = "progress store error: {}", _0)]
    Progress(ProgressStoreError),
}

#[derive(Debug, Display, From, Error)]
pub enum FetchError {
    #[display(fmt = "network error: {}", _0)]
    Reqwest(reqwest::Error),
    #[from(ignore)]
    #[display(fmt = "server returned status {}", _0)]
    Status(#[error(not(source))] u16),
    #[from(ignore)]
    #[display(fmt = "fetch timed out")]
    Timeout,
}

impl FetchError {
    /// Transient failures are worth retrying; anything else is not.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Reqwest(e) => e.is_timeout() || e.is_connect(),
            FetchError::Status(code) => *code >= 500 || *code == 429,
            FetchError::Timeout => true,
        }
    }
}

#[derive(Debug, Display, From, Error)]
pub enum LlmError {
    #[from(ignore)]
    #[display(fmt = "llm call failed: {}", _0)]
    Request(#[error(not(source))] String),
    #[from(ignore)]
    #[display(fmt = "llm call timed out")]
    Timeout,
}

#[derive(Debug, Display, From, Error)]
pub enum TranslationError {
    #[display(fmt = "llm error: {}", _0)]
    Llm(LlmError),
    #[display(fmt = "progress store error: {}", _0)]
    Progress(ProgressStoreError),
    #[from(ignore)]
    #[display(fmt = "I/O error writing translated chapter: {}", _0)]
    Io(#[error(not(source))] String),
    #[from(ignore)]
    #[display(fmt = "cancelled")]
    Cancelled,
}

#[derive(Debug, Display, From, Error)]
pub enum PatternAnalyzerError {
    #[display(fmt = "fetch failed: {}", _0)]
    Fetch(FetchError),
    #[from(ignore)]
    #[display(fmt = "could not discover chapter list selectors: {}", _0)]
    NoPatternsFound(#[error(not(source))] String),
}

#[derive(Debug, Display, From, Error)]
pub enum EbookError {
    #[display(fmt = "I/O error assembling ebook: {}", _0)]
    Io(std::io::Error),
    #[from(ignore)]
    #[display(fmt = "epub generation failed: {}", _0)]
    Epub(#[error(not(source))] String),
    #[from(ignore)]
    #[display(fmt = "external conversion process failed: {}", _0)]
    Convert(#[error(not(source))] String),
}
