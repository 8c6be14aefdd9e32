//! Persistent and in-memory data model: `BookProgress`, `Chapter`, glossary entries,
//! and the small messages that flow across the handoff channel.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChapterStatus {
    Pending,
    Crawled,
    Translated,
    Error,
}

impl ChapterStatus {
    /// Monotonic ordering used to detect illegal backward transitions outside of
    /// `force` replays or the reconciliation demotion rule.
    pub fn rank(self) -> u8 {
        match self {
            ChapterStatus::Pending => 0,
            ChapterStatus::Crawled => 1,
            ChapterStatus::Translated => 2,
            ChapterStatus::Error => 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chapter {
    pub index: u32,
    pub id: String,
    /// Absolute URL discovered once from the index page; re-used on every subsequent
    /// run so the downloader never has to re-discover it.
    #[serde(default)]
    pub source_url: String,
    #[serde(default)]
    pub title_source: String,
    #[serde(default)]
    pub title_translated: String,
    pub status: ChapterStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Chapter {
    pub fn new(index: u32) -> Self {
        Chapter {
            index,
            id: format!("{:04}", index),
            source_url: String::new(),
            title_source: String::new(),
            title_translated: String::new(),
            status: ChapterStatus::Pending,
            last_error: None,
        }
    }
}

/// Selectors discovered once by the index-page structural analyzer and persisted
/// alongside the rest of the book's progress so later runs never re-discover them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PatternRecord {
    pub chapter_link_selector: String,
    pub content_selector: String,
    pub title_selector: Option<String>,
    /// Selectors for the book's own title/author on the index page, distinct from
    /// `title_selector` (which applies to each chapter page). `None` when no candidate
    /// matched, in which case `BookProgress::title`/`author` stay empty.
    #[serde(default)]
    pub book_title_selector: Option<String>,
    #[serde(default)]
    pub book_author_selector: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookProgress {
    pub source_url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub title_translated: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub author_translated: String,
    #[serde(default)]
    pub encoding: String,
    #[serde(default)]
    pub patterns: Option<PatternRecord>,
    pub chapters: Vec<Chapter>,
    /// Unknown fields round-trip through this side channel instead of being dropped,
    /// so an older or differently-configured run of the tool never truncates `book.json`.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl BookProgress {
    pub fn new(source_url: String) -> Self {
        BookProgress {
            source_url,
            title: String::new(),
            title_translated: String::new(),
            author: String::new(),
            author_translated: String::new(),
            encoding: String::new(),
            patterns: None,
            chapters: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn chapter(&self, index: u32) -> Option<&Chapter> {
        self.chapters.iter().find(|c| c.index == index)
    }

    pub fn chapter_mut(&mut self, index: u32) -> Option<&mut Chapter> {
        self.chapters.iter_mut().find(|c| c.index == index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GlossaryCategory {
    Character,
    Realm,
    Technique,
    Location,
    Item,
    Organization,
    General,
}

impl Default for GlossaryCategory {
    fn default() -> Self {
        GlossaryCategory::General
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlossaryEntry {
    pub source_term: String,
    pub target_term: String,
    #[serde(default)]
    pub category: GlossaryCategory,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Merge policy for `GlossaryStore::add`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Keep the existing `target_term` for any source term already present.
    Merge,
    /// Overwrite existing entries with the incoming ones.
    Replace,
}

pub type GlossaryMap = BTreeMap<String, GlossaryEntry>;

/// A message on the unbounded handoff channel between the crawl producer and the
/// translator consumers. Intentionally tiny: the payload lives on disk, the consumer
/// reads it back by index, so cancellation never has to reason about in-flight bytes.
#[derive(Debug, Clone)]
pub struct ChapterWorkItem {
    pub book_dir: std::path::PathBuf,
    pub chapter_index: u32,
}

/// Volatile aggregate published to observers; never persisted.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    pub pending: usize,
    pub crawled: usize,
    pub translated: usize,
    pub error: usize,
    pub glossary_entry_count: usize,
    pub glossary_version: u64,
    pub worker_status: BTreeMap<u32, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMode {
    Full,
    CrawlOnly,
    TranslateOnly,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ChapterRange {
    pub start: Option<u32>,
    pub end: Option<u32>,
}

impl ChapterRange {
    pub fn contains(&self, index: u32) -> bool {
        self.start.map(|s| index >= s).unwrap_or(true) && self.end.map(|e| index <= e).unwrap_or(true)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub all_done: bool,
    pub cancelled: bool,
}
