//! Shared glossary of source-language terms and their translations, persisted as
//! `glossary.csv` and guarded by a single-writer/many-reader lock so crawl/translate
//! workers can read a consistent snapshot while the extractor periodically appends to it.
//!
//! Grounded on the teacher's `RwLock`-guarded shared state in `aggregator.rs` (many
//! readers tallying progress, one writer flushing it to disk) and on the pack's CSV-first
//! glossary stores (TradocFlow, tlumok) for the `source,target,category,notes` layout.

use crate::error::GlossaryError;
use crate::models::{GlossaryCategory, GlossaryEntry, GlossaryMap, MergeMode};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock};

pub const GLOSSARY_FILE_NAME: &str = "glossary.csv";

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct GlossaryRow {
    source: String,
    target: String,
    category: String,
    notes: String,
}

impl From<&GlossaryEntry> for GlossaryRow {
    fn from(entry: &GlossaryEntry) -> Self {
        GlossaryRow {
            source: entry.source_term.clone(),
            target: entry.target_term.clone(),
            category: category_to_str(entry.category).to_string(),
            notes: entry.notes.clone().unwrap_or_default(),
        }
    }
}

fn category_to_str(category: GlossaryCategory) -> &'static str {
    match category {
        GlossaryCategory::Character => "character",
        GlossaryCategory::Realm => "realm",
        GlossaryCategory::Technique => "technique",
        GlossaryCategory::Location => "location",
        GlossaryCategory::Item => "item",
        GlossaryCategory::Organization => "organization",
        GlossaryCategory::General => "general",
    }
}

fn category_from_str(s: &str) -> GlossaryCategory {
    match s {
        "character" => GlossaryCategory::Character,
        "realm" => GlossaryCategory::Realm,
        "technique" => GlossaryCategory::Technique,
        "location" => GlossaryCategory::Location,
        "item" => GlossaryCategory::Item,
        "organization" => GlossaryCategory::Organization,
        _ => GlossaryCategory::General,
    }
}

impl From<GlossaryRow> for GlossaryEntry {
    fn from(row: GlossaryRow) -> Self {
        GlossaryEntry {
            source_term: row.source,
            target_term: row.target,
            category: category_from_str(&row.category),
            notes: if row.notes.is_empty() { None } else { Some(row.notes) },
        }
    }
}

fn read_csv(path: &Path) -> Result<GlossaryMap, GlossaryError> {
    if !path.exists() {
        return Ok(GlossaryMap::new());
    }
    let mut reader = csv::Reader::from_path(path)?;
    let mut map = GlossaryMap::new();
    for row in reader.deserialize::<GlossaryRow>() {
        let entry: GlossaryEntry = row?.into();
        map.insert(entry.source_term.clone(), entry);
    }
    Ok(map)
}

/// Serializes `map` to CSV in memory — the `csv` crate has no async writer, so this is
/// the only part of persistence it still does; the actual file write happens separately
/// via `tokio::fs` so the executor thread never blocks on disk.
fn serialize_csv(map: &GlossaryMap) -> Result<Vec<u8>, GlossaryError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for entry in map.values() {
        writer.serialize(GlossaryRow::from(entry))?;
    }
    writer.flush()?;
    writer
        .into_inner()
        .map_err(|e| GlossaryError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
}

/// Writes `bytes` to `path` atomically via a temp-file-then-rename, both steps done
/// through `tokio::fs` so the write never blocks the executor thread.
async fn write_csv_file(path: &Path, bytes: Vec<u8>) -> Result<(), GlossaryError> {
    let tmp_path = path.with_extension("csv.tmp");
    tokio::fs::write(&tmp_path, &bytes).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

/// Holds the glossary in memory behind a `tokio::sync::RwLock`; `version` is a
/// lock-free counter so readers (notably the term scorer) can detect staleness
/// without taking the lock. `write_order` serializes the file writes issued by `add`
/// and `remove` against each other — it is only ever held across the `tokio::fs` call,
/// never across the `RwLock` write guard, so a slow disk never stalls a reader.
pub struct GlossaryStore {
    path: PathBuf,
    inner: RwLock<GlossaryMap>,
    version: AtomicU64,
    write_order: Mutex<()>,
}

impl GlossaryStore {
    pub fn load(book_dir: impl AsRef<Path>) -> Result<Self, GlossaryError> {
        let path = book_dir.as_ref().join(GLOSSARY_FILE_NAME);
        let map = read_csv(&path)?;
        Ok(GlossaryStore {
            path,
            inner: RwLock::new(map),
            version: AtomicU64::new(0),
            write_order: Mutex::new(()),
        })
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub async fn snapshot(&self) -> GlossaryMap {
        self.inner.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Merges `entries` into the glossary according to `mode`, persists the result to
    /// disk, and bumps the version counter. Under `Merge`, an existing `target_term` is
    /// kept even if the incoming entry disagrees — the extractor never overwrites a
    /// human- or earlier-LLM-chosen translation without `Replace` being asked for.
    pub async fn add(&self, entries: Vec<GlossaryEntry>, mode: MergeMode) -> Result<usize, GlossaryError> {
        if entries.is_empty() {
            return Ok(0);
        }
        let (added, serialized) = {
            let mut guard = self.inner.write().await;
            let mut added = 0;
            let mut mutated = false;
            for entry in entries {
                match mode {
                    MergeMode::Replace => {
                        if guard.insert(entry.source_term.clone(), entry).is_none() {
                            added += 1;
                        }
                        mutated = true;
                    }
                    MergeMode::Merge => {
                        if !guard.contains_key(&entry.source_term) {
                            guard.insert(entry.source_term.clone(), entry);
                            added += 1;
                            mutated = true;
                        }
                    }
                }
            }
            if !mutated {
                return Ok(0);
            }
            (added, serialize_csv(&guard)?)
        };
        self.persist(serialized).await?;
        self.version.fetch_add(1, Ordering::AcqRel);
        Ok(added)
    }

    pub async fn remove(&self, source_term: &str) -> Result<bool, GlossaryError> {
        let serialized = {
            let mut guard = self.inner.write().await;
            if guard.remove(source_term).is_none() {
                return Ok(false);
            }
            serialize_csv(&guard)?
        };
        self.persist(serialized).await?;
        self.version.fetch_add(1, Ordering::AcqRel);
        Ok(true)
    }

    /// Writes `bytes` (already-serialized CSV) to disk, serialized against other
    /// in-flight persists via `write_order` so two concurrent saves can never interleave
    /// their writes to the same temp file, without holding the `RwLock` write guard
    /// across the I/O.
    async fn persist(&self, bytes: Vec<u8>) -> Result<(), GlossaryError> {
        let _write_guard = self.write_order.lock().await;
        write_csv_file(&self.path, bytes).await
    }

    /// Renders the top-scoring glossary terms for `chunk_text` per `scorer`, capped to
    /// `max_entries`, as a prompt-ready excerpt. If `scorer` has not been fit yet (no
    /// documents), falls back to the first `min_entries` glossary entries in insertion
    /// order — a deliberate minimum bar so translation can proceed before the corpus is
    /// large enough to score.
    pub async fn format_relevant(
        &self,
        chunk_text: &str,
        scorer: &crate::term_scorer::TermScorer,
        max_entries: usize,
        min_entries: usize,
    ) -> String {
        let guard = self.inner.read().await;
        if scorer.document_count() == 0 {
            return guard
                .values()
                .take(min_entries)
                .map(|entry| format!("{} -> {}", entry.source_term, entry.target_term))
                .collect::<Vec<_>>()
                .join("\n");
        }

        let top_terms = scorer.top_terms(chunk_text, max_entries);
        let mut lines: Vec<String> = top_terms
            .into_iter()
            .filter_map(|(term, _score)| {
                guard
                    .get(&term)
                    .map(|entry| format!("{} -> {}", entry.source_term, entry.target_term))
            })
            .collect();
        lines.sort();
        lines.dedup();
        lines.join("\n")
    }
}
