//! Per-book progress persistence.
//!
//! Grounded on the teacher's atomic-write discipline (`storage.rs` never leaves a
//! partially written object visible) and its JSON modeling elsewhere in the pack
//! (`quelle_persist`'s book metadata). `book.json` is written via temp-file-then-rename
//! so a crash mid-write never corrupts the record — the sole recovery mechanism beyond
//! that is the reconciliation pass in `load`.

use crate::error::ProgressStoreError;
use crate::models::{BookProgress, ChapterStatus};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const PROGRESS_FILE_NAME: &str = "book.json";
pub const RAW_DIR_NAME: &str = "raw";
pub const TRANSLATED_DIR_NAME: &str = "translated";

pub fn raw_path(book_dir: &Path, chapter: &crate::models::Chapter) -> PathBuf {
    book_dir.join(RAW_DIR_NAME).join(format!("{}.txt", chapter.id))
}

pub fn translated_path(book_dir: &Path, chapter: &crate::models::Chapter) -> PathBuf {
    book_dir
        .join(TRANSLATED_DIR_NAME)
        .join(format!("{}.txt", chapter.id))
}

fn file_is_present_and_nonempty(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

/// Loads `book.json` from `book_dir`, then reconciles every chapter's claimed status
/// against what is actually on disk. A chapter claiming TRANSLATED without a raw file
/// is demoted to PENDING (the stale translated file is left in place); a chapter
/// claiming CRAWLED without a raw file is demoted to PENDING.
#[tracing::instrument(name = "Loading book progress", skip(book_dir), fields(book_dir = %book_dir.as_ref().display()))]
pub fn load(book_dir: impl AsRef<Path>) -> Result<BookProgress, ProgressStoreError> {
    let book_dir = book_dir.as_ref();
    let path = book_dir.join(PROGRESS_FILE_NAME);
    let raw = std::fs::read_to_string(&path)?;
    let mut progress: BookProgress = serde_json::from_str(&raw)?;
    reconcile(book_dir, &mut progress);
    Ok(progress)
}

fn reconcile(book_dir: &Path, progress: &mut BookProgress) {
    for chapter in &mut progress.chapters {
        let raw_ok = file_is_present_and_nonempty(&raw_path(book_dir, chapter));
        let translated_ok = file_is_present_and_nonempty(&translated_path(book_dir, chapter));
        match chapter.status {
            ChapterStatus::Translated if !raw_ok || !translated_ok => {
                warn!(
                    chapter = chapter.index,
                    "chapter claimed TRANSLATED but raw/translated file missing; demoting to PENDING"
                );
                chapter.status = ChapterStatus::Pending;
            }
            ChapterStatus::Crawled if !raw_ok => {
                warn!(
                    chapter = chapter.index,
                    "chapter claimed CRAWLED but raw file missing; demoting to PENDING"
                );
                chapter.status = ChapterStatus::Pending;
            }
            _ => {}
        }
    }
}

/// Writes `book.json` atomically: serialize to a temp file in the same directory,
/// then rename over the destination. Rename is atomic on the same filesystem, so a
/// crash either leaves the old file intact or the new one complete — never a mix.
/// Synchronous; used only at startup before any task holds the progress lock.
#[tracing::instrument(name = "Saving book progress", skip(book_dir, progress), fields(book_dir = %book_dir.as_ref().display()))]
pub fn save(book_dir: impl AsRef<Path>, progress: &BookProgress) -> Result<(), ProgressStoreError> {
    let book_dir = book_dir.as_ref();
    std::fs::create_dir_all(book_dir)?;
    std::fs::create_dir_all(book_dir.join(RAW_DIR_NAME))?;
    std::fs::create_dir_all(book_dir.join(TRANSLATED_DIR_NAME))?;

    let serialized = serde_json::to_string_pretty(progress)?;
    let tmp_path = book_dir.join(format!(".{}.tmp", PROGRESS_FILE_NAME));
    std::fs::write(&tmp_path, serialized)?;
    std::fs::rename(&tmp_path, book_dir.join(PROGRESS_FILE_NAME))?;
    Ok(())
}

/// Same atomic write as `save`, but via `tokio::fs` so the caller never blocks the
/// executor thread. Used by every `ProgressStore` mutator, which calls this after
/// dropping its lock guard so the write never stalls other readers/writers of the
/// in-memory record.
#[tracing::instrument(name = "Saving book progress", skip(book_dir, progress), fields(book_dir = %book_dir.as_ref().display()))]
async fn save_async(book_dir: impl AsRef<Path>, progress: &BookProgress) -> Result<(), ProgressStoreError> {
    let book_dir = book_dir.as_ref();
    tokio::fs::create_dir_all(book_dir).await?;
    tokio::fs::create_dir_all(book_dir.join(RAW_DIR_NAME)).await?;
    tokio::fs::create_dir_all(book_dir.join(TRANSLATED_DIR_NAME)).await?;

    let serialized = serde_json::to_string_pretty(progress)?;
    let tmp_path = book_dir.join(format!(".{}.tmp", PROGRESS_FILE_NAME));
    tokio::fs::write(&tmp_path, serialized).await?;
    tokio::fs::rename(&tmp_path, book_dir.join(PROGRESS_FILE_NAME)).await?;
    Ok(())
}

pub fn load_or_create(book_dir: impl AsRef<Path>, source_url: &str) -> Result<BookProgress, ProgressStoreError> {
    let book_dir = book_dir.as_ref();
    match load(book_dir) {
        Ok(progress) => Ok(progress),
        Err(ProgressStoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(book_dir = %book_dir.display(), "no existing book.json, starting a fresh book");
            Ok(BookProgress::new(source_url.to_string()))
        }
        Err(e) => Err(e),
    }
}

/// Serializes all chapter mutations behind one mutex so that in-memory updates never
/// interleave two writers' views of the record, even though only one task ever advances
/// any given chapter. The actual file write happens after the mutation guard is
/// dropped, under a separate `write_order` mutex that only ever guards the `tokio::fs`
/// call itself — so a slow disk stalls other pending writes, never an in-memory read.
pub struct ProgressStore {
    book_dir: PathBuf,
    inner: Mutex<BookProgress>,
    write_order: Mutex<()>,
}

impl ProgressStore {
    pub fn new(book_dir: PathBuf, progress: BookProgress) -> Self {
        ProgressStore {
            book_dir,
            inner: Mutex::new(progress),
            write_order: Mutex::new(()),
        }
    }

    pub async fn snapshot(&self) -> BookProgress {
        self.inner.lock().await.clone()
    }

    pub fn book_dir(&self) -> &Path {
        &self.book_dir
    }

    /// Persists `progress` to disk, serialized against other in-flight persists via
    /// `write_order` so two concurrent saves can never interleave their writes to the
    /// same temp file, without holding the in-memory lock across the I/O.
    async fn persist(&self, progress: &BookProgress) -> Result<(), ProgressStoreError> {
        let _write_guard = self.write_order.lock().await;
        save_async(&self.book_dir, progress).await
    }

    /// Applies `mutator` to the chapter at `index`, then persists the full record.
    /// Returns an error if the chapter does not exist or the save fails.
    pub async fn update_chapter<F>(&self, index: u32, mutator: F) -> Result<(), ProgressStoreError>
    where
        F: FnOnce(&mut crate::models::Chapter),
    {
        let snapshot = {
            let mut guard = self.inner.lock().await;
            let chapter = guard
                .chapter_mut(index)
                .ok_or(ProgressStoreError::ChapterNotFound(index as usize))?;
            mutator(chapter);
            guard.clone()
        };
        self.persist(&snapshot).await
    }

    pub async fn set_patterns(&self, patterns: crate::models::PatternRecord) -> Result<(), ProgressStoreError> {
        let snapshot = {
            let mut guard = self.inner.lock().await;
            guard.patterns = Some(patterns);
            guard.clone()
        };
        self.persist(&snapshot).await
    }

    pub async fn set_title_translation(
        &self,
        title_translated: String,
        author_translated: String,
    ) -> Result<(), ProgressStoreError> {
        let snapshot = {
            let mut guard = self.inner.lock().await;
            guard.title_translated = title_translated;
            guard.author_translated = author_translated;
            guard.clone()
        };
        self.persist(&snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Chapter;
    use tempfile::tempdir;

    fn chapter(index: u32, status: ChapterStatus) -> Chapter {
        Chapter {
            status,
            ..Chapter::new(index)
        }
    }

    #[test]
    fn round_trips_through_save_and_load() {
        let dir = tempdir().unwrap();
        let mut progress = BookProgress::new("https://example.com/book".into());
        progress.title = "Some Title".into();
        progress.chapters.push(chapter(1, ChapterStatus::Pending));
        save(dir.path(), &progress).unwrap();

        let loaded = load(dir.path()).unwrap();
        assert_eq!(loaded.title, progress.title);
        assert_eq!(loaded.chapters.len(), 1);
    }

    #[test]
    fn demotes_translated_chapter_missing_raw_file() {
        let dir = tempdir().unwrap();
        let mut progress = BookProgress::new("https://example.com/book".into());
        progress.chapters.push(chapter(1, ChapterStatus::Translated));
        save(dir.path(), &progress).unwrap();

        let loaded = load(dir.path()).unwrap();
        assert_eq!(loaded.chapters[0].status, ChapterStatus::Pending);
    }

    #[test]
    fn demotes_crawled_chapter_missing_raw_file() {
        let dir = tempdir().unwrap();
        let mut progress = BookProgress::new("https://example.com/book".into());
        progress.chapters.push(chapter(1, ChapterStatus::Crawled));
        save(dir.path(), &progress).unwrap();

        let loaded = load(dir.path()).unwrap();
        assert_eq!(loaded.chapters[0].status, ChapterStatus::Pending);
    }

    #[test]
    fn keeps_translated_status_when_both_files_present() {
        let dir = tempdir().unwrap();
        let mut progress = BookProgress::new("https://example.com/book".into());
        let ch = chapter(1, ChapterStatus::Translated);
        std::fs::create_dir_all(dir.path().join(RAW_DIR_NAME)).unwrap();
        std::fs::create_dir_all(dir.path().join(TRANSLATED_DIR_NAME)).unwrap();
        std::fs::write(raw_path(dir.path(), &ch), "raw text").unwrap();
        std::fs::write(translated_path(dir.path(), &ch), "translated text").unwrap();
        progress.chapters.push(ch);
        save(dir.path(), &progress).unwrap();

        let loaded = load(dir.path()).unwrap();
        assert_eq!(loaded.chapters[0].status, ChapterStatus::Translated);
    }

    #[test]
    fn unknown_fields_round_trip() {
        let dir = tempdir().unwrap();
        let raw = r#"{
            "source_url": "https://example.com",
            "chapters": [],
            "some_future_field": 42
        }"#;
        std::fs::write(dir.path().join(PROGRESS_FILE_NAME), raw).unwrap();
        let loaded = load(dir.path()).unwrap();
        assert_eq!(
            loaded.extra.get("some_future_field"),
            Some(&serde_json::json!(42))
        );
        save(dir.path(), &loaded).unwrap();
        let reloaded = load(dir.path()).unwrap();
        assert_eq!(reloaded.extra.get("some_future_field"), Some(&serde_json::json!(42)));
    }
}
