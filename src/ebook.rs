//! Ebook assembler: turns on-disk translated chapters into an EPUB, with an optional
//! external-process fallback for AZW3/MOBI/PDF. Out of scope as a full integration per
//! the spec — a default implementation is provided, but `EbookAssembler` is a trait so a
//! caller can swap in a different backend entirely.
//!
//! EPUB generation is grounded on `nacht-org-quelle`'s `quelle_bundle`/`quelle_export`
//! crates, the pack's one example of an actual EPUB writer. The external-conversion
//! fallback is grounded directly on the teacher's `calibre::generate_mobi`: write the
//! input to a temp file, shell out to a converter via `tokio::process::Command`, read
//! the result back, clean up.

use async_trait::async_trait;
use epub_builder::{EpubBuilder, EpubContent, ZipLibrary};
use std::path::Path;
use tokio::process::Command;
use tracing::info;

use crate::error::EbookError;
use crate::models::BookProgress;
use crate::progress_store::translated_path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalFormat {
    Azw3,
    Mobi,
    Pdf,
}

impl ExternalFormat {
    fn extension(self) -> &'static str {
        match self {
            ExternalFormat::Azw3 => "azw3",
            ExternalFormat::Mobi => "mobi",
            ExternalFormat::Pdf => "pdf",
        }
    }
}

#[async_trait]
pub trait EbookAssembler: Send + Sync {
    async fn assemble_epub(&self, book_dir: &Path, progress: &BookProgress) -> Result<Vec<u8>, EbookError>;

    async fn assemble_external(
        &self,
        book_dir: &Path,
        progress: &BookProgress,
        format: ExternalFormat,
    ) -> Result<Vec<u8>, EbookError>;
}

pub struct DefaultEbookAssembler;

#[async_trait]
impl EbookAssembler for DefaultEbookAssembler {
    #[tracing::instrument(name = "Assembling EPUB", skip(self, progress), fields(book_dir = %book_dir.display()))]
    async fn assemble_epub(&self, book_dir: &Path, progress: &BookProgress) -> Result<Vec<u8>, EbookError> {
        let mut builder = EpubBuilder::new(ZipLibrary::new().map_err(|e| EbookError::Epub(e.to_string()))?)
            .map_err(|e| EbookError::Epub(e.to_string()))?;
        builder
            .metadata("title", title_or_default(progress))
            .map_err(|e| EbookError::Epub(e.to_string()))?;
        if !progress.author_translated.is_empty() {
            builder
                .metadata("author", progress.author_translated.clone())
                .map_err(|e| EbookError::Epub(e.to_string()))?;
        }

        for chapter in &progress.chapters {
            if chapter.status != crate::models::ChapterStatus::Translated {
                continue;
            }
            let path = translated_path(book_dir, chapter);
            let text = tokio::fs::read_to_string(&path)
                .await
                .map_err(EbookError::Io)?;
            let heading = if chapter.title_translated.is_empty() {
                format!("Chapter {}", chapter.index)
            } else {
                chapter.title_translated.clone()
            };
            let html = render_chapter_html(&heading, &text);
            let file_name = format!("chapter_{}.xhtml", chapter.id);
            builder
                .add_content(
                    EpubContent::new(file_name, html.as_bytes())
                        .title(heading)
                        .reftype(epub_builder::ReferenceType::Text),
                )
                .map_err(|e| EbookError::Epub(e.to_string()))?;
        }

        let mut output = Vec::new();
        builder
            .generate(&mut output)
            .map_err(|e| EbookError::Epub(e.to_string()))?;
        Ok(output)
    }

    #[tracing::instrument(name = "Converting to external format", skip(self, progress), fields(book_dir = %book_dir.display(), format = ?format))]
    async fn assemble_external(
        &self,
        book_dir: &Path,
        progress: &BookProgress,
        format: ExternalFormat,
    ) -> Result<Vec<u8>, EbookError> {
        let epub_bytes = self.assemble_epub(book_dir, progress).await?;

        let file_stem: String = rand::random::<u64>().to_string();
        let in_path = std::env::temp_dir().join(format!("{}.epub", file_stem));
        let out_path = std::env::temp_dir().join(format!("{}.{}", file_stem, format.extension()));

        tokio::fs::write(&in_path, &epub_bytes).await.map_err(EbookError::Io)?;

        let output = Command::new("ebook-convert")
            .arg(&in_path)
            .arg(&out_path)
            .arg("--authors")
            .arg(&progress.author_translated)
            .arg("--title")
            .arg(title_or_default(progress))
            .output()
            .await
            .map_err(|e| EbookError::Convert(e.to_string()))?;

        info!(
            status = ?output.status,
            stderr = %String::from_utf8_lossy(&output.stderr),
            "ebook-convert finished"
        );

        if !output.status.success() {
            let _ = tokio::fs::remove_file(&in_path).await;
            return Err(EbookError::Convert(format!(
                "ebook-convert exited with {}",
                output.status
            )));
        }

        let bytes = tokio::fs::read(&out_path).await.map_err(EbookError::Io)?;
        let _ = tokio::fs::remove_file(&in_path).await;
        let _ = tokio::fs::remove_file(&out_path).await;
        Ok(bytes)
    }
}

fn title_or_default(progress: &BookProgress) -> String {
    if !progress.title_translated.is_empty() {
        progress.title_translated.clone()
    } else if !progress.title.is_empty() {
        progress.title.clone()
    } else {
        "Untitled".to_string()
    }
}

fn render_chapter_html(heading: &str, body: &str) -> String {
    let escaped_heading = html_escape(heading);
    let paragraphs: String = body
        .split("\n\n")
        .map(|p| format!("<p>{}</p>", html_escape(p)))
        .collect();
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <html xmlns=\"http://www.w3.org/1999/xhtml\"><head><title>{title}</title></head>\n\
         <body><h1>{title}</h1>{paragraphs}</body></html>",
        title = escaped_heading,
        paragraphs = paragraphs
    )
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chapter, ChapterStatus};
    use tempfile::tempdir;

    #[tokio::test]
    async fn assembles_epub_bytes_from_translated_chapters() {
        let dir = tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("translated")).await.unwrap();
        let mut progress = BookProgress::new("https://example.com/book".into());
        progress.title_translated = "A Translated Title".into();
        let mut chapter = Chapter::new(1);
        chapter.status = ChapterStatus::Translated;
        chapter.title_translated = "Chapter One".into();
        tokio::fs::write(translated_path(dir.path(), &chapter), "Some translated prose.")
            .await
            .unwrap();
        progress.chapters.push(chapter);

        let assembler = DefaultEbookAssembler;
        let bytes = assembler.assemble_epub(dir.path(), &progress).await.unwrap();
        assert!(!bytes.is_empty());
    }

    #[test]
    fn html_escape_neutralizes_angle_brackets() {
        assert_eq!(html_escape("<script>"), "&lt;script&gt;");
    }
}
