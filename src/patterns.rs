//! The `PatternAnalyzer` boundary: one-shot discovery of CSS-like selectors identifying
//! chapter links and content regions on a book's index page. Out of scope as a full
//! integration — the core only persists whatever `PatternRecord` it returns and reuses
//! it for the book's lifetime.
//!
//! Grounded on the teacher's own hard-coded royalroad selectors in `royalroad/mod.rs`
//! (`scraper::Selector` literals baked into the source); generalized here into a trait
//! so a real implementation can discover selectors instead of hard-coding a single site.

use async_trait::async_trait;

use crate::error::PatternAnalyzerError;
use crate::fetcher::HttpFetcher;
use crate::models::PatternRecord;

#[async_trait]
pub trait PatternAnalyzer: Send + Sync {
    async fn analyze(&self, index_url: &str) -> Result<PatternRecord, PatternAnalyzerError>;
}

/// Reference implementation: fetches the index page and tries a small list of common
/// chapter-list/content selector conventions, returning the first one that yields at
/// least one match. A production analyzer would use an LLM or heuristics to do this
/// generally; this is a reasonable default for well-behaved serialized-fiction sites.
pub struct HeuristicPatternAnalyzer<F: HttpFetcher> {
    fetcher: F,
    timeout: std::time::Duration,
}

const CANDIDATE_CHAPTER_LINK_SELECTORS: &[&str] = &[
    "a.chapter-link",
    ".chapter-list a",
    "#chapters a",
    "table.chapters a",
];

const CANDIDATE_CONTENT_SELECTORS: &[&str] = &[".chapter-content", "#chapter-content", "article", ".content"];

const CANDIDATE_BOOK_TITLE_SELECTORS: &[&str] = &[".book-title", "#book-title", "h1.title", "h1"];

const CANDIDATE_BOOK_AUTHOR_SELECTORS: &[&str] = &[".book-author", "#book-author", ".author", "[rel=author]"];

impl<F: HttpFetcher> HeuristicPatternAnalyzer<F> {
    pub fn new(fetcher: F, timeout: std::time::Duration) -> Self {
        HeuristicPatternAnalyzer { fetcher, timeout }
    }
}

#[async_trait]
impl<F: HttpFetcher> PatternAnalyzer for HeuristicPatternAnalyzer<F> {
    #[tracing::instrument(name = "Analyzing index page patterns", skip(self))]
    async fn analyze(&self, index_url: &str) -> Result<PatternRecord, PatternAnalyzerError> {
        let page = self.fetcher.fetch(index_url, self.timeout).await?;
        let html = String::from_utf8_lossy(&page.body);
        let document = scraper::Html::parse_document(&html);

        let chapter_link_selector = CANDIDATE_CHAPTER_LINK_SELECTORS
            .iter()
            .find(|selector_str| selector_matches(&document, selector_str))
            .ok_or_else(|| {
                PatternAnalyzerError::NoPatternsFound("no candidate chapter link selector matched".to_string())
            })?;

        let content_selector = CANDIDATE_CONTENT_SELECTORS
            .iter()
            .find(|selector_str| selector_matches(&document, selector_str))
            .unwrap_or(&CANDIDATE_CONTENT_SELECTORS[0]);

        let book_title_selector = CANDIDATE_BOOK_TITLE_SELECTORS
            .iter()
            .find(|selector_str| selector_matches(&document, selector_str))
            .map(|s| s.to_string());
        let book_author_selector = CANDIDATE_BOOK_AUTHOR_SELECTORS
            .iter()
            .find(|selector_str| selector_matches(&document, selector_str))
            .map(|s| s.to_string());

        Ok(PatternRecord {
            chapter_link_selector: chapter_link_selector.to_string(),
            content_selector: content_selector.to_string(),
            title_selector: Some("h1".to_string()),
            book_title_selector,
            book_author_selector,
        })
    }
}

fn selector_matches(document: &scraper::Html, selector_str: &str) -> bool {
    scraper::Selector::parse(selector_str)
        .map(|selector| document.select(&selector).next().is_some())
        .unwrap_or(false)
}

/// One link discovered on the index page: its 1-based position, resolved absolute URL,
/// and link text (used to seed `Chapter::title_source` before the chapter is crawled).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredChapterLink {
    pub index: u32,
    pub url: String,
    pub title: String,
}

/// Applies an already-discovered `chapter_link_selector` to the index page and returns
/// the chapter list in document order. This is a mechanical selector application, not
/// structural discovery — it runs on every fresh book, using the `PatternRecord` the
/// (out-of-scope) analyzer already produced, the way the downloader applies
/// `content_selector` to each chapter page.
pub async fn discover_chapter_links(
    fetcher: &dyn HttpFetcher,
    index_url: &str,
    chapter_link_selector: &str,
    timeout: std::time::Duration,
) -> Result<Vec<DiscoveredChapterLink>, PatternAnalyzerError> {
    let page = fetcher.fetch(index_url, timeout).await?;
    let html = String::from_utf8_lossy(&page.body);
    let document = scraper::Html::parse_document(&html);
    let selector = scraper::Selector::parse(chapter_link_selector)
        .map_err(|_| PatternAnalyzerError::NoPatternsFound("chapter link selector is not valid CSS".to_string()))?;

    let base = url::Url::parse(index_url)
        .map_err(|e| PatternAnalyzerError::NoPatternsFound(format!("index URL is not a valid URL: {}", e)))?;

    let links: Vec<DiscoveredChapterLink> = document
        .select(&selector)
        .enumerate()
        .filter_map(|(i, el)| {
            let href = el.value().attr("href")?;
            let resolved = base.join(href).ok()?.to_string();
            let title = el.text().collect::<Vec<_>>().join("").trim().to_string();
            Some(DiscoveredChapterLink {
                index: (i + 1) as u32,
                url: resolved,
                title,
            })
        })
        .collect();

    if links.is_empty() {
        return Err(PatternAnalyzerError::NoPatternsFound(
            "chapter link selector matched no anchors with an href".to_string(),
        ));
    }
    Ok(links)
}

/// Applies `patterns`'s book-level title/author selectors (if discovered) to the index
/// page and returns the matched text, trimmed. Either or both come back empty when no
/// selector was discovered or nothing matched — callers treat that as "no title/author
/// known" rather than an error, the way `translate_title`'s skip guard already expects.
pub async fn discover_book_metadata(
    fetcher: &dyn HttpFetcher,
    index_url: &str,
    patterns: &PatternRecord,
    timeout: std::time::Duration,
) -> Result<(String, String), PatternAnalyzerError> {
    if patterns.book_title_selector.is_none() && patterns.book_author_selector.is_none() {
        return Ok((String::new(), String::new()));
    }
    let page = fetcher.fetch(index_url, timeout).await?;
    let html = String::from_utf8_lossy(&page.body);
    let document = scraper::Html::parse_document(&html);

    let title = patterns
        .book_title_selector
        .as_deref()
        .and_then(|selector_str| select_first_text(&document, selector_str))
        .unwrap_or_default();
    let author = patterns
        .book_author_selector
        .as_deref()
        .and_then(|selector_str| select_first_text(&document, selector_str))
        .unwrap_or_default();
    Ok((title, author))
}

fn select_first_text(document: &scraper::Html, selector_str: &str) -> Option<String> {
    let selector = scraper::Selector::parse(selector_str).ok()?;
    let text = document
        .select(&selector)
        .next()?
        .text()
        .collect::<Vec<_>>()
        .join("")
        .trim()
        .to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::fixtures::FixtureFetcher;
    use std::time::Duration;

    #[tokio::test]
    async fn discovers_known_chapter_link_convention() {
        let html = r#"<html><body><div class="chapter-list"><a href="/c/1">Chapter 1</a></div>
            <div class="chapter-content">text</div></body></html>"#;
        let fetcher = FixtureFetcher::new().with_page("https://example.com/book", html.as_bytes().to_vec(), None);
        let analyzer = HeuristicPatternAnalyzer::new(fetcher, Duration::from_secs(5));

        let patterns = analyzer.analyze("https://example.com/book").await.unwrap();
        assert_eq!(patterns.chapter_link_selector, ".chapter-list a");
        assert_eq!(patterns.content_selector, ".chapter-content");
    }

    #[tokio::test]
    async fn fails_when_no_selector_matches() {
        let html = "<html><body><p>nothing recognizable</p></body></html>";
        let fetcher = FixtureFetcher::new().with_page("https://example.com/book", html.as_bytes().to_vec(), None);
        let analyzer = HeuristicPatternAnalyzer::new(fetcher, Duration::from_secs(5));

        let result = analyzer.analyze("https://example.com/book").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn discovers_book_title_and_author_selectors() {
        let html = r#"<html><body>
            <h1 class="book-title">Journey to the East</h1>
            <span class="book-author">Jane Doe</span>
            <div class="chapter-list"><a href="/c/1">Chapter 1</a></div>
            <div class="chapter-content">text</div></body></html>"#;
        let fetcher = FixtureFetcher::new().with_page("https://example.com/book", html.as_bytes().to_vec(), None);
        let analyzer = HeuristicPatternAnalyzer::new(fetcher, Duration::from_secs(5));

        let patterns = analyzer.analyze("https://example.com/book").await.unwrap();
        assert_eq!(patterns.book_title_selector.as_deref(), Some(".book-title"));
        assert_eq!(patterns.book_author_selector.as_deref(), Some(".book-author"));
    }

    #[tokio::test]
    async fn discover_book_metadata_extracts_title_and_author() {
        let html = r#"<html><body>
            <h1 class="book-title">Journey to the East</h1>
            <span class="book-author">Jane Doe</span></body></html>"#;
        let fetcher = FixtureFetcher::new().with_page("https://example.com/book", html.as_bytes().to_vec(), None);
        let patterns = PatternRecord {
            chapter_link_selector: ".chapter-list a".into(),
            content_selector: ".chapter-content".into(),
            title_selector: Some("h1".into()),
            book_title_selector: Some(".book-title".into()),
            book_author_selector: Some(".book-author".into()),
        };

        let (title, author) = discover_book_metadata(&fetcher, "https://example.com/book", &patterns, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(title, "Journey to the East");
        assert_eq!(author, "Jane Doe");
    }

    #[tokio::test]
    async fn discover_book_metadata_is_empty_when_no_selectors_discovered() {
        let fetcher = FixtureFetcher::new();
        let patterns = PatternRecord {
            chapter_link_selector: ".chapter-list a".into(),
            content_selector: ".chapter-content".into(),
            title_selector: Some("h1".into()),
            book_title_selector: None,
            book_author_selector: None,
        };

        let (title, author) = discover_book_metadata(&fetcher, "https://example.com/book", &patterns, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(title, "");
        assert_eq!(author, "");
    }
}
