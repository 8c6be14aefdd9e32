//! The `HttpFetcher` boundary: out of scope as a full integration, modeled as a narrow
//! async trait the downloader and pattern analyzer both depend on.
//!
//! Grounded on the teacher's `reqwest::Client`-based fetch helpers in `royalroad/mod.rs`;
//! generalized here into a trait so tests can substitute a fixture-backed fetcher without
//! a live network.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::FetchError;

/// Raw bytes and the server's claimed (not yet validated) character encoding for a URL.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub body: Vec<u8>,
    pub claimed_encoding: Option<String>,
}

#[async_trait]
pub trait HttpFetcher: Send + Sync {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<FetchedPage, FetchError>;
}

/// Lets the orchestrator hand a single `Arc<dyn HttpFetcher>` (one real fetcher shared
/// across the producer and the pattern analyzer) to `Downloader<F>`, which is generic
/// over `F: HttpFetcher` rather than hard-coded to a trait object.
#[async_trait]
impl HttpFetcher for std::sync::Arc<dyn HttpFetcher> {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<FetchedPage, FetchError> {
        self.as_ref().fetch(url, timeout).await
    }
}

/// Default `HttpFetcher` backed by `reqwest`, reading the `charset` parameter off the
/// response's `Content-Type` header the way a browser would, without trusting it blindly
/// (the downloader re-validates with `encoding_rs` before accepting it).
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new() -> Self {
        ReqwestFetcher {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    #[tracing::instrument(name = "Fetching URL", skip(self))]
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<FetchedPage, FetchError> {
        let response = self.client.get(url).timeout(timeout).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        let claimed_encoding = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|ct| ct.split("charset=").nth(1))
            .map(|s| s.trim().to_string());
        let body = response.bytes().await?.to_vec();
        Ok(FetchedPage {
            body,
            claimed_encoding,
        })
    }
}

/// Always-compiled test doubles (not `#[cfg(test)]`-gated) so integration tests under
/// `tests/` — a separate compilation unit from this crate — can use the same fixture
/// fetcher as the unit tests below.
pub mod fixtures {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    /// In-memory fetcher for tests: maps URLs to canned pages, optionally injecting a
    /// one-shot transient failure so retry logic in the downloader can be exercised.
    #[derive(Default)]
    pub struct FixtureFetcher {
        pages: HashMap<String, FetchedPage>,
        fail_once: Mutex<std::collections::HashSet<String>>,
    }

    impl FixtureFetcher {
        pub fn new() -> Self {
            FixtureFetcher::default()
        }

        pub fn with_page(mut self, url: &str, body: Vec<u8>, claimed_encoding: Option<&str>) -> Self {
            self.pages.insert(
                url.to_string(),
                FetchedPage {
                    body,
                    claimed_encoding: claimed_encoding.map(|s| s.to_string()),
                },
            );
            self
        }

        pub fn fail_once_for(mut self, url: &str) -> Self {
            self.fail_once.get_mut().insert(url.to_string());
            self
        }
    }

    #[async_trait]
    impl HttpFetcher for FixtureFetcher {
        async fn fetch(&self, url: &str, _timeout: Duration) -> Result<FetchedPage, FetchError> {
            let mut fail_once = self.fail_once.lock().await;
            if fail_once.remove(url) {
                return Err(FetchError::Timeout);
            }
            drop(fail_once);
            self.pages
                .get(url)
                .cloned()
                .ok_or(FetchError::Status(404))
        }
    }
}
