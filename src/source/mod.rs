//! Config-driven sources. One [Source] binds a [SiteConfig] to an [HttpClient] and runs the
//! declarative selector program for search, chapter listing, and chapter content.

mod charset;
mod client;
mod error;
mod extract;
mod limiter;

pub use charset::{decode_html, sniff_charset};
pub use client::{backoff_base, backoff_delay, FetchedDocument, HttpClient, HttpClientBuilder};
pub use error::{ErrorKind, SourceError};
pub use extract::{resolve_url, ChapterCollector, ChapterLink};
pub use limiter::RateLimiter;

use crate::config::{non_empty, PaginationMode, SiteConfig};
use crate::model::{Book, Chapter};
use extract::ListingPage;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Url;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A configured site. Cheap to clone; clones share the HTTP connection pool and rate limiter.
#[derive(Debug, Clone)]
pub struct Source {
    config: Arc<SiteConfig>,
    client: HttpClient,
    headers: HeaderMap,
}

impl Source {
    /// Build the transport from the configuration's timeout, proxy, retries and rate limit.
    pub fn new(config: SiteConfig) -> Result<Self, SourceError> {
        let client = HttpClient::from_config(&config)?;
        Self::with_client(config, client)
    }

    /// Use a caller-supplied client (e.g. one sharing a limiter with other sources).
    pub fn with_client(config: SiteConfig, client: HttpClient) -> Result<Self, SourceError> {
        let headers = header_map(&config)?;
        Ok(Self {
            config: Arc::new(config),
            client,
            headers,
        })
    }

    /// Like [Source::new] but with an injected limiter in place of the configured one.
    pub fn with_limiter(config: SiteConfig, limiter: Arc<RateLimiter>) -> Result<Self, SourceError> {
        let client = HttpClient::from_config(&config)?.with_limiter(limiter);
        Self::with_client(config, client)
    }

    pub fn id(&self) -> &str {
        self.config.display_id()
    }

    pub fn name(&self) -> &str {
        self.config.display_name()
    }

    pub fn config(&self) -> &SiteConfig {
        &self.config
    }

    async fn fetch(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<FetchedDocument, SourceError> {
        self.client
            .fetch_document(url, &self.headers, self.config.charset_hint(), cancel)
            .await
    }

    /// Search the site for `keyword`. Results keep document order; duplicate links are dropped.
    pub async fn search(
        &self,
        keyword: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Book>, SourceError> {
        let search = &self.config.search;
        extract::required("search.item_selector", &search.item_selector)?;
        extract::required("search.title_selector", &search.title_selector)?;
        let url = extract::build_search_url(&self.config, keyword)?;
        let doc = self.fetch(url.as_str(), cancel).await?;
        let books = extract::parse_search_results(&doc, search)?;
        tracing::debug!(source = self.id(), keyword, hits = books.len(), "search");
        Ok(books)
    }

    /// List a book's chapters in discovery order, following the configured pagination.
    ///
    /// Indices are dense (`0..n`) across all listing pages. A failed fetch of a later
    /// listing page ends pagination and returns what was collected so far.
    pub async fn list_chapters(
        &self,
        detail_url: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Chapter>, SourceError> {
        let chapters = &self.config.chapters;
        extract::required("chapters.list_selector", &chapters.list_selector)?;
        let pagination = &chapters.pagination;
        let mode = pagination.mode();
        let next = match mode {
            PaginationMode::NextLink { selector, attr } => Some((selector, attr)),
            _ => None,
        };

        let listing_url = self.resolve_toc_url(detail_url, cancel).await?;
        let first = self.fetch(listing_url.as_str(), cancel).await?;
        let page = extract::parse_listing_page(&first, chapters, next)?;

        let mut collector = ChapterCollector::default();
        collector.extend(page.rows);
        tracing::debug!(url = %first.url, chapters = collector.len(), "listing page 1");

        let max_pages = pagination.max_pages();
        let stop_on_same = pagination.stop_on_same;
        match mode {
            PaginationMode::None => {}
            PaginationMode::NextLink { .. } => {
                let mut next_href = page.next_href;
                let mut current_url = first.url;
                let mut tracker = Growth::new(collector.len(), stop_on_same);
                for page_no in 2..=max_pages {
                    let Some(next_url) = next_href
                        .take()
                        .and_then(|href| resolve_url(&current_url, &href))
                    else {
                        break;
                    };
                    let Some((doc, page)) = self
                        .fetch_listing(next_url.as_str(), next, cancel)
                        .await?
                    else {
                        break;
                    };
                    let before = collector.len();
                    collector.extend(page.rows);
                    tracing::debug!(url = %doc.url, page = page_no, chapters = collector.len(), "listing page");
                    if tracker.should_stop(before, collector.len()) {
                        break;
                    }
                    next_href = page.next_href;
                    current_url = doc.url;
                }
            }
            PaginationMode::PageParam { param, start } => {
                let mut tracker = Growth::new(collector.len(), stop_on_same);
                let last = start.saturating_add(max_pages - 1);
                for page_no in start.saturating_add(1)..=last {
                    let url = extract::page_url(&listing_url, param, page_no);
                    let Some((doc, page)) = self.fetch_listing(url.as_str(), None, cancel).await?
                    else {
                        break;
                    };
                    let before = collector.len();
                    collector.extend(page.rows);
                    tracing::debug!(url = %doc.url, page = page_no, chapters = collector.len(), "listing page");
                    if tracker.should_stop(before, collector.len()) {
                        break;
                    }
                }
            }
        }

        Ok(collector.into_chapters())
    }

    /// Fetch and parse one follow-up listing page. Fetch failures other than cancellation
    /// end pagination (None) instead of failing the call.
    async fn fetch_listing(
        &self,
        url: &str,
        next: Option<(&str, &str)>,
        cancel: &CancellationToken,
    ) -> Result<Option<(FetchedDocument, ListingPage)>, SourceError> {
        let doc = match self.fetch(url, cancel).await {
            Ok(doc) => doc,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                tracing::warn!(url, error = %e, "listing page fetch failed; keeping chapters collected so far");
                return Ok(None);
            }
        };
        let page = extract::parse_listing_page(&doc, &self.config.chapters, next)?;
        Ok(Some((doc, page)))
    }

    /// The listing page for a book: the detail URL itself, or the TOC URL derived from it.
    async fn resolve_toc_url(
        &self,
        detail_url: &str,
        cancel: &CancellationToken,
    ) -> Result<Url, SourceError> {
        let toc = &self.config.chapters.toc;
        let Some(template) = non_empty(&toc.url_template) else {
            return Url::parse(detail_url.trim()).map_err(|e| SourceError::InvalidUrl {
                input: detail_url.to_string(),
                reason: e.to_string(),
            });
        };

        if let Some(pattern) = non_empty(&toc.id_from_url_regex) {
            if let Some(id) = extract::toc_id_from_url(pattern, detail_url)? {
                return extract::toc_url(template, &id, detail_url);
            }
        }

        extract::toc_id_selector(toc)?;
        let doc = self.fetch(detail_url, cancel).await?;
        let id = extract::toc_id_from_document(&doc, toc)?;
        extract::toc_url(template, &id, doc.url.as_str())
    }

    /// Fetch a chapter page and concatenate every element matching the content selector.
    ///
    /// A configured selector that matches nothing yields an empty string.
    pub async fn fetch_content(
        &self,
        chapter: &Chapter,
        cancel: &CancellationToken,
    ) -> Result<String, SourceError> {
        let content = &self.config.content;
        let selector = non_empty(&content.content_selector)
            .ok_or_else(|| SourceError::extraction("content.content_selector is not configured"))?;
        let doc = self.fetch(&chapter.url, cancel).await?;
        extract::extract_content(&doc, selector, content.mode)
    }
}

/// Termination rule shared by both pagination modes.
#[derive(Debug)]
struct Growth {
    prev_count: usize,
    stop_on_same: bool,
}

impl Growth {
    fn new(count: usize, stop_on_same: bool) -> Self {
        Self {
            prev_count: count,
            stop_on_same,
        }
    }

    /// Stop when the page added nothing, or (with `stop_on_same`) the total didn't move
    /// since the previous page.
    fn should_stop(&mut self, before: usize, after: usize) -> bool {
        if after == before || (self.stop_on_same && after == self.prev_count) {
            return true;
        }
        self.prev_count = after;
        false
    }
}

fn header_map(config: &SiteConfig) -> Result<HeaderMap, SourceError> {
    let mut headers = HeaderMap::with_capacity(config.headers.len());
    for (name, value) in &config.headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
            SourceError::InvalidConfig {
                field: "headers",
                reason: format!("{:?}: {}", name, e),
            }
        })?;
        let value = HeaderValue::from_str(value).map_err(|e| SourceError::InvalidConfig {
            field: "headers",
            reason: format!("{:?}: {}", value, e),
        })?;
        headers.insert(name, value);
    }
    Ok(headers)
}

/// Pick the source for `url`: by explicit id, else by matching host, else by id/name appearing
/// in the URL.
pub fn resolve_source<'a>(
    url_input: &str,
    sources: &'a [Source],
    override_id: Option<&str>,
) -> Result<&'a Source, SourceError> {
    if let Some(id) = override_id {
        return sources
            .iter()
            .find(|s| s.id() == id)
            .ok_or_else(|| SourceError::UnknownSource { id: id.to_string() });
    }
    let url = Url::parse(url_input).map_err(|e| SourceError::InvalidUrl {
        input: url_input.to_string(),
        reason: e.to_string(),
    })?;
    let host = url.host_str().ok_or_else(|| SourceError::InvalidUrl {
        input: url_input.to_string(),
        reason: "URL has no host".to_string(),
    })?;
    let by_host = sources.iter().find(|s| {
        Url::parse(&s.config().base_url)
            .ok()
            .and_then(|base| base.host_str().map(|h| h.eq_ignore_ascii_case(host)))
            .unwrap_or(false)
    });
    by_host
        .or_else(|| {
            sources.iter().find(|s| {
                [s.config().id.as_str(), s.config().name.as_str()]
                    .iter()
                    .any(|key| !key.is_empty() && url_input.contains(key))
            })
        })
        .ok_or_else(|| SourceError::UnrecognizedHost {
            host: host.to_string(),
        })
}
