//! Selector program execution: turns fetched documents into books, chapter rows, and text.
//!
//! Everything here is synchronous. Parsed HTML never crosses an await point, so the async
//! callers in [super] stay `Send`.

use crate::config::{
    non_empty, or_default, ChaptersConfig, ContentMode, SearchConfig, SiteConfig, TocConfig,
};
use crate::model::{Book, Chapter};
use crate::source::client::FetchedDocument;
use crate::source::error::SourceError;
use regex::Regex;
use reqwest::Url;
use scraper::{ElementRef, Selector};
use std::collections::{BTreeMap, HashSet};

const QUERY_PLACEHOLDER: &str = "{{query}}";
const ID_PLACEHOLDER: &str = "{{id}}";

/// Return the trimmed value, or [SourceError::MissingConfig] naming `field` when blank.
pub(crate) fn required<'a>(field: &'static str, value: &'a str) -> Result<&'a str, SourceError> {
    non_empty(value).ok_or(SourceError::MissingConfig { field })
}

/// Parse a CSS selector or return a configuration error (avoids panics from Selector::parse).
pub(crate) fn parse_selector(field: &'static str, css: &str) -> Result<Selector, SourceError> {
    Selector::parse(css).map_err(|e| SourceError::InvalidConfig {
        field,
        reason: format!("invalid selector {:?}: {}", css, e),
    })
}

fn optional_selector(field: &'static str, css: &str) -> Result<Option<Selector>, SourceError> {
    non_empty(css)
        .map(|css| parse_selector(field, css))
        .transpose()
}

fn parse_regex(field: &'static str, pattern: &str) -> Result<Regex, SourceError> {
    Regex::new(pattern).map_err(|e| SourceError::InvalidConfig {
        field,
        reason: e.to_string(),
    })
}

/// Resolve `href` against the page it was found on. Blank or unparsable hrefs yield None.
pub fn resolve_url(base: &Url, href: &str) -> Option<Url> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }
    base.join(href).ok()
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text().collect::<String>().trim().to_string()
}

/// Trimmed text of the first descendant matching `sel`, or "" when absent.
fn first_text(el: ElementRef<'_>, sel: Option<&Selector>) -> String {
    sel.and_then(|s| el.select(s).next())
        .map(element_text)
        .unwrap_or_default()
}

/// Attribute of the first descendant matching `sel`, falling back to `el` itself when it matches.
fn first_attr<'a>(el: ElementRef<'a>, sel: &Selector, attr: &str) -> Option<&'a str> {
    el.select(sel)
        .next()
        .or_else(|| sel.matches(&el).then_some(el))
        .and_then(|e| e.value().attr(attr))
}

/// Set `params` on `url`, replacing any same-named parameters already present.
fn override_query(url: &mut Url, params: &BTreeMap<&str, &str>) {
    if params.is_empty() {
        return;
    }
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !params.contains_key(&**k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .extend_pairs(params.iter());
}

/// Build the search URL from either the `url` template or `base_url` + `path` + `param`.
pub fn build_search_url(config: &SiteConfig, keyword: &str) -> Result<Url, SourceError> {
    let search = &config.search;
    let extras: BTreeMap<&str, &str> = search
        .extra_params
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();

    if let Some(template) = non_empty(&search.url_template) {
        let escaped: String = url::form_urlencoded::byte_serialize(keyword.as_bytes()).collect();
        let raw = template.replace(QUERY_PLACEHOLDER, &escaped);
        let mut url = parse_absolute("search.url", &raw, &config.base_url)?;
        override_query(&mut url, &extras);
        return Ok(url);
    }

    let base = required("base_url", &config.base_url)?;
    let raw = format!(
        "{}/{}",
        base.trim_end_matches('/'),
        search.path.trim().trim_start_matches('/')
    );
    let mut url = Url::parse(&raw).map_err(|e| SourceError::InvalidConfig {
        field: "search.path",
        reason: format!("{}: {}", raw, e),
    })?;
    let mut params = BTreeMap::new();
    params.insert(or_default(&search.param, "q"), keyword);
    params.extend(extras);
    override_query(&mut url, &params);
    Ok(url)
}

/// Parse `raw` as an absolute URL, or relative to `base` when it has no scheme.
fn parse_absolute(field: &'static str, raw: &str, base: &str) -> Result<Url, SourceError> {
    let invalid = |reason: String| SourceError::InvalidConfig { field, reason };
    match Url::parse(raw) {
        Ok(url) => Ok(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse(base)
            .and_then(|b| b.join(raw))
            .map_err(|e| invalid(format!("{}: {}", raw, e))),
        Err(e) => Err(invalid(format!("{}: {}", raw, e))),
    }
}

/// Project search result rows into books, dropping untitled/unlinked rows and duplicate links.
pub fn parse_search_results(
    doc: &FetchedDocument,
    search: &SearchConfig,
) -> Result<Vec<Book>, SourceError> {
    let item_sel = parse_selector(
        "search.item_selector",
        required("search.item_selector", &search.item_selector)?,
    )?;
    let title_sel = parse_selector(
        "search.title_selector",
        required("search.title_selector", &search.title_selector)?,
    )?;
    let author_sel = optional_selector("search.author_selector", &search.author_selector)?;
    let category_sel = optional_selector("search.category_selector", &search.category_selector)?;
    let update_sel = optional_selector("search.update_selector", &search.update_selector)?;
    let link_sel = parse_selector(
        "search.link_selector",
        or_default(&search.link_selector, "a"),
    )?;
    let link_attr = or_default(&search.link_attr, "href");

    let html = doc.parse();
    let mut seen = HashSet::new();
    let mut books = Vec::new();
    for item in html.select(&item_sel) {
        let title = first_text(item, Some(&title_sel));
        if title.is_empty() {
            continue;
        }
        let Some(link) = first_attr(item, &link_sel, link_attr)
            .and_then(|href| resolve_url(&doc.url, href))
            .map(String::from)
        else {
            continue;
        };
        if !seen.insert(link.clone()) {
            continue;
        }
        books.push(Book {
            title,
            author: first_text(item, author_sel.as_ref()),
            id: link,
            category: first_text(item, category_sel.as_ref()),
            update: first_text(item, update_sel.as_ref()),
        });
    }
    Ok(books)
}

/// One chapter row as found on a listing page. `url` is empty when the link didn't resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterLink {
    pub title: String,
    pub url: String,
}

/// Rows of one listing page plus the raw "next" href, when next-link pagination asked for it.
#[derive(Debug, Default)]
pub struct ListingPage {
    pub rows: Vec<ChapterLink>,
    pub next_href: Option<String>,
}

/// Extract chapter rows from a listing page. Links resolve against the page's own URL.
pub fn parse_listing_page(
    doc: &FetchedDocument,
    chapters: &ChaptersConfig,
    next: Option<(&str, &str)>,
) -> Result<ListingPage, SourceError> {
    let list_sel = parse_selector(
        "chapters.list_selector",
        required("chapters.list_selector", &chapters.list_selector)?,
    )?;
    let title_sel = optional_selector("chapters.title_selector", &chapters.title_selector)?;
    let url_sel = parse_selector(
        "chapters.url_selector",
        or_default(&chapters.url_selector, "a"),
    )?;
    let url_attr = or_default(&chapters.url_attr, "href");
    let next_sel = next
        .map(|(css, attr)| parse_selector("chapters.pagination.next_selector", css).map(|s| (s, attr)))
        .transpose()?;

    let html = doc.parse();
    let rows = html
        .select(&list_sel)
        .map(|row| {
            let mut title = first_text(row, title_sel.as_ref());
            if title.is_empty() {
                title = element_text(row);
            }
            let url = first_attr(row, &url_sel, url_attr)
                .and_then(|href| resolve_url(&doc.url, href))
                .map(String::from)
                .unwrap_or_default();
            ChapterLink { title, url }
        })
        .collect();

    let next_href = next_sel.and_then(|(sel, attr)| {
        html.select(&sel)
            .next()
            .and_then(|e| e.value().attr(attr))
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(String::from)
    });

    Ok(ListingPage { rows, next_href })
}

/// Ordered chapter accumulator shared by every listing page of one call.
///
/// Rows with an empty or already-seen URL are skipped; accepted rows get the next dense index.
#[derive(Debug, Default)]
pub struct ChapterCollector {
    chapters: Vec<Chapter>,
    seen: HashSet<String>,
}

impl ChapterCollector {
    pub fn push(&mut self, link: ChapterLink) -> bool {
        if link.url.is_empty() || self.seen.contains(&link.url) {
            return false;
        }
        self.seen.insert(link.url.clone());
        self.chapters.push(Chapter {
            title: link.title,
            url: link.url,
            index: self.chapters.len(),
        });
        true
    }

    /// Push every row; returns how many were new.
    pub fn extend(&mut self, rows: impl IntoIterator<Item = ChapterLink>) -> usize {
        rows.into_iter().map(|row| self.push(row)).filter(|added| *added).count()
    }

    pub fn len(&self) -> usize {
        self.chapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chapters.is_empty()
    }

    pub fn into_chapters(self) -> Vec<Chapter> {
        self.chapters
    }
}

/// `listing` with `param` set to `page`, replacing any existing value.
pub fn page_url(listing: &Url, param: &str, page: u32) -> Url {
    let mut url = listing.clone();
    let page = page.to_string();
    override_query(&mut url, &BTreeMap::from([(param, page.as_str())]));
    url
}

/// Capture group 1 of `pattern` applied to the detail URL, if it matches.
pub fn toc_id_from_url(pattern: &str, detail_url: &str) -> Result<Option<String>, SourceError> {
    let re = parse_regex("chapters.toc.id_from_url_regex", pattern)?;
    Ok(re
        .captures(detail_url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string()))
}

/// The detail-page id selector, required once the URL regex gave no id.
pub(crate) fn toc_id_selector(toc: &TocConfig) -> Result<&str, SourceError> {
    non_empty(&toc.id_selector).ok_or_else(|| {
        SourceError::extraction(
            "toc url_template is set but no id could be derived (id_from_url_regex did not match and id_selector is empty)",
        )
    })
}

/// Read the TOC id from the detail page via `id_selector`/`id_attr`, refined by `id_regex`.
pub fn toc_id_from_document(doc: &FetchedDocument, toc: &TocConfig) -> Result<String, SourceError> {
    let css = toc_id_selector(toc)?;
    let sel = parse_selector("chapters.toc.id_selector", css)?;
    let id_re = non_empty(&toc.id_regex)
        .map(|p| parse_regex("chapters.toc.id_regex", p))
        .transpose()?;
    let attr = or_default(&toc.id_attr, "href");

    let html = doc.parse();
    let raw = html
        .select(&sel)
        .next()
        .and_then(|e| e.value().attr(attr))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            SourceError::extraction(format!("toc id not found by selector {:?} at {}", css, doc.url))
        })?;

    match id_re {
        None => Ok(raw.to_string()),
        Some(re) => re
            .captures(raw)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| {
                SourceError::extraction(format!("toc id_regex did not match {:?}", raw))
            }),
    }
}

/// Substitute `id` into the TOC template; a relative result resolves against the detail URL.
pub fn toc_url(template: &str, id: &str, detail_url: &str) -> Result<Url, SourceError> {
    let raw = template.replace(ID_PLACEHOLDER, id);
    parse_absolute("chapters.toc.url_template", &raw, detail_url)
}

/// Concatenate every element matching `selector`, in document order, with no separator.
pub fn extract_content(
    doc: &FetchedDocument,
    selector: &str,
    mode: ContentMode,
) -> Result<String, SourceError> {
    let sel = parse_selector("content.content_selector", selector)?;
    let html = doc.parse();
    let parts = html.select(&sel).map(|el| match mode {
        ContentMode::Text => element_text(el),
        ContentMode::Markup => el.inner_html().trim().to_string(),
    });
    Ok(parts.collect())
}
