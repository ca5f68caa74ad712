//! Data model for scraped fiction.
//!
//! URLs double as identifiers: a [Book] is keyed by its detail-page URL and a [Chapter] by
//! its chapter-page URL. Values are created fresh per call and never mutated afterwards.

use serde::{Deserialize, Serialize};

/// One search hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Book {
    pub title: String,
    pub author: String,
    /// Absolute URL of the book's detail page.
    pub id: String,
    pub category: String,
    /// Last-update text as shown by the site.
    pub update: String,
}

/// One chapter in listing order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    pub title: String,
    /// Absolute URL of the chapter page; also the chapter's identifier.
    pub url: String,
    /// 0-based position across all listing pages, without gaps.
    pub index: usize,
}

/// `(title, content)` pair handed to exporters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterText {
    pub title: String,
    pub content: String,
}

impl Chapter {
    pub fn id(&self) -> &str {
        &self.url
    }
}
