//! Site configuration: the declarative description of how to scrape one website.
//!
//! A [SiteConfig] is read-only once loaded. Required selectors are only checked when the
//! operation that needs them runs, so a source that only supports search may leave the
//! chapter and content sections empty.
//!
//! Loading from disk ([load_sources_dir]) exists for the command-line front end; the
//! extraction core only ever receives an already-built [SiteConfig].

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default number of retries beyond the first attempt.
pub const DEFAULT_RETRIES: u32 = 3;
/// Default per-request timeout when `timeout_seconds` is unset or zero.
pub const DEFAULT_TIMEOUT_SECS: u64 = 15;
/// Default page cap for chapter-list pagination.
pub const DEFAULT_MAX_PAGES: u32 = 20;

/// One source. Keys mirror the TOML layout of a `sources/*.toml` file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct SiteConfig {
    pub id: String,
    pub name: String,
    pub base_url: String,
    /// Explicit charset (e.g. "gbk"). When empty, the response is sniffed.
    pub charset: String,
    pub rate_limit: RateLimitConfig,
    /// Retries beyond the first attempt. Unset means [DEFAULT_RETRIES]; 0 disables retrying.
    pub retries: Option<u32>,
    pub timeout_seconds: u64,
    /// HTTP proxy applied to every request, e.g. `http://127.0.0.1:7890`.
    pub proxy: String,
    pub headers: BTreeMap<String, String>,
    pub search: SearchConfig,
    pub chapters: ChaptersConfig,
    pub content: ContentConfig,
}

/// Token-bucket settings. `rps <= 0` disables limiting.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub rps: f64,
    pub burst: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct SearchConfig {
    /// Path appended to `base_url`, e.g. `/search.php`. Used when `url` is empty.
    pub path: String,
    /// Query parameter carrying the keyword in path mode. Defaults to `q`.
    pub param: String,
    /// URL template with a `{{query}}` placeholder. Takes precedence over `path`.
    #[serde(rename = "url")]
    pub url_template: String,
    /// Static query parameters; they override same-named parameters already present.
    pub extra_params: BTreeMap<String, String>,

    pub item_selector: String,
    pub title_selector: String,
    pub author_selector: String,
    /// Defaults to `a`.
    pub link_selector: String,
    /// Defaults to `href`.
    pub link_attr: String,
    pub update_selector: String,
    pub category_selector: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct ChaptersConfig {
    pub list_selector: String,
    /// Falls back to the row's own text when empty or unmatched.
    pub title_selector: String,
    /// Defaults to `a`.
    pub url_selector: String,
    /// Defaults to `href`.
    pub url_attr: String,
    pub pagination: PaginationConfig,
    pub toc: TocConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct PaginationConfig {
    pub next_selector: String,
    /// Defaults to `href`.
    pub next_attr: String,
    pub page_param: String,
    /// Defaults to 1.
    pub start_page: u32,
    /// Defaults to [DEFAULT_MAX_PAGES].
    pub max_pages: u32,
    pub stop_on_same: bool,
}

/// Derivation of the table-of-contents URL from a book's detail URL.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct TocConfig {
    /// e.g. `https://site/chapter/{{id}}.html`. Empty means the detail page is the listing.
    pub url_template: String,
    /// Applied to the detail URL; capture group 1 is the id.
    pub id_from_url_regex: String,
    /// Element on the detail page whose attribute carries the id.
    pub id_selector: String,
    /// Defaults to `href`.
    pub id_attr: String,
    /// Optional refinement of the attribute value; capture group 1 is the id.
    pub id_regex: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct ContentConfig {
    pub content_selector: String,
    pub mode: ContentMode,
}

/// How matched content elements are turned into chapter text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentMode {
    /// Trimmed text of each element (default).
    #[default]
    Text,
    /// Inner HTML of each element.
    Markup,
}

/// Pagination strategy for a chapter listing, selected once per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaginationMode<'a> {
    None,
    NextLink { selector: &'a str, attr: &'a str },
    PageParam { param: &'a str, start: u32 },
}

impl SiteConfig {
    /// Configured id, or the base URL when no id is set.
    pub fn display_id(&self) -> &str {
        non_empty(&self.id).unwrap_or(&self.base_url)
    }

    /// Configured name, or the base URL when no name is set.
    pub fn display_name(&self) -> &str {
        non_empty(&self.name).unwrap_or(&self.base_url)
    }

    pub fn charset_hint(&self) -> Option<&str> {
        non_empty(&self.charset)
    }

    pub fn retries(&self) -> u32 {
        self.retries.unwrap_or(DEFAULT_RETRIES)
    }

    pub fn timeout(&self) -> Duration {
        match self.timeout_seconds {
            0 => Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            secs => Duration::from_secs(secs),
        }
    }

    pub fn proxy(&self) -> Option<&str> {
        non_empty(&self.proxy)
    }
}

impl PaginationConfig {
    /// Next-link mode wins when both a next selector and a page parameter are configured.
    pub fn mode(&self) -> PaginationMode<'_> {
        if let Some(selector) = non_empty(&self.next_selector) {
            PaginationMode::NextLink {
                selector,
                attr: or_default(&self.next_attr, "href"),
            }
        } else if let Some(param) = non_empty(&self.page_param) {
            PaginationMode::PageParam {
                param,
                start: if self.start_page == 0 {
                    1
                } else {
                    self.start_page
                },
            }
        } else {
            PaginationMode::None
        }
    }

    pub fn max_pages(&self) -> u32 {
        if self.max_pages == 0 {
            DEFAULT_MAX_PAGES
        } else {
            self.max_pages
        }
    }
}

/// Trimmed value, or None when blank.
pub(crate) fn non_empty(s: &str) -> Option<&str> {
    let t = s.trim();
    if t.is_empty() {
        None
    } else {
        Some(t)
    }
}

pub(crate) fn or_default<'a>(s: &'a str, default: &'a str) -> &'a str {
    non_empty(s).unwrap_or(default)
}

/// Errors from reading source configuration files.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read sources directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("No sources directory found. Create ./sources or pass --sources DIR.")]
    NoSourcesDir,
}

/// Parse one source from TOML text.
pub fn parse_site_config(s: &str) -> Result<SiteConfig, toml::de::Error> {
    toml::from_str(s)
}

/// Search order: (1) ./sources, (2) $XDG_CONFIG_HOME/sonovel/sources.
pub fn default_sources_dir() -> Option<PathBuf> {
    let mut candidates = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        candidates.push(cwd.join("sources"));
    }
    if let Some(d) = dirs::config_dir() {
        candidates.push(d.join("sonovel").join("sources"));
    }
    candidates.into_iter().find(|p| p.is_dir())
}

/// Load every `*.toml` file in `dir`, sorted by file name.
pub fn load_sources_dir(dir: &Path) -> Result<Vec<SiteConfig>, ConfigError> {
    let entries = std::fs::read_dir(dir).map_err(|e| ConfigError::ReadDir {
        path: dir.to_path_buf(),
        source: e,
    })?;
    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| ConfigError::ReadDir {
            path: dir.to_path_buf(),
            source: e,
        })?;
        let path = entry.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "toml") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut configs = Vec::with_capacity(paths.len());
    for path in paths {
        let s = std::fs::read_to_string(&path).map_err(|e| ConfigError::Read {
            path: path.clone(),
            source: e,
        })?;
        let config = parse_site_config(&s).map_err(|e| ConfigError::Parse {
            path: path.clone(),
            source: e,
        })?;
        configs.push(config);
    }
    Ok(configs)
}
