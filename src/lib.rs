//! sonovel: config-driven novel scraper. Each site is a TOML source describing how to search,
//! list chapters, and extract chapter text. Books export to plain text or EPUB.

pub mod cli;
pub mod config;
pub mod epub;
pub mod formats;
pub mod logging;
pub mod model;
pub mod source;

// Re-exports for CLI and consumers.
pub use config::{ConfigError, ContentMode, SiteConfig};
pub use epub::{write_epub, EpubError, EpubMeta};
pub use formats::{render_text, write_text, FormatError, OutputFormat};
pub use model::{Book, Chapter, ChapterText};
pub use source::{resolve_source, ErrorKind, HttpClient, RateLimiter, Source, SourceError};
