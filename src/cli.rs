//! CLI parsing and orchestration: load sources, then search, list chapters, or download a
//! book to plain text or EPUB. Maps errors to exit codes.

use crate::config::{self, ConfigError};
use crate::epub::{write_epub, EpubError, EpubMeta};
use crate::formats::{write_text, FormatError, OutputFormat};
use crate::model::{Chapter, ChapterText};
use crate::source::{resolve_source, ErrorKind, Source, SourceError};
use clap::{Parser, Subcommand};
use futures::{stream, StreamExt, TryStreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

const DEFAULT_CONCURRENCY: usize = 8;

/// CLI error carrying exit code and message.
#[derive(Debug, Error)]
pub enum CliRunError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Source(#[from] SourceError),

    #[error("No chapters found at {url}.")]
    NoChapters { url: String },

    #[error("No chapters could be retrieved ({failed} failed).")]
    NoChaptersRetrieved { failed: usize },

    #[error("{0}")]
    Format(#[from] FormatError),

    #[error("{0}")]
    Epub(#[from] EpubError),
}

impl CliRunError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliRunError::InvalidInput(_) | CliRunError::Config(_) => 1,
            CliRunError::Source(e) if e.is_cancelled() => 130,
            CliRunError::Source(e) if e.kind() == ErrorKind::Configuration => 1,
            CliRunError::Source(_)
            | CliRunError::NoChapters { .. }
            | CliRunError::NoChaptersRetrieved { .. } => 2,
            CliRunError::Format(_) | CliRunError::Epub(_) => 3,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "sonovel")]
#[command(about = "Search and download novels from any site described by a source config")]
#[command(
    after_help = "Sources are TOML files (see sources/example.toml). Lookup order: --sources, ./sources, then the user config dir (sonovel/sources)."
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Directory of source configs (*.toml).
    #[arg(long, global = true)]
    pub sources: Option<PathBuf>,

    /// Cancel everything after this many seconds.
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    /// Suppress progress output (errors only).
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Debug logging and verbose error chain.
    #[arg(long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Search every source for a keyword.
    Search {
        #[arg(short, long)]
        keyword: String,

        /// Print results as JSON.
        #[arg(long)]
        json: bool,
    },
    /// List the chapters of a book.
    Chapters {
        /// Book detail-page URL.
        url: String,

        /// Source id (default: detected from the URL).
        #[arg(long)]
        source: Option<String>,
    },
    /// Download a book as plain text or EPUB.
    Download {
        /// Book detail-page URL.
        url: String,

        /// Source id (default: detected from the URL).
        #[arg(long)]
        source: Option<String>,

        /// Output path. Default: ./{last-url-segment}.{txt|epub}
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Output format: txt or epub.
        #[arg(short, long, default_value = "txt", value_parser = parse_format)]
        format: OutputFormat,

        /// Book title for EPUB metadata. Default: the output file name.
        #[arg(long)]
        title: Option<String>,

        /// Book author for EPUB metadata.
        #[arg(long)]
        author: Option<String>,

        /// Chapters fetched in parallel.
        #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
        concurrency: usize,
    },
}

/// Sanitize a name to a safe filename: keep letters and digits, replace the rest with `-`.
fn sanitize_file_stem(name: &str) -> String {
    let mut s = name
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>();
    while s.contains("--") {
        s = s.replace("--", "-");
    }
    s = s.trim_matches('-').to_string();
    if s.is_empty() {
        s = "book".to_string();
    }
    s
}

fn parse_format(s: &str) -> Result<OutputFormat, String> {
    match s.to_lowercase().as_str() {
        "txt" | "text" => Ok(OutputFormat::Text),
        "epub" => Ok(OutputFormat::Epub),
        _ => Err(format!("Unknown format '{}'. Use txt or epub.", s)),
    }
}

/// `./{stem of the last path segment}.{ext}`, or `./book.{ext}`.
fn default_output_path(book_url: &str, format: OutputFormat) -> PathBuf {
    let stem = reqwest::Url::parse(book_url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|segs| segs.filter(|s| !s.is_empty()).last().map(String::from))
        })
        .map(|seg| match seg.rsplit_once('.') {
            Some((stem, _ext)) if !stem.is_empty() => stem.to_string(),
            _ => seg,
        })
        .unwrap_or_default();
    PathBuf::from(format!(
        "{}.{}",
        sanitize_file_stem(&stem),
        format.extension()
    ))
}

/// Ensure output path parent exists.
fn validate_output_path(path: &Path) -> Result<(), CliRunError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            return Err(CliRunError::InvalidInput(format!(
                "Cannot write output: {}: parent directory does not exist.",
                path.display()
            )));
        }
    }
    Ok(())
}

fn load_sources(dir: Option<&Path>) -> Result<Vec<Source>, CliRunError> {
    let dir = match dir {
        Some(d) => d.to_path_buf(),
        None => config::default_sources_dir().ok_or(ConfigError::NoSourcesDir)?,
    };
    let configs = config::load_sources_dir(&dir)?;
    if configs.is_empty() {
        return Err(CliRunError::InvalidInput(format!(
            "No source configs (*.toml) in {}.",
            dir.display()
        )));
    }
    let sources = configs
        .into_iter()
        .map(Source::new)
        .collect::<Result<Vec<_>, _>>()?;
    tracing::debug!(dir = %dir.display(), count = sources.len(), "loaded sources");
    Ok(sources)
}

/// Entry point for the CLI. Every network wait observes `cancel`.
pub async fn run(args: &Args, cancel: &CancellationToken) -> Result<(), CliRunError> {
    let sources = load_sources(args.sources.as_deref())?;
    match &args.command {
        Command::Search { keyword, json } => search(&sources, keyword, *json, cancel).await,
        Command::Chapters { url, source } => {
            let source = resolve_source(url, &sources, source.as_deref())?;
            let chapters = source.list_chapters(url, cancel).await?;
            for ch in &chapters {
                println!("{}. {} ({})", ch.index + 1, ch.title, ch.url);
            }
            Ok(())
        }
        Command::Download {
            url,
            source,
            output,
            format,
            title,
            author,
            concurrency,
        } => {
            let source = resolve_source(url, &sources, source.as_deref())?;
            let output = output
                .clone()
                .unwrap_or_else(|| default_output_path(url, *format));
            validate_output_path(&output)?;
            let opts = DownloadOptions {
                output: &output,
                format: *format,
                title: title.as_deref(),
                author: author.as_deref(),
                concurrency: *concurrency,
                quiet: args.quiet,
            };
            download(source, url, &opts, cancel).await
        }
    }
}

async fn search(
    sources: &[Source],
    keyword: &str,
    json: bool,
    cancel: &CancellationToken,
) -> Result<(), CliRunError> {
    let mut results = Vec::with_capacity(sources.len());
    for source in sources {
        match source.search(keyword, cancel).await {
            Ok(books) => results.push((source, books)),
            Err(e) if e.is_cancelled() => return Err(e.into()),
            Err(e) => tracing::warn!(source = source.id(), error = %e, "search failed"),
        }
    }

    if json {
        let value: Vec<_> = results
            .iter()
            .map(|(source, books)| {
                serde_json::json!({ "source": source.id(), "name": source.name(), "books": books })
            })
            .collect();
        println!("{}", serde_json::Value::Array(value));
        return Ok(());
    }

    for (source, books) in &results {
        println!("[{}]{}", source.id(), source.name());
        for (i, b) in books.iter().enumerate() {
            println!("  {}. {} — {} ({})", i + 1, b.title, b.author, b.id);
        }
    }
    Ok(())
}

fn progress_bar(total: usize) -> ProgressBar {
    let bar = ProgressBar::new(total as u64);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner} {msg} [{bar:40}] {pos}/{len} ({elapsed})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
            .progress_chars("█▉▊▋▌▍▎▏ "),
    );
    bar.enable_steady_tick(Duration::from_millis(80));
    bar.set_message("Fetching chapters");
    bar
}

struct DownloadOptions<'a> {
    output: &'a Path,
    format: OutputFormat,
    title: Option<&'a str>,
    author: Option<&'a str>,
    concurrency: usize,
    quiet: bool,
}

async fn download(
    source: &Source,
    url: &str,
    opts: &DownloadOptions<'_>,
    cancel: &CancellationToken,
) -> Result<(), CliRunError> {
    let DownloadOptions {
        output,
        concurrency,
        quiet,
        ..
    } = *opts;
    let chapters = source.list_chapters(url, cancel).await?;
    if chapters.is_empty() {
        return Err(CliRunError::NoChapters {
            url: url.to_string(),
        });
    }

    let progress = (!quiet).then(|| progress_bar(chapters.len()));
    let fetched: Vec<Option<ChapterText>> = stream::iter(&chapters)
        .map(|ch| fetch_one(source, ch, cancel, progress.as_ref()))
        .buffered(concurrency.max(1))
        .try_collect()
        .await?;
    if let Some(bar) = &progress {
        bar.finish_and_clear();
    }

    let failed = fetched.iter().filter(|c| c.is_none()).count();
    let texts: Vec<ChapterText> = fetched.into_iter().flatten().collect();
    if texts.is_empty() {
        return Err(CliRunError::NoChaptersRetrieved { failed });
    }
    match opts.format {
        OutputFormat::Text => write_text(output, &texts)?,
        OutputFormat::Epub => {
            let meta = EpubMeta {
                title: opts
                    .title
                    .map(String::from)
                    .unwrap_or_else(|| default_title(output)),
                author: opts.author.unwrap_or_default().to_string(),
                language: String::new(),
                identifier: url.to_string(),
            };
            write_epub(output, &meta, &texts, source.config().content.mode)?;
        }
    }
    if !quiet {
        eprintln!(
            "Wrote {} chapter(s) to {}{}",
            texts.len(),
            output.display(),
            if failed > 0 {
                format!(" ({} skipped)", failed)
            } else {
                String::new()
            }
        );
    }
    Ok(())
}

/// Output file stem, or "Book".
fn default_title(output: &Path) -> String {
    output
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.trim().is_empty())
        .unwrap_or("Book")
        .to_string()
}

/// Fetch one chapter. Failures other than cancellation are logged and yield None.
async fn fetch_one(
    source: &Source,
    chapter: &Chapter,
    cancel: &CancellationToken,
    progress: Option<&ProgressBar>,
) -> Result<Option<ChapterText>, SourceError> {
    let result = source.fetch_content(chapter, cancel).await;
    if let Some(bar) = progress {
        bar.inc(1);
    }
    match result {
        Ok(content) => Ok(Some(ChapterText {
            title: chapter.title.clone(),
            content,
        })),
        Err(e) if e.is_cancelled() => Err(e),
        Err(e) => {
            tracing::warn!(chapter = chapter.index + 1, url = %chapter.url, error = %e, "chapter skipped");
            Ok(None)
        }
    }
}
