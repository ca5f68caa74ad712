//! Plain-text export and the output format switch. Writers consume ordered
//! `(title, content)` pairs; EPUB lives in [crate::epub].

use crate::model::ChapterText;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

/// Output format for a downloaded book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Epub,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Text => "txt",
            OutputFormat::Epub => "epub",
        }
    }
}

/// Errors from the text writer.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("Cannot write: no chapters to export.")]
    NoChapters,

    #[error("Failed to write output: {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Each chapter as `title`, blank line, `content`, blank line.
pub fn render_text(chapters: &[ChapterText]) -> String {
    let mut out = String::new();
    for ch in chapters {
        out.push_str(&ch.title);
        out.push_str("\n\n");
        out.push_str(&ch.content);
        out.push_str("\n\n");
    }
    out
}

/// Write [render_text] output to `path`, replacing any existing file.
pub fn write_text(path: &Path, chapters: &[ChapterText]) -> Result<(), FormatError> {
    if chapters.is_empty() {
        return Err(FormatError::NoChapters);
    }
    let io_err = |source| FormatError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut f = File::create(path).map_err(io_err)?;
    f.write_all(render_text(chapters).as_bytes())
        .map_err(io_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chapters() -> Vec<ChapterText> {
        vec![
            ChapterText {
                title: "第一章".to_string(),
                content: "开头。".to_string(),
            },
            ChapterText {
                title: "第二章".to_string(),
                content: String::new(),
            },
        ]
    }

    #[test]
    fn render_text_separates_title_and_content() {
        assert_eq!(render_text(&chapters()), "第一章\n\n开头。\n\n第二章\n\n\n\n");
    }

    #[test]
    fn write_text_writes_file() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("book.txt");
        write_text(&path, &chapters())?;
        assert_eq!(std::fs::read_to_string(&path)?, render_text(&chapters()));
        Ok(())
    }

    #[test]
    fn write_text_rejects_empty_and_reports_path() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        assert!(matches!(
            write_text(&dir.path().join("x.txt"), &[]),
            Err(FormatError::NoChapters)
        ));
        let missing = dir.path().join("no-such-dir").join("x.txt");
        match write_text(&missing, &chapters()) {
            Err(FormatError::Io { path, .. }) => assert_eq!(path, missing),
            other => panic!("expected Io error, got {:?}", other),
        }
        Ok(())
    }
}
