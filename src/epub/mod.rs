//! EPUB 3 writer. Consumes the same ordered `(title, content)` pairs as the text export and
//! writes mimetype, container, OPF, nav, NCX, a title page and one XHTML file per chapter.

use crate::config::ContentMode;
use crate::model::ChapterText;
use scraper::Html;
use std::io::{Seek, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

const MIMETYPE: &[u8] = b"application/epub+zip";
const OEBPS_PREFIX: &str = "OEBPS/";
const CONTAINER_XML: &[u8] = b"<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<container version=\"1.0\" xmlns=\"urn:oasis:names:tc:opendocument:xmlns:container\">\n  <rootfiles>\n    <rootfile full-path=\"OEBPS/content.opf\" media-type=\"application/oebps-package+xml\"/>\n  </rootfiles>\n</container>";

/// Errors from the EPUB writer. Map to CLI exit code 3 like [FormatError](crate::FormatError).
#[derive(Debug, Error)]
pub enum EpubError {
    #[error("Cannot write EPUB: book title is empty.")]
    EmptyTitle,

    #[error("Cannot write EPUB: no chapters to export.")]
    NoChapters,

    #[error("Failed to create EPUB file: {path}: {source}")]
    CreateFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write EPUB archive: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl From<std::io::Error> for EpubError {
    fn from(e: std::io::Error) -> Self {
        EpubError::Zip(zip::result::ZipError::Io(e))
    }
}

/// Book-level metadata for the package document.
#[derive(Debug, Clone)]
pub struct EpubMeta {
    pub title: String,
    /// Empty means unknown; the title page and `dc:creator` are then omitted.
    pub author: String,
    /// BCP 47 tag, e.g. `zh`.
    pub language: String,
    /// Unique id, typically the book's detail-page URL.
    pub identifier: String,
}

/// Write `chapters` to an EPUB file at `path`. `mode` says how chapter content was extracted.
pub fn write_epub(
    path: &Path,
    meta: &EpubMeta,
    chapters: &[ChapterText],
    mode: ContentMode,
) -> Result<(), EpubError> {
    validate(meta, chapters)?;
    let file = std::fs::File::create(path).map_err(|e| EpubError::CreateFile {
        path: path.to_path_buf(),
        source: e,
    })?;
    write_epub_to(file, meta, chapters, mode)
}

/// Like [write_epub] but into any seekable writer.
pub fn write_epub_to<W: Write + Seek>(
    writer: W,
    meta: &EpubMeta,
    chapters: &[ChapterText],
    mode: ContentMode,
) -> Result<(), EpubError> {
    validate(meta, chapters)?;
    let mut zip = ZipWriter::new(writer);
    let stored = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored)
        .unix_permissions(0o644);
    let deflated = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o644);

    // mimetype must be the first entry, uncompressed.
    zip.start_file("mimetype", stored)?;
    zip.write_all(MIMETYPE)?;
    zip.start_file("META-INF/container.xml", deflated)?;
    zip.write_all(CONTAINER_XML)?;

    put(&mut zip, "content.opf", &package_document(meta, chapters.len()), deflated)?;
    put(&mut zip, "nav.xhtml", &nav_document(meta, chapters), deflated)?;
    put(&mut zip, "toc.ncx", &ncx_document(meta, chapters), deflated)?;
    put(&mut zip, "title.xhtml", &title_page(meta), deflated)?;
    for (i, ch) in chapters.iter().enumerate() {
        let name = chapter_file(i);
        put(&mut zip, &name, &chapter_document(ch, mode), deflated)?;
    }

    zip.finish()?;
    Ok(())
}

fn validate(meta: &EpubMeta, chapters: &[ChapterText]) -> Result<(), EpubError> {
    if meta.title.trim().is_empty() {
        return Err(EpubError::EmptyTitle);
    }
    if chapters.is_empty() {
        return Err(EpubError::NoChapters);
    }
    Ok(())
}

fn put<W: Write + Seek>(
    zip: &mut ZipWriter<W>,
    name: &str,
    body: &str,
    options: SimpleFileOptions,
) -> Result<(), EpubError> {
    zip.start_file(format!("{}{}", OEBPS_PREFIX, name), options)?;
    zip.write_all(body.as_bytes())?;
    Ok(())
}

fn chapter_file(index: usize) -> String {
    format!("chapter-{}.xhtml", index + 1)
}

fn package_document(meta: &EpubMeta, chapter_count: usize) -> String {
    let creator = if meta.author.trim().is_empty() {
        String::new()
    } else {
        format!("\n    <dc:creator>{}</dc:creator>", xml_escape(&meta.author))
    };
    let mut manifest = String::from(
        r#"    <item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>
    <item id="ncx" href="toc.ncx" media-type="application/x-dtbncx+xml"/>
    <item id="title-page" href="title.xhtml" media-type="application/xhtml+xml"/>
"#,
    );
    let mut spine = String::from("    <itemref idref=\"title-page\"/>\n");
    for i in 0..chapter_count {
        manifest.push_str(&format!(
            "    <item id=\"chapter-{n}\" href=\"{file}\" media-type=\"application/xhtml+xml\"/>\n",
            n = i + 1,
            file = chapter_file(i)
        ));
        spine.push_str(&format!("    <itemref idref=\"chapter-{}\"/>\n", i + 1));
    }

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" unique-identifier="book-id" version="3.0">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:identifier id="book-id">{id}</dc:identifier>
    <dc:title>{title}</dc:title>{creator}
    <dc:language>{language}</dc:language>
  </metadata>
  <manifest>
{manifest}  </manifest>
  <spine toc="ncx">
{spine}  </spine>
</package>
"#,
        id = xml_escape(&identifier(meta)),
        title = xml_escape(&meta.title),
        creator = creator,
        language = xml_escape(language(meta)),
        manifest = manifest,
        spine = spine,
    )
}

fn nav_document(meta: &EpubMeta, chapters: &[ChapterText]) -> String {
    let links: String = chapters
        .iter()
        .enumerate()
        .map(|(i, ch)| {
            format!(
                "      <li><a href=\"{}\">{}</a></li>\n",
                chapter_file(i),
                xml_escape(&ch.title)
            )
        })
        .collect();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops" xml:lang="{lang}">
<head>
  <title>{title}</title>
</head>
<body>
  <nav epub:type="toc">
    <h1>{title}</h1>
    <ol>
{links}    </ol>
  </nav>
</body>
</html>
"#,
        lang = xml_escape(language(meta)),
        title = xml_escape(&meta.title),
        links = links,
    )
}

fn ncx_document(meta: &EpubMeta, chapters: &[ChapterText]) -> String {
    let points: String = chapters
        .iter()
        .enumerate()
        .map(|(i, ch)| {
            format!(
                r#"    <navPoint id="navpoint-{n}" playOrder="{n}">
      <navLabel><text>{label}</text></navLabel>
      <content src="{file}"/>
    </navPoint>
"#,
                n = i + 1,
                label = xml_escape(&ch.title),
                file = chapter_file(i)
            )
        })
        .collect();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/" version="2005-1">
  <head>
    <meta name="dtb:uid" content="{uid}"/>
  </head>
  <docTitle><text>{title}</text></docTitle>
  <navMap>
{points}  </navMap>
</ncx>
"#,
        uid = xml_escape(&identifier(meta)),
        title = xml_escape(&meta.title),
        points = points,
    )
}

fn title_page(meta: &EpubMeta) -> String {
    let author = if meta.author.trim().is_empty() {
        String::new()
    } else {
        format!("\n  <p class=\"author\">{}</p>", xml_escape(&meta.author))
    };
    xhtml_page(
        language(meta),
        &meta.title,
        &format!("  <h1>{}</h1>{}", xml_escape(&meta.title), author),
    )
}

fn chapter_document(ch: &ChapterText, mode: ContentMode) -> String {
    let paragraphs: String = paragraphs(&ch.content, mode)
        .iter()
        .map(|p| format!("  <p>{}</p>\n", xml_escape(p)))
        .collect();
    xhtml_page(
        "",
        &ch.title,
        &format!("  <h2>{}</h2>\n{}", xml_escape(&ch.title), paragraphs.trim_end()),
    )
}

fn xhtml_page(lang: &str, title: &str, body: &str) -> String {
    let lang = if lang.is_empty() {
        String::new()
    } else {
        format!(" xml:lang=\"{}\"", xml_escape(lang))
    };
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml"{lang}>
<head>
  <title>{title}</title>
</head>
<body>
{body}
</body>
</html>
"#,
        lang = lang,
        title = xml_escape(title),
        body = body,
    )
}

/// Split chapter content into plain-text paragraphs.
///
/// Text content splits on line breaks. Markup content is reduced to its text nodes, so tags
/// from the site (which need not be well-formed XHTML) never reach the archive.
fn paragraphs(content: &str, mode: ContentMode) -> Vec<String> {
    let pieces: Vec<String> = match mode {
        ContentMode::Text => content.lines().map(String::from).collect(),
        ContentMode::Markup => Html::parse_fragment(content)
            .root_element()
            .text()
            .flat_map(str::lines)
            .map(String::from)
            .collect(),
    };
    pieces
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

fn identifier(meta: &EpubMeta) -> String {
    if meta.identifier.trim().is_empty() {
        format!("urn:sonovel:{}", meta.title.trim())
    } else {
        meta.identifier.trim().to_string()
    }
}

fn language(meta: &EpubMeta) -> &str {
    let lang = meta.language.trim();
    if lang.is_empty() {
        "zh"
    } else {
        lang
    }
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read};
    use zip::read::ZipArchive;

    fn meta() -> EpubMeta {
        EpubMeta {
            title: "诡秘之主".to_string(),
            author: "爱潜水的乌贼".to_string(),
            language: String::new(),
            identifier: "https://demo.test/book/1.html".to_string(),
        }
    }

    fn chapters() -> Vec<ChapterText> {
        vec![
            ChapterText {
                title: "第一章 绯红".to_string(),
                content: "痛！\n\n好痛！".to_string(),
            },
            ChapterText {
                title: "第二章 <情况>".to_string(),
                content: "A & B".to_string(),
            },
        ]
    }

    fn build(meta: &EpubMeta, chapters: &[ChapterText], mode: ContentMode) -> ZipArchive<Cursor<Vec<u8>>> {
        let mut buf = Cursor::new(Vec::new());
        write_epub_to(&mut buf, meta, chapters, mode).unwrap();
        ZipArchive::new(Cursor::new(buf.into_inner())).unwrap()
    }

    fn read(zip: &mut ZipArchive<Cursor<Vec<u8>>>, name: &str) -> String {
        let mut s = String::new();
        zip.by_name(name).unwrap().read_to_string(&mut s).unwrap();
        s
    }

    #[test]
    fn archive_layout_starts_with_stored_mimetype() {
        let mut zip = build(&meta(), &chapters(), ContentMode::Text);
        let first = zip.by_index(0).unwrap();
        assert_eq!(first.name(), "mimetype");
        assert_eq!(first.compression(), zip::CompressionMethod::Stored);
        drop(first);

        let names: Vec<String> = zip.file_names().map(String::from).collect();
        for expected in [
            "META-INF/container.xml",
            "OEBPS/content.opf",
            "OEBPS/nav.xhtml",
            "OEBPS/toc.ncx",
            "OEBPS/title.xhtml",
            "OEBPS/chapter-1.xhtml",
            "OEBPS/chapter-2.xhtml",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {}", expected);
        }
    }

    #[test]
    fn package_document_lists_chapters_in_reading_order() {
        let mut zip = build(&meta(), &chapters(), ContentMode::Text);
        let opf = read(&mut zip, "OEBPS/content.opf");
        assert!(opf.contains("<dc:title>诡秘之主</dc:title>"));
        assert!(opf.contains("<dc:creator>爱潜水的乌贼</dc:creator>"));
        assert!(opf.contains("<dc:language>zh</dc:language>"));
        assert!(opf.contains("https://demo.test/book/1.html"));
        let first = opf.find(r#"idref="chapter-1""#).unwrap();
        let second = opf.find(r#"idref="chapter-2""#).unwrap();
        assert!(first < second);
    }

    #[test]
    fn chapter_text_is_escaped_into_paragraphs() {
        let mut zip = build(&meta(), &chapters(), ContentMode::Text);
        let ch1 = read(&mut zip, "OEBPS/chapter-1.xhtml");
        assert!(ch1.contains("<p>痛！</p>\n  <p>好痛！</p>"));
        let ch2 = read(&mut zip, "OEBPS/chapter-2.xhtml");
        assert!(ch2.contains("<h2>第二章 &lt;情况&gt;</h2>"));
        assert!(ch2.contains("<p>A &amp; B</p>"));
        let nav = read(&mut zip, "OEBPS/nav.xhtml");
        assert!(nav.contains(r#"<a href="chapter-2.xhtml">第二章 &lt;情况&gt;</a>"#));
    }

    #[test]
    fn markup_content_is_reduced_to_text() {
        let chapters = vec![ChapterText {
            title: "1".to_string(),
            content: "<p>第一段</p><p>第二段<br>续</p>".to_string(),
        }];
        let mut zip = build(&meta(), &chapters, ContentMode::Markup);
        let ch = read(&mut zip, "OEBPS/chapter-1.xhtml");
        assert!(ch.contains("<p>第一段</p>"));
        assert!(ch.contains("<p>第二段</p>"));
        assert!(ch.contains("<p>续</p>"));
        assert!(!ch.contains("<br"));
    }

    #[test]
    fn missing_author_is_omitted() {
        let meta = EpubMeta {
            author: String::new(),
            ..meta()
        };
        let mut zip = build(&meta, &chapters(), ContentMode::Text);
        assert!(!read(&mut zip, "OEBPS/content.opf").contains("dc:creator"));
        assert!(!read(&mut zip, "OEBPS/title.xhtml").contains("author"));
    }

    #[test]
    fn rejects_empty_title_and_no_chapters() {
        let mut buf = Cursor::new(Vec::new());
        let untitled = EpubMeta {
            title: " ".to_string(),
            ..meta()
        };
        assert!(matches!(
            write_epub_to(&mut buf, &untitled, &chapters(), ContentMode::Text),
            Err(EpubError::EmptyTitle)
        ));
        assert!(matches!(
            write_epub_to(&mut buf, &meta(), &[], ContentMode::Text),
            Err(EpubError::NoChapters)
        ));
    }

    #[test]
    fn write_epub_reports_create_failure() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let missing = dir.path().join("no-such-dir").join("book.epub");
        match write_epub(&missing, &meta(), &chapters(), ContentMode::Text) {
            Err(EpubError::CreateFile { path, .. }) => assert_eq!(path, missing),
            other => panic!("expected CreateFile error, got {:?}", other),
        }
        let path = dir.path().join("book.epub");
        write_epub(&path, &meta(), &chapters(), ContentMode::Text)?;
        assert!(ZipArchive::new(std::fs::File::open(&path)?)?.len() >= 7);
        Ok(())
    }
}
