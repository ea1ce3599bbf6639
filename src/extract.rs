//! Raw text extraction for the supported document formats.

use std::{
    collections::HashMap,
    fs::File,
    io::Read,
    path::Path,
};

use quick_xml::{Reader, events::Event};

use crate::error::{Error, Result};

/// A document format the ingestion pipeline can read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Text,
    Pdf,
    Epub,
}

impl DocumentFormat {
    /// Recognised file extensions, lowercase.
    pub const EXTENSIONS: &'static [&'static str] = &["txt", "pdf", "epub"];

    /// Detect the format from a path's extension (case-insensitive).
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "txt" => Some(DocumentFormat::Text),
            "pdf" => Some(DocumentFormat::Pdf),
            "epub" => Some(DocumentFormat::Epub),
            _ => None,
        }
    }
}

/// Extract the raw text of the document at `path`.
pub fn extract(path: &Path) -> Result<String> {
    let format = DocumentFormat::from_path(path).ok_or_else(|| {
        Error::Config(format!("unsupported document format: {}", path.display()))
    })?;
    extract_as(path, format)
}

pub fn extract_as(path: &Path, format: DocumentFormat) -> Result<String> {
    match format {
        DocumentFormat::Text => extract_text(path),
        DocumentFormat::Pdf => extract_pdf(path),
        DocumentFormat::Epub => extract_epub(path),
    }
}

fn extract_text(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    })
}

fn extract_pdf(path: &Path) -> Result<String> {
    let document = lopdf::Document::load(path)?;

    let mut pages = Vec::new();
    for page_no in document.get_pages().into_keys() {
        let text = document.extract_text(&[page_no])?;
        if !text.trim().is_empty() {
            pages.push(text);
        }
    }
    Ok(pages.join("\n\n"))
}

fn epub_error(path: &Path, e: impl std::fmt::Display) -> Error {
    Error::Epub(format!("{}: {e}", path.display()))
}

/// Text of every content document in spine order, separated by blank
/// lines.
fn extract_epub(path: &Path) -> Result<String> {
    let file = File::open(path)?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| epub_error(path, e))?;

    let container = read_entry(&mut archive, "META-INF/container.xml")
        .map_err(|e| epub_error(path, e))?;
    let opf_path = rootfile_path(&container).ok_or_else(|| {
        epub_error(path, "container.xml names no package document")
    })?;
    let opf = read_entry(&mut archive, &opf_path).map_err(|e| epub_error(path, e))?;
    let base = match opf_path.rfind('/') {
        Some(i) => &opf_path[..=i],
        None => "",
    };

    let mut sections = Vec::new();
    for href in spine_hrefs(&opf) {
        let entry = format!("{base}{href}");
        let xhtml = match read_entry(&mut archive, &entry) {
            Ok(xhtml) => xhtml,
            Err(e) => {
                tracing::warn!(entry = %entry, error = %e, "skipping unreadable EPUB section");
                continue;
            }
        };
        let text = xhtml_text(&xhtml);
        if !text.trim().is_empty() {
            sections.push(text);
        }
    }
    Ok(sections.join("\n\n"))
}

fn read_entry(
    archive: &mut zip::ZipArchive<File>,
    name: &str,
) -> std::result::Result<String, Box<dyn std::error::Error>> {
    let mut entry = archive.by_name(name)?;
    let mut out = String::new();
    entry.read_to_string(&mut out)?;
    Ok(out)
}

fn attribute(e: &quick_xml::events::BytesStart<'_>, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == name)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

fn rootfile_path(container: &str) -> Option<String> {
    let mut reader = Reader::from_str(container);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e) | Event::Empty(e))
                if e.local_name().as_ref() == b"rootfile" =>
            {
                return attribute(&e, b"full-path");
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

/// Hrefs of the package's spine items, in reading order.
fn spine_hrefs(opf: &str) -> Vec<String> {
    let mut manifest: HashMap<String, String> = HashMap::new();
    let mut spine: Vec<String> = Vec::new();

    let mut reader = Reader::from_str(opf);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e) | Event::Empty(e)) => match e.local_name().as_ref() {
                b"item" => {
                    if let (Some(id), Some(href)) =
                        (attribute(&e, b"id"), attribute(&e, b"href"))
                    {
                        manifest.insert(id, href);
                    }
                }
                b"itemref" => {
                    if let Some(idref) = attribute(&e, b"idref") {
                        spine.push(idref);
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
    }

    spine
        .into_iter()
        .filter_map(|id| manifest.get(&id).cloned())
        .collect()
}

const BLOCK_TAGS: &[&[u8]] = &[
    b"p", b"div", b"br", b"li", b"tr", b"h1", b"h2", b"h3", b"h4", b"h5",
    b"h6", b"blockquote", b"section", b"title",
];

/// Visible text of an XHTML document; block elements become paragraphs.
fn xhtml_text(xhtml: &str) -> String {
    let mut reader = Reader::from_str(xhtml);
    let mut out = String::new();
    let mut skip_depth = 0usize;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = e.local_name();
                if matches!(name.as_ref(), b"script" | b"style" | b"head") {
                    skip_depth += 1;
                }
            }
            Ok(Event::End(e)) => {
                let name = e.local_name();
                if matches!(name.as_ref(), b"script" | b"style" | b"head") {
                    skip_depth = skip_depth.saturating_sub(1);
                } else if BLOCK_TAGS.contains(&name.as_ref()) {
                    out.push_str("\n\n");
                }
            }
            Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"br" {
                    out.push('\n');
                }
            }
            Ok(Event::Text(t)) if skip_depth == 0 => match t.unescape() {
                Ok(text) => out.push_str(&text),
                Err(_) => out.push_str(&String::from_utf8_lossy(&t)),
            },
            Ok(Event::CData(t)) if skip_depth == 0 => {
                out.push_str(&String::from_utf8_lossy(&t));
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                tracing::debug!(error = %e, "stopping at malformed XHTML");
                break;
            }
            _ => {}
        }
    }

    out
}
