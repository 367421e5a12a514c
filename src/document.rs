use anyhow::{Context, Result};
use log::{debug, info, warn};
use mime_guess::from_path;
use std::fs;
use std::path::Path;

const FORM_FEED: char = '\u{c}';

/// Represents a loaded document with its content and metadata
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// The actual text content of the document
    pub content: String,
    /// Human readable title (the file name in the source folder)
    pub title: String,
    /// 1-based page number for paginated sources such as PDFs
    pub page: Option<u32>,
    /// Identifier of the folder the document was loaded from
    pub folder_id: String,
}

impl Document {
    pub fn new(content: String, title: &str, page: Option<u32>, folder_id: &str) -> Self {
        Document {
            content,
            title: title.to_string(),
            page,
            folder_id: folder_id.to_string(),
        }
    }

    /// Load a file from disk. PDFs produce one document per page.
    pub fn from_file<P: AsRef<Path>>(file_path: P, folder_id: &str) -> Result<Vec<Self>> {
        let path = file_path.as_ref();
        let title = path
            .file_name()
            .context("Invalid file name")?
            .to_str()
            .context("Invalid file name encoding")?
            .to_string();

        let mime_type = from_path(path).first_or_octet_stream().to_string();
        debug!("Detected MIME type {} for {}", mime_type, title);

        match DocumentKind::from_mime(&mime_type) {
            Some(DocumentKind::Pdf) => {
                info!("Processing PDF document: {}", path.display());
                let bytes = fs::read(path)
                    .with_context(|| format!("Failed to read PDF file: {}", path.display()))?;
                let pages = extract_pdf_pages(&bytes)
                    .with_context(|| format!("Failed to extract text from PDF: {}", path.display()))?;
                Ok(paginate(pages, &title, folder_id))
            }
            Some(DocumentKind::Text) => {
                info!("Processing text document: {}", path.display());
                let content = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read text file: {}", path.display()))?;
                Ok(vec![Document::new(content, &title, None, folder_id)])
            }
            None => Err(anyhow::anyhow!(
                "Unsupported document format: {}. Only text and PDF files are supported.",
                mime_type
            )),
        }
    }
}

/// The two kinds of documents a folder load considers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Text,
    Pdf,
}

impl DocumentKind {
    pub fn from_mime(mime_type: &str) -> Option<Self> {
        match mime_type {
            mime if mime.starts_with("application/pdf") => Some(DocumentKind::Pdf),
            mime if mime.starts_with("text/") => Some(DocumentKind::Text),
            _ => None,
        }
    }
}

/// Extract the text of every page of a PDF held in memory
pub fn extract_pdf_pages(bytes: &[u8]) -> Result<Vec<String>> {
    let content = pdf_extract::extract_text_from_mem(bytes)?;
    Ok(split_pages(&content))
}

/// Turn per-page texts into documents, numbering pages from 1 and skipping blank pages
pub fn paginate(pages: Vec<String>, title: &str, folder_id: &str) -> Vec<Document> {
    let documents: Vec<Document> = pages
        .into_iter()
        .enumerate()
        .filter(|(_, text)| !text.is_empty())
        .map(|(idx, text)| Document::new(text, title, Some(idx as u32 + 1), folder_id))
        .collect();

    if documents.is_empty() {
        warn!("Extracted PDF content of {} is empty", title);
    }

    documents
}

/// Split extracted PDF text on page breaks, normalizing each page
fn split_pages(content: &str) -> Vec<String> {
    content.split(FORM_FEED).map(normalize_whitespace).collect()
}

/// Normalize whitespace in text (remove multiple consecutive spaces, newlines, etc.)
fn normalize_whitespace(text: &str) -> String {
    let result = text.replace('\r', "");

    let mut prev_char = ' ';
    let mut newline_count = 0;
    let mut normalized = String::with_capacity(result.len());

    for c in result.chars() {
        if c == '\n' {
            newline_count += 1;
            continue;
        }

        if newline_count > 0 {
            // At most one blank line survives as a paragraph break
            normalized.push_str(if newline_count >= 2 { "\n\n" } else { "\n" });
            newline_count = 0;
        }

        if !(c == ' ' && prev_char == ' ') {
            normalized.push(c);
        }
        prev_char = c;
    }

    normalized.trim().to_string()
}
