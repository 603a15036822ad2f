//! Document parser boundary
//!
//! Parsers turn a source file into a [`DocNode`] tree. The pipeline only needs
//! the text leaves, collected in document order by [`DocNode::text_leaves`].
//!
//! Supported inputs:
//! - Plain text and markdown (one leaf per paragraph)
//! - Structured-document JSON exports (`text` / `value` / `content` keys)
//! - PDF via `pdf-extract` when built with the `pdf` feature

use serde_json::Value;
use std::path::Path;

use crate::error::{RagError, Result};

/// Keys whose string values carry document text in JSON exports
const TEXT_KEYS: [&str; 3] = ["text", "value", "content"];

/// Page locator used when page structure is unavailable
pub const WHOLE_DOCUMENT_PAGE: &str = "all";

/// Provenance tag for extracted text
pub const CONTENT_TYPE_TEXT: &str = "text";

/// A node of a parsed document
#[derive(Debug, Clone, PartialEq)]
pub enum DocNode {
    Text { text: String },
    Container { children: Vec<DocNode> },
    Other,
}

impl DocNode {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn container(children: Vec<DocNode>) -> Self {
        Self::Container { children }
    }

    /// Non-blank text leaves in document order
    pub fn text_leaves(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Text { text } if !text.trim().is_empty() => out.push(text),
            Self::Text { .. } | Self::Other => {}
            Self::Container { children } => {
                for child in children {
                    child.collect_leaves(out);
                }
            }
        }
    }

    /// All text leaves joined by newlines
    pub fn flatten_text(&self) -> String {
        self.text_leaves().join("\n")
    }

    /// Build a tree from a structured-document JSON export.
    ///
    /// Object entries under a text key with a non-blank string value become
    /// text leaves; every other object or array becomes a container.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Object(map) => Self::container(
                map.iter()
                    .map(|(key, v)| match v {
                        Value::String(s) if TEXT_KEYS.contains(&key.as_str()) => {
                            if s.trim().is_empty() {
                                Self::Other
                            } else {
                                Self::text(s.clone())
                            }
                        }
                        other => Self::from_json(other),
                    })
                    .collect(),
            ),
            Value::Array(items) => Self::container(items.iter().map(Self::from_json).collect()),
            _ => Self::Other,
        }
    }
}

/// One unit of extracted text handed to the normalizer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedItem {
    pub content_type: String,
    pub content: String,
    pub page: String,
}

/// Flatten a parsed document into extraction items.
///
/// The whole document becomes a single item with the whole-document page
/// sentinel. A document without text yields no items.
pub fn extract_items(root: &DocNode) -> Vec<ExtractedItem> {
    let full_text = root.flatten_text();
    tracing::debug!("Extracted raw text length = {}", full_text.len());

    if full_text.trim().is_empty() {
        return Vec::new();
    }

    vec![ExtractedItem {
        content_type: CONTENT_TYPE_TEXT.to_string(),
        content: full_text,
        page: WHOLE_DOCUMENT_PAGE.to_string(),
    }]
}

/// Turns a source file into a document tree
pub trait DocumentParser: Send + Sync {
    fn parse(&self, path: &Path) -> Result<DocNode>;

    /// Name for logs
    fn name(&self) -> &str;
}

/// Plain text and markdown: blank-line separated paragraphs become leaves
pub struct PlainTextParser;

impl DocumentParser for PlainTextParser {
    fn parse(&self, path: &Path) -> Result<DocNode> {
        let bytes = std::fs::read(path)?;
        let content = String::from_utf8_lossy(&bytes);
        Ok(parse_paragraphs(&content))
    }

    fn name(&self) -> &str {
        "text"
    }
}

fn parse_paragraphs(content: &str) -> DocNode {
    let mut children = Vec::new();
    let mut current = String::new();

    for line in content.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                children.push(DocNode::text(std::mem::take(&mut current)));
            }
        } else {
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(line);
        }
    }
    if !current.is_empty() {
        children.push(DocNode::text(current));
    }

    DocNode::container(children)
}

/// JSON exports of structured documents
pub struct JsonTreeParser;

impl DocumentParser for JsonTreeParser {
    fn parse(&self, path: &Path) -> Result<DocNode> {
        let content = std::fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&content)
            .map_err(|e| RagError::Parse(format!("{}: {e}", path.display())))?;
        Ok(DocNode::from_json(&value))
    }

    fn name(&self) -> &str {
        "json"
    }
}

/// PDF text extraction via `pdf-extract`
#[cfg(feature = "pdf")]
pub struct PdfParser;

#[cfg(feature = "pdf")]
impl DocumentParser for PdfParser {
    fn parse(&self, path: &Path) -> Result<DocNode> {
        let text = pdf_extract::extract_text(path)
            .map_err(|e| RagError::Parse(format!("{}: {e}", path.display())))?;
        tracing::debug!("PDF extracted with pdf_extract: {} chars", text.len());
        Ok(parse_paragraphs(&text))
    }

    fn name(&self) -> &str {
        "pdf"
    }
}

/// Pick a parser from the file extension
pub fn parser_for_path(path: &Path) -> Result<Box<dyn DocumentParser>> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match ext.as_str() {
        "json" => Ok(Box::new(JsonTreeParser)),
        #[cfg(feature = "pdf")]
        "pdf" => Ok(Box::new(PdfParser)),
        #[cfg(not(feature = "pdf"))]
        "pdf" => Err(RagError::Parse(
            "PDF support not enabled. Rebuild with --features pdf".into(),
        )),
        "txt" | "md" | "markdown" | "text" | "" => Ok(Box::new(PlainTextParser)),
        other => Err(RagError::Parse(format!("Unsupported document type: .{other}"))),
    }
}
