// Plain-text extraction
// Turns uploaded text, Markdown and HTML files into the text that gets chunked

#[cfg(test)]
mod tests;

use pulldown_cmark::{Event, Parser, Tag, TagEnd};
use scraper::{ElementRef, Html, Selector};
use std::path::Path;
use tracing::debug;

use crate::{KbError, Result};

const UNWANTED_ELEMENTS: &str =
    "script, style, noscript, template, iframe, nav, header, footer, aside, button, form";
const MAIN_CONTENT: &str = "main, article, [role=main], #content, .content";
const BLOCK_ELEMENTS: &[&str] = &[
    "address", "article", "blockquote", "dd", "div", "dl", "dt", "figcaption", "figure", "h1",
    "h2", "h3", "h4", "h5", "h6", "hr", "li", "main", "ol", "p", "pre", "section", "table",
    "tbody", "td", "th", "thead", "tr", "ul",
];

/// Source format of an uploaded document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    PlainText,
    Markdown,
    Html,
}

impl DocumentKind {
    /// Guess the format from a file extension; anything unknown is plain text
    #[inline]
    pub fn from_path(path: &Path) -> Self {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("md" | "markdown") => Self::Markdown,
            Some("html" | "htm" | "xhtml") => Self::Html,
            _ => Self::PlainText,
        }
    }

    /// Short type tag stored as the document's `doc_type`
    #[inline]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PlainText => "txt",
            Self::Markdown => "md",
            Self::Html => "html",
        }
    }
}

impl std::fmt::Display for DocumentKind {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedText {
    /// Title found inside the document, if any
    pub title: Option<String>,
    pub text: String,
    pub kind: DocumentKind,
}

/// Extract plain text from raw document content
#[inline]
pub fn extract_text(raw: &str, kind: DocumentKind) -> Result<ExtractedText> {
    let (title, text) = match kind {
        DocumentKind::PlainText => (None, normalise_whitespace(raw)),
        DocumentKind::Markdown => markdown_to_text(raw),
        DocumentKind::Html => html_to_text(raw)?,
    };

    debug!(
        "Extracted {} chars of {} text (title: {:?})",
        text.chars().count(),
        kind,
        title
    );
    Ok(ExtractedText { title, text, kind })
}

/// Read a file and extract its text according to its extension
#[inline]
pub async fn extract_file(path: &Path) -> Result<ExtractedText> {
    let bytes = tokio::fs::read(path).await?;
    let raw = String::from_utf8(bytes).map_err(|_| {
        KbError::Validation(format!("{} is not valid UTF-8 text", path.display()))
    })?;
    extract_text(&raw, DocumentKind::from_path(path))
}

fn markdown_to_text(markdown: &str) -> (Option<String>, String) {
    let mut text = String::new();
    let mut title: Option<String> = None;
    let mut heading = String::new();
    let mut in_heading = false;

    for event in Parser::new(markdown) {
        match event {
            Event::Start(Tag::Heading { .. }) => {
                in_heading = true;
                heading.clear();
                push_break(&mut text);
            }
            Event::End(TagEnd::Heading(_)) => {
                in_heading = false;
                if title.is_none() && !heading.trim().is_empty() {
                    title = Some(heading.trim().to_string());
                }
                text.push('\n');
            }
            Event::Start(Tag::Item) => {
                if !text.is_empty() && !text.ends_with('\n') {
                    text.push('\n');
                }
                text.push_str("- ");
            }
            Event::Start(Tag::Paragraph | Tag::CodeBlock(_) | Tag::BlockQuote(_)) => {
                push_break(&mut text);
            }
            Event::End(TagEnd::Paragraph | TagEnd::CodeBlock | TagEnd::Item) => {
                text.push('\n');
            }
            Event::Text(chunk) | Event::Code(chunk) => {
                if in_heading {
                    heading.push_str(&chunk);
                }
                text.push_str(&chunk);
            }
            Event::SoftBreak | Event::HardBreak => text.push('\n'),
            Event::Rule => push_break(&mut text),
            _ => {}
        }
    }

    (title, normalise_whitespace(&text))
}

fn html_to_text(html: &str) -> Result<(Option<String>, String)> {
    let mut document = Html::parse_document(html);

    let title = first_text(&document, "title")?.or(first_text(&document, "h1")?);

    let unwanted = selector(UNWANTED_ELEMENTS)?;
    let unwanted_ids: Vec<_> = document.select(&unwanted).map(|el| el.id()).collect();
    for node_id in unwanted_ids {
        if let Some(mut node) = document.tree.get_mut(node_id) {
            node.detach();
        }
    }

    let main = selector(MAIN_CONTENT)?;
    let body = selector("body")?;
    let root = document
        .select(&main)
        .next()
        .or_else(|| document.select(&body).next())
        .unwrap_or_else(|| document.root_element());

    let mut text = String::new();
    collect_text(root, &mut text);
    Ok((title, normalise_whitespace(&text)))
}

fn collect_text(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        if let Some(child_element) = ElementRef::wrap(child) {
            let name = child_element.value().name();
            if name == "br" {
                out.push('\n');
                continue;
            }
            let block = BLOCK_ELEMENTS.contains(&name);
            if block {
                push_break(out);
            }
            collect_text(child_element, out);
            if block {
                push_break(out);
            }
        } else if let Some(text) = child.value().as_text() {
            out.push_str(&text.replace(['\n', '\r', '\t'], " "));
        }
    }
}

fn first_text(document: &Html, css: &str) -> Result<Option<String>> {
    let selector = selector(css)?;
    Ok(document
        .select(&selector)
        .map(|el| el.text().collect::<String>().trim().to_string())
        .find(|text| !text.is_empty()))
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css)
        .map_err(|e| KbError::Validation(format!("Invalid selector '{}': {}", css, e)))
}

fn push_break(out: &mut String) {
    if !out.is_empty() && !out.ends_with("\n\n") {
        out.push_str(if out.ends_with('\n') { "\n" } else { "\n\n" });
    }
}

/// Collapse runs of spaces inside lines and runs of blank lines between paragraphs
fn normalise_whitespace(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut blank_pending = false;

    for line in raw.lines() {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            blank_pending = !out.is_empty();
            continue;
        }
        if !out.is_empty() {
            out.push_str(if blank_pending { "\n\n" } else { "\n" });
        }
        out.push_str(&collapsed);
        blank_pending = false;
    }
    out
}
