//! Business-description extraction from raw filing documents.
//!
//! A filing arrives as markup-heavy HTML. Extraction strips tags and
//! boilerplate, locates the "Item 1. Business" section by its conventional
//! markers, and splits the result into bounded, overlapping passages ordered
//! by document position. A document whose business section cannot be located
//! or is too short yields zero passages; that is a skip, not an error.

use std::sync::OnceLock;

use regex::Regex;
use scraper::{ElementRef, Html};

use crate::types::{IndexError, RawDocument, TextPassage};

/// Sections shorter than this carry no usable business description.
const MIN_SECTION_CHARS: usize = 200;
/// Fallback window when no section marker is found.
const FALLBACK_CHARS: usize = 4_000;
/// Earliest acceptable sentence boundary, as a fraction of the passage window.
const BOUNDARY_FLOOR: f64 = 0.7;

const SECTION_START_MARKERS: [&str; 3] = ["ITEM 1.", "ITEM 1 -", "ITEM 1 BUSINESS"];
const SECTION_END_MARKERS: [&str; 2] = ["ITEM 1A", "ITEM 2"];
const SENTENCE_DELIMITERS: [&str; 4] = [". ", ".\n", "! ", "? "];

/// Passage sizing knobs.
#[derive(Clone, Debug)]
pub struct ExtractOptions {
    /// Maximum bytes per passage.
    pub max_passage_chars: usize,
    /// Overlap carried into the next passage to preserve context.
    pub overlap_chars: usize,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            max_passage_chars: 4_000,
            overlap_chars: 400,
        }
    }
}

/// Extracts ordered business-description passages from one raw filing.
pub fn extract(
    document: &RawDocument,
    options: &ExtractOptions,
) -> Result<Vec<TextPassage>, IndexError> {
    if document.content.trim().is_empty() {
        return Err(IndexError::Parse(format!(
            "empty document for {}",
            document.entity_id
        )));
    }
    let cleaned = strip_markup(&document.content);
    if cleaned.is_empty() {
        return Err(IndexError::Parse(format!(
            "no text content in {} filing for {}",
            document.form_type, document.entity_id
        )));
    }
    let section = business_section(&cleaned);
    if section.len() < MIN_SECTION_CHARS {
        tracing::debug!(
            entity = %document.entity_id,
            chars = section.len(),
            "business section too short, skipping"
        );
        return Ok(Vec::new());
    }
    Ok(split_passages(&document.entity_id, &section, options))
}

/// Strips tags, scripts, and styles, then collapses whitespace.
pub fn strip_markup(raw: &str) -> String {
    let document = Html::parse_document(raw);
    let mut text = String::new();
    for node in document.root_element().descendants() {
        let Some(fragment) = node.value().as_text() else {
            continue;
        };
        let in_boilerplate = node
            .ancestors()
            .filter_map(ElementRef::wrap)
            .any(|el| matches!(el.value().name(), "script" | "style"));
        if in_boilerplate {
            continue;
        }
        text.push_str(fragment);
        text.push(' ');
    }
    collapse_whitespace(&text)
}

fn collapse_whitespace(text: &str) -> String {
    static WS: OnceLock<Regex> = OnceLock::new();
    let ws = WS.get_or_init(|| Regex::new(r"\s+").expect("static regex"));
    ws.replace_all(text, " ").trim().to_string()
}

/// Locates the "Item 1. Business" section.
///
/// Falls back to the leading slice of the document when no marker is found;
/// many smaller filings describe the business up front without the item
/// heading.
fn business_section(text: &str) -> String {
    // ASCII uppercasing keeps byte offsets valid against the original text.
    let upper = text.to_ascii_uppercase();
    let Some(start) = SECTION_START_MARKERS
        .iter()
        .find_map(|marker| upper.find(marker))
    else {
        return clamp_chars(text, FALLBACK_CHARS);
    };

    let search_from = start + 1;
    let end = SECTION_END_MARKERS
        .iter()
        .filter_map(|marker| upper[search_from..].find(marker))
        .min()
        .map(|offset| offset + search_from);

    match end {
        Some(end) => text[start..end].trim().to_string(),
        None => clamp_chars(&text[start..], FALLBACK_CHARS),
    }
}

/// Truncates to at most `max` bytes on a char boundary.
fn clamp_chars(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.trim().to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].trim().to_string()
}

/// Splits section text into bounded passages with overlap, preferring to cut
/// at sentence boundaries past [`BOUNDARY_FLOOR`] of the window.
pub fn split_passages(entity_id: &str, text: &str, options: &ExtractOptions) -> Vec<TextPassage> {
    let max = options.max_passage_chars.max(1);
    let overlap = options.overlap_chars.min(max.saturating_sub(1));

    if text.len() <= max {
        return vec![TextPassage {
            entity_id: entity_id.to_string(),
            ordinal: 0,
            text: text.trim().to_string(),
        }];
    }

    let mut passages = Vec::new();
    let mut start = 0usize;
    let mut ordinal = 0usize;
    while start < text.len() {
        let mut end = (start + max).min(text.len());
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        if end == text.len() {
            push_passage(&mut passages, entity_id, &mut ordinal, &text[start..]);
            break;
        }

        let window = &text[start..end];
        let floor = (max as f64 * BOUNDARY_FLOOR) as usize;
        let cut = SENTENCE_DELIMITERS
            .iter()
            .filter_map(|delim| window.rfind(delim).map(|pos| pos + delim.len()))
            .filter(|pos| *pos >= floor)
            .max()
            .unwrap_or(window.len());

        push_passage(&mut passages, entity_id, &mut ordinal, &text[start..start + cut]);

        // Overlap keeps context across the boundary; always advance.
        let mut next = (start + cut).saturating_sub(overlap).max(start + 1);
        while next < text.len() && !text.is_char_boundary(next) {
            next += 1;
        }
        start = next;
    }
    passages
}

fn push_passage(
    passages: &mut Vec<TextPassage>,
    entity_id: &str,
    ordinal: &mut usize,
    text: &str,
) {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return;
    }
    passages.push(TextPassage {
        entity_id: entity_id.to_string(),
        ordinal: *ordinal,
        text: trimmed.to_string(),
    });
    *ordinal += 1;
}
