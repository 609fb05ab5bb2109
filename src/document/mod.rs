
use fancy_regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use uuid::Uuid;

/// Separator inserted between OCR pages when combining them into one text.
pub const PAGE_SEPARATOR: char = '\n';

static HEADER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    #[expect(clippy::unwrap_used, reason = "pattern is a compile-time constant")]
    Regex::new(r"(?m)^(#{1,6})\s+(.+)$").unwrap()
});

/// A section detected from a markdown header in the combined document text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    /// Section heading with the leading `#` markers stripped and trimmed
    pub title: String,
    /// Byte offset where the header line starts
    pub start_index: usize,
    /// Byte offset where the section ends (start of the next section, or end of text)
    pub end_index: usize,
    /// Header level, 1 for `#` through 6 for `######`
    pub level: u8,
}

/// Maps a byte interval of the combined text back to a 1-based page number.
///
/// The intervals are contiguous and cover the whole text: the separator
/// between two pages is accounted to the page it follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageBoundary {
    pub page_number: u32,
    pub char_start: usize,
    pub char_end: usize,
}

/// A structured document produced from OCR page output.
///
/// Immutable once constructed; the chunker consumes it read-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedDocument {
    pub id: String,
    pub document_name: String,
    /// All page markdown concatenated with [`PAGE_SEPARATOR`]
    pub text: String,
    pub page_boundaries: Vec<PageBoundary>,
    pub sections: Vec<Section>,
}

/// A section-scoped slice of the document text handed to the chunker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionSpan<'a> {
    /// Title of the enclosing section, `None` for text before the first header
    pub title: Option<&'a str>,
    pub text: &'a str,
}

impl ParsedDocument {
    /// Build a document from ordered per-page markdown texts.
    ///
    /// Zero pages produce an empty document with no boundaries.
    #[inline]
    pub fn from_page_texts(document_name: &str, pages: &[String]) -> Self {
        let text = pages.join(&PAGE_SEPARATOR.to_string());

        let mut page_boundaries = Vec::with_capacity(pages.len());
        let mut char_pos = 0;
        for (i, page_text) in pages.iter().enumerate() {
            // The separator after each page belongs to that page's interval,
            // so the boundaries partition the full text.
            let separator_len = if i + 1 < pages.len() {
                PAGE_SEPARATOR.len_utf8()
            } else {
                0
            };
            let char_end = char_pos + page_text.len() + separator_len;
            page_boundaries.push(PageBoundary {
                page_number: i as u32 + 1,
                char_start: char_pos,
                char_end,
            });
            char_pos = char_end;
        }

        let sections = extract_sections(&text);

        Self {
            id: Uuid::new_v4().to_string(),
            document_name: document_name.to_string(),
            text,
            page_boundaries,
            sections,
        }
    }

    /// Resolve the 1-based page number containing a byte offset.
    ///
    /// Offsets at or past the last boundary resolve to the last page;
    /// a document without boundaries resolves to `None`.
    #[inline]
    pub fn page_at_offset(&self, offset: usize) -> Option<u32> {
        for page in &self.page_boundaries {
            if page.char_start <= offset && offset < page.char_end {
                return Some(page.page_number);
            }
        }

        self.page_boundaries
            .last()
            .filter(|last| offset >= last.char_end)
            .map(|last| last.page_number)
    }

    /// Split the text into section-scoped spans, in document order.
    ///
    /// Text before the first header (or the whole text when no headers were
    /// found) forms an implicit untitled span.
    #[inline]
    pub fn section_spans(&self) -> Vec<SectionSpan<'_>> {
        if self.sections.is_empty() {
            if self.text.is_empty() {
                return Vec::new();
            }
            return vec![SectionSpan {
                title: None,
                text: &self.text,
            }];
        }

        let mut spans = Vec::with_capacity(self.sections.len() + 1);

        let first_start = self.sections[0].start_index;
        if first_start > 0 {
            spans.push(SectionSpan {
                title: None,
                text: self.text.get(..first_start).unwrap_or_default(),
            });
        }

        for section in &self.sections {
            spans.push(SectionSpan {
                title: Some(section.title.as_str()),
                text: self
                    .text
                    .get(section.start_index..section.end_index)
                    .unwrap_or_default(),
            });
        }

        spans
    }
}

/// Extract section information from markdown headers.
///
/// Headers are `#` runs of length 1-6 anchored at line starts. A section ends
/// where the next one starts, or at end of text. Never fails: malformed input
/// simply yields fewer (or zero) sections.
#[inline]
pub fn extract_sections(text: &str) -> Vec<Section> {
    let mut sections: Vec<Section> = Vec::new();

    for capture in HEADER_PATTERN.captures_iter(text).flatten() {
        let (Some(whole), Some(hashes), Some(title)) =
            (capture.get(0), capture.get(1), capture.get(2))
        else {
            continue;
        };

        let level = u8::try_from(hashes.as_str().len()).unwrap_or(6);
        sections.push(Section {
            title: title.as_str().trim().to_string(),
            start_index: whole.start(),
            end_index: 0,
            level,
        });
    }

    let ends: Vec<usize> = sections
        .iter()
        .skip(1)
        .map(|s| s.start_index)
        .chain(std::iter::once(text.len()))
        .collect();
    for (section, end) in sections.iter_mut().zip(ends) {
        section.end_index = end;
    }

    sections
}
