//! Splitting markdown notes into top-level sections.
//!
//! A section starts at a line beginning with a single `# ` heading marker and
//! runs up to the next such line (or the end of the document). Text before
//! the first heading belongs to no section.

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Top-level heading: `# ` at the start of a line, followed by the title.
pub const TOP_LEVEL_HEADER: &str = r"(?m)^# (.+)$";

/// Where a section begins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionBoundary {
    /// Byte offset of the heading line.
    pub start_offset: usize,

    /// Heading title without the `# ` marker.
    pub header: String,
}

/// A section's full text, heading included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    /// Byte offset of the heading line.
    pub start_offset: usize,

    /// Text from the heading up to the next heading.
    pub text: String,
}

impl Section {
    /// First line of the section, for display.
    pub fn title(&self) -> &str {
        self.text.lines().next().unwrap_or_default()
    }
}

/// Produces ordered section boundaries for a document.
pub trait SectionSplitter: Send + Sync {
    /// Find section boundaries, in document order.
    fn split(&self, document: &str) -> Vec<SectionBoundary>;

    /// Slice the document into sections.
    ///
    /// Boundaries sharing a start offset collapse into one and zero-length
    /// sections are skipped.
    fn sections(&self, document: &str) -> Vec<Section> {
        let mut starts: Vec<usize> = self
            .split(document)
            .into_iter()
            .map(|b| b.start_offset)
            .filter(|&offset| offset <= document.len())
            .collect();
        starts.dedup();

        let mut sections = Vec::with_capacity(starts.len());
        for (i, &start) in starts.iter().enumerate() {
            let end = starts.get(i + 1).copied().unwrap_or(document.len());
            if end <= start {
                continue;
            }
            if let Some(text) = document.get(start..end) {
                sections.push(Section {
                    start_offset: start,
                    text: text.to_string(),
                });
            }
        }
        sections
    }
}

/// Splits on markdown headings matched by a regular expression.
#[derive(Debug, Clone)]
pub struct HeaderSplitter {
    pattern: Regex,
}

impl HeaderSplitter {
    /// Split on top-level `# ` headings.
    pub fn new() -> Result<Self> {
        Self::with_pattern(TOP_LEVEL_HEADER)
    }

    /// Split on a custom heading pattern. The first capture group, if any,
    /// becomes the header text.
    pub fn with_pattern(pattern: &str) -> Result<Self> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }
}

impl SectionSplitter for HeaderSplitter {
    fn split(&self, document: &str) -> Vec<SectionBoundary> {
        self.pattern
            .captures_iter(document)
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                let header = caps.get(1).unwrap_or(whole).as_str();
                Some(SectionBoundary {
                    start_offset: whole.start(),
                    header: header.to_string(),
                })
            })
            .collect()
    }
}
