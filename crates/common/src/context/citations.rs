//! Citation framing, parsing and de-duplication
//!
//! The answer model ends its output with `|||SOURCES|||` followed by the
//! comma separated names of the sources it used. The delimiter is plain
//! text, so while streaming it can arrive split across increments.

use super::RetrievedContext;
use std::collections::HashSet;

/// Separates the user-facing answer from the cited source list
pub const SOURCES_DELIMITER: &str = "|||SOURCES|||";

/// Incremental scanner that forwards only pre-delimiter text.
///
/// Holds back a tail as long as the delimiter until it is clear the tail
/// cannot start one. After the delimiter is seen nothing more is forwarded,
/// but every increment is still accumulated into [`full_text`](Self::full_text).
#[derive(Debug, Default)]
pub struct DelimiterScanner {
    pending: String,
    full_text: String,
    delimiter_seen: bool,
}

impl DelimiterScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next increment; returns text that is safe to show
    pub fn push(&mut self, increment: &str) -> Option<String> {
        self.full_text.push_str(increment);
        if self.delimiter_seen {
            return None;
        }

        self.pending.push_str(increment);

        if let Some(pos) = self.pending.find(SOURCES_DELIMITER) {
            self.delimiter_seen = true;
            let visible = self.pending[..pos].to_string();
            self.pending.clear();
            return non_empty(visible);
        }

        if self.pending.len() <= SOURCES_DELIMITER.len() {
            return None;
        }

        let mut cut = self.pending.len() - SOURCES_DELIMITER.len();
        while !self.pending.is_char_boundary(cut) {
            cut -= 1;
        }
        non_empty(self.pending.drain(..cut).collect())
    }

    /// Flush the held-back tail once the stream has ended
    pub fn finish(&mut self) -> Option<String> {
        if self.delimiter_seen {
            return None;
        }
        non_empty(std::mem::take(&mut self.pending))
    }

    pub fn delimiter_seen(&self) -> bool {
        self.delimiter_seen
    }

    /// Everything received so far, delimiter and source list included
    pub fn full_text(&self) -> &str {
        &self.full_text
    }
}

fn non_empty(text: String) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Raw model output split into answer and cited source names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAnswer {
    pub answer: String,
    pub cited_sources: Vec<String>,
}

/// Split on the first delimiter; names are separated by `,` or `，`
pub fn parse_answer(raw: &str) -> ParsedAnswer {
    match raw.split_once(SOURCES_DELIMITER) {
        Some((answer, sources)) => ParsedAnswer {
            answer: answer.trim().to_string(),
            cited_sources: sources
                .split([',', '，'])
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect(),
        },
        None => ParsedAnswer {
            answer: raw.trim().to_string(),
            cited_sources: Vec::new(),
        },
    }
}

/// Contexts whose `source_file` was cited, all chunks kept, original order
pub fn select_cited(contexts: &[RetrievedContext], cited: &[String]) -> Vec<RetrievedContext> {
    let cited: HashSet<&str> = cited.iter().map(String::as_str).collect();
    contexts
        .iter()
        .filter(|ctx| cited.contains(ctx.source_file.as_str()))
        .cloned()
        .collect()
}

/// First chunk per source, keyed by URL when present and file name otherwise
pub fn dedup_for_display(contexts: &[RetrievedContext]) -> Vec<RetrievedContext> {
    let mut seen = HashSet::new();
    contexts
        .iter()
        .filter(|ctx| {
            let key = ctx
                .source_url
                .as_deref()
                .filter(|url| !url.is_empty())
                .unwrap_or(&ctx.source_file);
            seen.insert(key.to_string())
        })
        .cloned()
        .collect()
}
