//! Query terms, highlighted snippets and the highlight deep-link payload.
//!
//! Positions are character offsets into the plain text, not byte offsets.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use once_cell::sync::Lazy;
use pulldown_cmark::{Event, Parser, TagEnd};
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const DEFAULT_SNIPPET_MAX_LENGTH: usize = 240;

static NON_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\p{L}\p{N}]+").expect("valid term regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighlightRange {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snippet {
    pub snippet: String,
    pub highlights: Vec<HighlightRange>,
    pub leading_ellipsis: bool,
    pub trailing_ellipsis: bool,
}

/// Everything needed to reopen a note at a search hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SearchHighlightPayload {
    pub note_id: String,
    pub chunk_id: String,
    pub snippet: String,
    pub highlights: Vec<HighlightRange>,
    pub leading_ellipsis: bool,
    pub trailing_ellipsis: bool,
    pub terms: Vec<String>,
}

/// Normalise a query into distinct highlight terms.
///
/// Tokens are lowercased, split on whitespace and stripped of everything that
/// is not a letter or digit. A query made only of punctuation yields itself.
pub fn get_terms(query: &str) -> Vec<String> {
    let lowered = query.to_lowercase();
    let mut terms: Vec<String> = Vec::new();

    for token in lowered.split_whitespace() {
        let term = NON_WORD.replace_all(token, "");
        if !term.is_empty() && !terms.iter().any(|t| t == term.as_ref()) {
            terms.push(term.into_owned());
        }
    }

    let trimmed = query.trim();
    if terms.is_empty() && !trimmed.is_empty() {
        terms.push(trimmed.to_lowercase());
    }

    terms
}

/// Render markdown as plain text, one line per block.
pub fn strip_markdown(markdown: &str) -> String {
    let mut out = String::with_capacity(markdown.len());

    for event in Parser::new(markdown) {
        match event {
            Event::Text(text) | Event::Code(text) => out.push_str(&text),
            Event::SoftBreak | Event::HardBreak => out.push('\n'),
            Event::End(
                TagEnd::Paragraph
                | TagEnd::Heading(_)
                | TagEnd::Item
                | TagEnd::CodeBlock
                | TagEnd::TableRow
                | TagEnd::TableHead,
            ) => {
                if !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            _ => {}
        }
    }

    out.trim().to_string()
}

/// One lowercase char per input char so offsets line up with the original.
fn lower_chars(text: &str) -> Vec<char> {
    text.chars()
        .map(|c| c.to_lowercase().next().unwrap_or(c))
        .collect()
}

fn find_from(haystack: &[char], needle: &[char], from: usize) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    (from..=haystack.len() - needle.len()).find(|&i| haystack[i..i + needle.len()] == *needle)
}

/// Cut a window of `max_length` chars around the first term match and
/// report where the terms fall inside it.
pub fn create_snippet(text: &str, terms: &[String], max_length: usize) -> Snippet {
    let content = strip_markdown(text);
    if content.is_empty() {
        return Snippet::default();
    }

    let chars: Vec<char> = content.chars().collect();
    let lower = lower_chars(&content);

    let mut ranges: Vec<HighlightRange> = Vec::new();
    for term in terms {
        let needle = lower_chars(term);
        let mut from = 0;
        while let Some(idx) = find_from(&lower, &needle, from) {
            ranges.push(HighlightRange {
                start: idx,
                end: idx + needle.len(),
            });
            from = idx + needle.len();
        }
    }
    ranges.sort_by_key(|r| r.start);

    let mut merged: Vec<HighlightRange> = Vec::new();
    for range in ranges {
        match merged.last_mut() {
            Some(prev) if range.start <= prev.end => prev.end = prev.end.max(range.end),
            _ => merged.push(range),
        }
    }

    let snippet_start = merged
        .first()
        .map_or(0, |first| first.start.saturating_sub(max_length / 4));
    let snippet_end = chars.len().min(snippet_start + max_length);
    let snippet_len = snippet_end - snippet_start;

    let highlights = merged
        .iter()
        .filter(|r| r.end > snippet_start && r.start < snippet_end)
        .map(|r| HighlightRange {
            start: r.start.saturating_sub(snippet_start),
            end: (r.end - snippet_start).min(snippet_len),
        })
        .collect();

    Snippet {
        snippet: chars[snippet_start..snippet_end].iter().collect(),
        highlights,
        leading_ellipsis: snippet_start > 0,
        trailing_ellipsis: snippet_end < chars.len(),
    }
}

pub fn encode_highlight(payload: &SearchHighlightPayload) -> String {
    // Serializing plain strings, bools and integers cannot fail.
    let json = serde_json::to_vec(payload).unwrap_or_default();
    URL_SAFE_NO_PAD.encode(json)
}

/// `None` for anything that is not a well-formed payload.
pub fn decode_highlight(value: &str) -> Option<SearchHighlightPayload> {
    let bytes = URL_SAFE_NO_PAD.decode(value.trim()).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Render a snippet as text, wrapping highlights in `open`/`close` and
/// adding ellipses where the snippet was cut.
pub fn render_snippet(snippet: &str, highlights: &[HighlightRange], leading: bool, trailing: bool, open: &str, close: &str) -> String {
    let chars: Vec<char> = snippet.chars().collect();
    let len = chars.len();

    let mut ordered: Vec<HighlightRange> = highlights
        .iter()
        .map(|r| HighlightRange {
            start: r.start.min(len),
            end: r.end.min(len),
        })
        .filter(|r| r.end > r.start)
        .collect();
    ordered.sort_by_key(|r| r.start);

    let mut out = String::new();
    if leading {
        out.push_str("... ");
    }

    let mut cursor = 0;
    for range in ordered {
        // Overlapping ranges only render their uncovered tail.
        let start = range.start.max(cursor);
        if range.end <= start {
            continue;
        }
        out.extend(&chars[cursor..start]);
        out.push_str(open);
        out.extend(&chars[start..range.end]);
        out.push_str(close);
        cursor = range.end;
    }
    out.extend(&chars[cursor..]);

    if trailing {
        out.push_str(" ...");
    }
    out
}

impl SearchHighlightPayload {
    pub fn render(&self, open: &str, close: &str) -> String {
        render_snippet(
            &self.snippet,
            &self.highlights,
            self.leading_ellipsis,
            self.trailing_ellipsis,
            open,
            close,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn highlighted(result: &Snippet) -> Vec<String> {
        let chars: Vec<char> = result.snippet.chars().collect();
        result
            .highlights
            .iter()
            .map(|r| chars[r.start..r.end].iter().collect::<String>().to_lowercase())
            .collect()
    }

    #[test]
    fn test_get_terms_normalizes() {
        assert_eq!(get_terms("Alpha alpha!!! Beta... 123??? Beta"), vec!["alpha", "beta", "123"]);
    }

    #[test]
    fn test_get_terms_fallback() {
        assert_eq!(get_terms("***"), vec!["***"]);
        assert!(get_terms("   ").is_empty());
        assert_eq!(get_terms("  Straße  "), vec!["straße"]);
    }

    #[test]
    fn test_snippet_highlights_every_term() {
        let terms = vec!["alpha".to_string(), "beta".to_string()];
        let result = create_snippet("Alpha beta alpha gamma", &terms, 240);

        assert_eq!(result.snippet, "Alpha beta alpha gamma");
        assert!(!result.leading_ellipsis);
        assert!(!result.trailing_ellipsis);
        assert_eq!(highlighted(&result), vec!["alpha", "beta", "alpha"]);
    }

    #[test]
    fn test_snippet_strips_markdown() {
        let result = create_snippet("# Title\n\n**Alpha** body", &["alpha".to_string()], 24);

        assert_eq!(result.snippet, "Title\nAlpha body");
        assert!(!result.snippet.contains('#'));
        assert_eq!(highlighted(&result), vec!["alpha"]);
    }

    #[test]
    fn test_snippet_of_empty_text() {
        assert_eq!(create_snippet("", &["anything".to_string()], 240), Snippet::default());
    }

    #[test]
    fn test_snippet_window_and_ellipses() {
        let text = format!("{} needle {}", "a".repeat(100), "b".repeat(100));
        let result = create_snippet(&text, &["needle".to_string()], 40);

        // window opens 10 chars (a quarter of 40) before the match
        assert_eq!(result.snippet.chars().count(), 40);
        assert!(result.leading_ellipsis);
        assert!(result.trailing_ellipsis);
        assert_eq!(result.highlights, vec![HighlightRange { start: 10, end: 16 }]);
    }

    #[test]
    fn test_snippet_without_matches_starts_at_zero() {
        let result = create_snippet("nothing to see here", &["zzz".to_string()], 7);
        assert_eq!(result.snippet, "nothing");
        assert!(result.highlights.is_empty());
        assert!(!result.leading_ellipsis);
        assert!(result.trailing_ellipsis);
    }

    #[test]
    fn test_snippet_merges_adjacent_and_clamps() {
        let terms = vec!["ab".to_string(), "cd".to_string(), "bc".to_string()];
        let result = create_snippet("abcd", &terms, 3);
        assert_eq!(result.snippet, "abc");
        assert_eq!(result.highlights, vec![HighlightRange { start: 0, end: 3 }]);
    }

    #[test]
    fn test_snippet_counts_characters() {
        let result = create_snippet("ééé café ééé", &["café".to_string()], 240);
        assert_eq!(highlighted(&result), vec!["café"]);
        assert_eq!(result.highlights[0], HighlightRange { start: 4, end: 8 });
    }

    #[test]
    fn test_payload_round_trip() {
        let payload = SearchHighlightPayload {
            note_id: "note-1".into(),
            chunk_id: "chunk-1".into(),
            snippet: "Snippet text".into(),
            highlights: vec![HighlightRange { start: 0, end: 6 }],
            leading_ellipsis: false,
            trailing_ellipsis: true,
            terms: vec!["term".into()],
        };

        let encoded = encode_highlight(&payload);
        assert!(!encoded.contains('+') && !encoded.contains('/') && !encoded.contains('='));
        assert_eq!(decode_highlight(&encoded), Some(payload));
    }

    #[test]
    fn test_decode_rejects_invalid_payloads() {
        let wrong_type = URL_SAFE_NO_PAD.encode(br#"{"noteId":123}"#);
        assert_eq!(decode_highlight(&wrong_type), None);

        let negative = URL_SAFE_NO_PAD.encode(
            br#"{"noteId":"n","chunkId":"c","snippet":"s","highlights":[{"start":-1,"end":2}],"leadingEllipsis":false,"trailingEllipsis":false,"terms":[]}"#,
        );
        assert_eq!(decode_highlight(&negative), None);

        assert_eq!(decode_highlight("%%%not base64"), None);
        assert_eq!(decode_highlight(""), None);
    }

    #[test]
    fn test_render_snippet() {
        let rendered = render_snippet(
            "Alpha beta",
            &[HighlightRange { start: 6, end: 10 }, HighlightRange { start: 0, end: 5 }],
            true,
            true,
            "[",
            "]",
        );
        assert_eq!(rendered, "... [Alpha] [beta] ...");
    }

    #[test]
    fn test_render_snippet_clamps_ranges() {
        let rendered = render_snippet("abc", &[HighlightRange { start: 1, end: 99 }], false, false, "<", ">");
        assert_eq!(rendered, "a<bc>");
        assert_eq!(render_snippet("abc", &[], false, false, "<", ">"), "abc");
    }
}
