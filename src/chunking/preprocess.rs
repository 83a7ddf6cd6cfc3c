//! Content preprocessing for chunking and change detection.
//!
//! - `hash`: SHA-256 fingerprint used both for chunk identity and the
//!   note-level indexing cursor
//! - `compose_body`: prepends the note title so title terms are searchable
//! - `normalize_markdown`: line-ending cleanup for imported text

use sha2::{Digest, Sha256};

/// Separator placed between the composed title line and the note content.
const TITLE_SEPARATOR: &str = "\n\n---\n:";

/// Number of hex characters of the chunk hash used in chunk ids.
pub const CHUNK_ID_HASH_PREFIX: usize = 12;

/// Compute the lowercase hex SHA-256 digest of `text`.
///
/// Always 64 characters long.
pub fn hash(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

/// Build the text that gets split into chunks.
///
/// A non-empty title is prepended as `Title: <title>` followed by a fixed
/// separator. Without a title the content is used as is.
pub fn compose_body(title: Option<&str>, content: &str) -> String {
    match title {
        Some(title) if !title.is_empty() => format!("Title: {title}{TITLE_SEPARATOR}{content}"),
        _ => content.to_string(),
    }
}

/// Derive a chunk id from its note id and the chunk's full hash.
pub fn chunk_id(note_id: &str, chunk_hash: &str) -> String {
    let prefix_len = CHUNK_ID_HASH_PREFIX.min(chunk_hash.len());
    format!("{}:{}", note_id, &chunk_hash[..prefix_len])
}

/// Convert CRLF line endings to LF and trim trailing whitespace.
pub fn normalize_markdown(md: &str) -> String {
    md.replace("\r\n", "\n").trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_of_empty_input() {
        assert_eq!(
            hash(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_hash_is_lowercase_hex() {
        for input in ["a", "hello world", "ünïcödé ✓", "# Title\n\nbody"] {
            let digest = hash(input);
            assert_eq!(digest.len(), 64);
            assert!(digest
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
        }
    }

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(hash("same text"), hash("same text"));
        assert_ne!(hash("text a"), hash("text b"));
    }

    #[test]
    fn test_compose_body_with_title() {
        assert_eq!(
            compose_body(Some("My Title"), "Some content"),
            "Title: My Title\n\n---\n:Some content"
        );
    }

    #[test]
    fn test_compose_body_preserves_multiline_content() {
        let content = "Line one\nLine two\n- bullet";
        assert_eq!(
            compose_body(Some("Special & Title"), content),
            format!("Title: Special & Title\n\n---\n:{content}")
        );
    }

    #[test]
    fn test_compose_body_without_title() {
        assert_eq!(compose_body(None, "body"), "body");
        assert_eq!(compose_body(Some(""), "body"), "body");
    }

    #[test]
    fn test_chunk_id_uses_hash_prefix() {
        let digest = hash("chunk text");
        let id = chunk_id("note-1", &digest);
        assert_eq!(id, format!("note-1:{}", &digest[..12]));
    }

    #[test]
    fn test_normalize_markdown() {
        assert_eq!(normalize_markdown("# Title\r\n\r\nSome text\r\n"), "# Title\n\nSome text");
        assert_eq!(
            normalize_markdown("Intro line\n  Detail line   \n\n   "),
            "Intro line\n  Detail line"
        );
        assert_eq!(normalize_markdown("Line A\nLine B"), "Line A\nLine B");
        assert_eq!(normalize_markdown("Single line content   "), "Single line content");
    }
}
