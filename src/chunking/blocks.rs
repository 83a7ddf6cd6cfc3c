//! Markdown block splitting and size-bounded merging.
//!
//! Lengths are measured in characters, never bytes, so slicing an oversized
//! block can not split a UTF-8 sequence.

use once_cell::sync::Lazy;
use regex::Regex;

static HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"^#{1,6}\s+").expect("valid heading regex"));
static BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*\n").expect("valid paragraph regex"));

/// Separator inserted between blocks merged into the same chunk.
const BLOCK_JOINER: &str = "\n\n";

/// Split markdown into logical blocks.
///
/// Heading lines start a new section, and each section is split into
/// paragraphs on blank-line runs. Paragraphs are trimmed and empty ones are
/// dropped, so a heading stays glued to the lines that follow it until the
/// next blank line.
pub fn get_blocks(markdown: &str) -> Vec<String> {
    let mut sections: Vec<String> = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in markdown.split('\n') {
        if HEADING.is_match(line) && !current.is_empty() {
            sections.push(current.join("\n").trim().to_string());
            current = vec![line];
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        sections.push(current.join("\n").trim().to_string());
    }

    sections
        .iter()
        .flat_map(|section| BLANK_LINES.split(section))
        .map(str::trim)
        .filter(|paragraph| !paragraph.is_empty())
        .map(str::to_string)
        .collect()
}

/// Pack blocks into chunks of roughly `target_size` characters.
///
/// Neighbouring blocks are joined while the result stays within
/// `target_size`. A block longer than `max_size` is cut into consecutive
/// `max_size` pieces; a block between the two limits is kept whole.
pub fn merge_blocks(blocks: &[String], target_size: usize, max_size: usize) -> Vec<String> {
    let mut merged = Vec::new();
    let mut buffer = String::new();
    let mut buffer_len = 0usize;

    for block in blocks {
        let block_len = block.chars().count();
        let candidate_len = if buffer.is_empty() {
            block_len
        } else {
            buffer_len + BLOCK_JOINER.len() + block_len
        };

        if candidate_len <= target_size {
            if !buffer.is_empty() {
                buffer.push_str(BLOCK_JOINER);
            }
            buffer.push_str(block);
            buffer_len = candidate_len;
            continue;
        }

        if !buffer.is_empty() {
            merged.push(std::mem::take(&mut buffer));
            buffer_len = 0;
        }

        if block_len > max_size {
            merged.extend(slice_chars(block, max_size));
        } else {
            buffer = block.clone();
            buffer_len = block_len;
        }
    }

    if !buffer.is_empty() {
        merged.push(buffer);
    }

    merged
}

/// Cut `text` into consecutive pieces of at most `size` characters.
fn slice_chars(text: &str, size: usize) -> Vec<String> {
    let size = size.max(1);
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(size)
        .map(|piece| piece.iter().collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_blocks_split_on_headings_and_blank_lines() {
        let md = "# Title\nLine 1\n\nLine 2\n## Subtitle\nAnother line\n\nFinal paragraph";
        assert_eq!(
            get_blocks(md),
            strings(&[
                "# Title\nLine 1",
                "Line 2",
                "## Subtitle\nAnother line",
                "Final paragraph"
            ])
        );
    }

    #[test]
    fn test_blocks_whitespace_only_input() {
        assert!(get_blocks("   \n \t  \n").is_empty());
        assert!(get_blocks("").is_empty());
    }

    #[test]
    fn test_blocks_consecutive_headings() {
        assert_eq!(
            get_blocks("# One\n## Two\n### Three"),
            strings(&["# One", "## Two", "### Three"])
        );
    }

    #[test]
    fn test_blocks_keep_list_with_heading() {
        assert_eq!(
            get_blocks("## Groceries\n- milk\n- eggs\n\nafter"),
            strings(&["## Groceries\n- milk\n- eggs", "after"])
        );
    }

    #[test]
    fn test_blocks_content_before_first_heading() {
        assert_eq!(
            get_blocks("intro text\n# Heading\nbody"),
            strings(&["intro text", "# Heading\nbody"])
        );
    }

    #[test]
    fn test_blocks_hash_without_space_is_not_heading() {
        assert_eq!(get_blocks("#tag line\n####### seven"), strings(&["#tag line\n####### seven"]));
    }

    #[test]
    fn test_blocks_collapse_blank_line_runs() {
        assert_eq!(get_blocks("a\n\n  \n\t\n\nb"), strings(&["a", "b"]));
    }

    #[test]
    fn test_merge_small_blocks() {
        assert_eq!(
            merge_blocks(&strings(&["alpha", "beta", "gamma"]), 30, 100),
            strings(&["alpha\n\nbeta\n\ngamma"])
        );
    }

    #[test]
    fn test_merge_flushes_when_target_exceeded() {
        assert_eq!(
            merge_blocks(&strings(&["aaa", "bbb", "cccccccc"]), 12, 10),
            strings(&["aaa\n\nbbb", "cccccccc"])
        );
    }

    #[test]
    fn test_merge_slices_oversized_block() {
        let block = "x".repeat(25);
        assert_eq!(
            merge_blocks(&[block], 20, 10),
            vec!["x".repeat(10), "x".repeat(10), "x".repeat(5)]
        );
    }

    #[test]
    fn test_merge_keeps_block_between_target_and_max_whole() {
        let big = "y".repeat(15);
        let merged = merge_blocks(&strings(&["a", &big, "b"]), 10, 20);
        assert_eq!(merged, vec!["a".to_string(), big, "b".to_string()]);
    }

    #[test]
    fn test_merge_slices_by_characters() {
        let block = "é".repeat(7);
        let merged = merge_blocks(&[block], 3, 3);
        assert_eq!(merged, vec!["ééé".to_string(), "ééé".to_string(), "é".to_string()]);
    }

    #[test]
    fn test_merge_empty_input() {
        assert!(merge_blocks(&[], 10, 20).is_empty());
    }
}
