//! Message splitting for the transport's 4096-character cap.

use crate::config::TRANSPORT_MESSAGE_MAX;

/// Split `text` into chunks of at most `TRANSPORT_MESSAGE_MAX` characters.
///
/// Splits at the last newline within the window, falling back to the last
/// space, then to a hard cut. Chunks that are empty after trimming are
/// dropped.
pub fn split_message(text: &str) -> Vec<String> {
    split_with_limit(text, TRANSPORT_MESSAGE_MAX)
}

pub fn split_with_limit(text: &str, limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut remaining = text;

    while remaining.len() > limit {
        // Byte-window end, pulled back to a char boundary.
        let mut window = limit;
        while !remaining.is_char_boundary(window) {
            window -= 1;
        }
        let split_at = remaining[..window]
            .rfind('\n')
            .or_else(|| remaining[..window].rfind(' '))
            .unwrap_or(window);
        // A delimiter at position 0 would make no progress.
        let split_at = if split_at == 0 { window } else { split_at };

        push_non_empty(&mut chunks, &remaining[..split_at]);
        remaining = remaining[split_at..].trim_start();
    }
    push_non_empty(&mut chunks, remaining);

    chunks
}

fn push_non_empty(chunks: &mut Vec<String>, chunk: &str) {
    let trimmed = chunk.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_single_chunk() {
        assert_eq!(split_message("Hello, world!"), vec!["Hello, world!"]);
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(split_message("").is_empty());
        assert!(split_message("   \n  ").is_empty());
    }

    #[test]
    fn splits_on_last_newline_in_window() {
        let first = "a".repeat(3000);
        let second = "b".repeat(3000);
        let chunks = split_with_limit(&format!("{first}\n{second}"), 4096);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], first);
        assert_eq!(chunks[1], second);
    }

    #[test]
    fn falls_back_to_space() {
        let first = "a".repeat(3000);
        let second = "b".repeat(3000);
        let chunks = split_with_limit(&format!("{first} {second}"), 4096);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], first);
    }

    #[test]
    fn hard_cut_when_no_delimiter() {
        let text = "x".repeat(10_000);
        let chunks = split_with_limit(&text, 4096);
        assert_eq!(chunks.len(), 3);
        for c in &chunks {
            assert!(c.len() <= 4096);
        }
    }

    #[test]
    fn all_chunks_non_empty_after_trim() {
        let text = format!("{}\n\n   \n{}", "a".repeat(4090), "b".repeat(100));
        for c in split_with_limit(&text, 4096) {
            assert!(!c.trim().is_empty());
        }
    }

    #[test]
    fn multibyte_text_splits_on_char_boundary() {
        let text = "é".repeat(5000); // 2 bytes each
        let chunks = split_with_limit(&text, 4096);
        assert!(chunks.len() >= 2);
        for c in &chunks {
            assert!(c.len() <= 4096);
        }
    }
}
