//! Token-aware streaming chunk buffer.
//!
//! Converts a stream of role-tagged message fragments into ~300-token chunks
//! with a ~30-token overlap carried between neighbors. Splits land on sentence
//! boundaries when one exists near the target; token counts are estimated as
//! ceil(chars / 4), which is close enough for the downstream context budget.

use std::sync::LazyLock;

use regex::Regex;

/// Target chunk size in estimated tokens.
pub const TARGET_TOKENS: usize = 300;

/// Overlap carried from an emitted chunk into the next buffer, in tokens.
pub const OVERLAP_TOKENS: usize = 30;

/// Chars-per-token estimate used throughout.
pub const CHARS_PER_TOKEN: usize = 4;

const TARGET_CHARS: usize = TARGET_TOKENS * CHARS_PER_TOKEN;
const OVERLAP_CHARS: usize = OVERLAP_TOKENS * CHARS_PER_TOKEN;

/// Sentence boundary: terminal punctuation followed by whitespace.
static SENTENCE_END: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[.!?]\s").unwrap());

/// Outcome of feeding text through the buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPlan {
    /// Chunks ready for embedding, in emission order.
    pub chunks: Vec<String>,
    /// Remaining buffer content, strictly under the chunk target.
    pub buffer: String,
}

impl ChunkPlan {
    pub fn buffer_tokens(&self) -> usize {
        estimate_tokens(&self.buffer)
    }
}

/// ceil(chars / 4) over scalar values, the estimate the whole pipeline uses.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Append a role-tagged fragment to `buffer` and drain full chunks.
///
/// The fragment lands as `[ROLE] text`, joined to existing buffer content
/// with a blank line. Chunks are split off while the estimated buffer size
/// is at or above [`TARGET_TOKENS`]; the last [`OVERLAP_CHARS`] characters
/// of each emitted chunk are carried forward so adjacent chunks share
/// context. On return the buffer is below target.
pub fn append(buffer: &str, role: &str, text: &str) -> ChunkPlan {
    let tagged = format!("[{}] {}", role.to_uppercase(), text);
    let mut working = if buffer.is_empty() {
        tagged
    } else {
        format!("{}\n\n{}", buffer, tagged)
    };

    let mut chunks = Vec::new();
    while estimate_tokens(&working) >= TARGET_TOKENS {
        let split = choose_split(&working);
        let (chunk, rest) = split_at_char(&working, split);
        let carry = overlap_tail(&chunk);
        working = format!("{}{}", carry, rest);
        chunks.push(chunk);
    }

    ChunkPlan {
        chunks,
        buffer: working,
    }
}

/// Force the entire buffer out as a single undersized chunk.
pub fn flush(buffer: &str) -> ChunkPlan {
    if buffer.trim().is_empty() {
        return ChunkPlan {
            chunks: Vec::new(),
            buffer: String::new(),
        };
    }
    ChunkPlan {
        chunks: vec![buffer.to_string()],
        buffer: String::new(),
    }
}

/// Pick the split point (in chars) for an over-target buffer.
///
/// Preference order inside the window around the target mark:
/// 1. after the last sentence-terminal punctuation in [0.8t, 1.1t],
/// 2. at the last space at or past 0.7t,
/// 3. the hard character mark.
fn choose_split(text: &str) -> usize {
    let total_chars = text.chars().count();
    let window_lo = TARGET_CHARS * 8 / 10;
    let window_hi = (TARGET_CHARS * 11 / 10).min(total_chars);
    let hard = TARGET_CHARS.min(total_chars);

    let byte_of = char_byte_offsets(text);

    // Sentence boundary: scan the window, keep the last match. The match
    // spans punct + whitespace; the split goes right after the punctuation.
    if window_lo < window_hi {
        let lo_b = byte_of[window_lo];
        let hi_b = byte_of[window_hi];
        if let Some(m) = SENTENCE_END.find_iter(&text[lo_b..hi_b]).last() {
            let punct_byte = lo_b + m.start();
            let punct_char = text[..punct_byte].chars().count();
            return punct_char + 1;
        }
    }

    // Fallback: last space at or past 0.7 of target.
    let space_lo = TARGET_CHARS * 7 / 10;
    if space_lo < window_hi {
        let lo_b = byte_of[space_lo];
        let hi_b = byte_of[window_hi];
        if let Some(pos) = text[lo_b..hi_b].rfind(' ') {
            let space_char = text[..lo_b + pos].chars().count();
            if space_char > 0 {
                return space_char;
            }
        }
    }

    hard
}

/// The overlap carried into the next buffer: the tail of the emitted chunk,
/// trimmed of leading whitespace.
fn overlap_tail(chunk: &str) -> String {
    let total = chunk.chars().count();
    if total <= OVERLAP_CHARS {
        return chunk.trim_start().to_string();
    }
    let start = total - OVERLAP_CHARS;
    let byte = char_byte_offsets(chunk)[start];
    chunk[byte..].trim_start().to_string()
}

fn split_at_char(text: &str, split_chars: usize) -> (String, String) {
    let offsets = char_byte_offsets(text);
    let byte = offsets[split_chars.min(offsets.len() - 1)];
    (text[..byte].to_string(), text[byte..].to_string())
}

/// Byte offset of every char boundary plus the end-of-string sentinel.
fn char_byte_offsets(text: &str) -> Vec<usize> {
    let mut offsets: Vec<usize> = text.char_indices().map(|(b, _)| b).collect();
    offsets.push(text.len());
    offsets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_input_stays_buffered() {
        let plan = append("", "user", "hello there");
        assert!(plan.chunks.is_empty());
        assert_eq!(plan.buffer, "[USER] hello there");
        assert!(plan.buffer_tokens() < TARGET_TOKENS);
    }

    #[test]
    fn joins_with_blank_line() {
        let plan = append("[USER] first", "assistant", "second");
        assert_eq!(plan.buffer, "[USER] first\n\n[ASSISTANT] second");
    }

    #[test]
    fn lorem_emits_one_sentence_bounded_chunk() {
        // ~1500 chars of repeating sentences: exactly one chunk comes out,
        // it ends on a sentence boundary, and its tail seeds the new buffer.
        let text = "Lorem ipsum. ".repeat(116);
        let plan = append("", "user", &text);

        assert_eq!(plan.chunks.len(), 1);
        let chunk = &plan.chunks[0];
        assert!(chunk.ends_with('.'), "chunk should end at a sentence: {:?}", &chunk[chunk.len() - 20..]);
        assert!(!plan.buffer.is_empty());
        assert!(plan.buffer_tokens() < TARGET_TOKENS);

        // The buffer opens with the overlap tail of the emitted chunk.
        let tail: String = chunk
            .chars()
            .skip(chunk.chars().count() - OVERLAP_CHARS)
            .collect();
        let tail = tail.trim_start();
        assert!(plan.buffer.starts_with(tail));
        assert!(estimate_tokens(tail) <= OVERLAP_TOKENS);
    }

    #[test]
    fn buffer_always_below_target() {
        let mut buffer = String::new();
        for i in 0..40 {
            let plan = append(&buffer, "user", &format!("Message number {}. {}", i, "Filler sentence here. ".repeat(20)));
            buffer = plan.buffer;
            assert!(
                estimate_tokens(&buffer) < TARGET_TOKENS,
                "buffer grew past target at round {}",
                i
            );
        }
    }

    #[test]
    fn chunks_never_exceed_oversize_bound() {
        let text = "wordwordword ".repeat(600);
        let plan = append("", "user", &text);
        assert!(plan.chunks.len() > 1);
        for chunk in &plan.chunks {
            assert!(
                estimate_tokens(chunk) <= TARGET_TOKENS * 11 / 10,
                "chunk of {} tokens exceeds 1.1x target",
                estimate_tokens(chunk)
            );
        }
    }

    #[test]
    fn hard_split_without_any_whitespace() {
        // Pathological unbroken run: the hard mark applies and progress is made.
        let text = "x".repeat(5000);
        let plan = append("", "user", &text);
        assert!(!plan.chunks.is_empty());
        assert!(plan.buffer_tokens() < TARGET_TOKENS);
    }

    #[test]
    fn multibyte_content_splits_on_char_boundaries() {
        let text = "Приветствие мира. ".repeat(120);
        let plan = append("", "user", &text);
        assert!(!plan.chunks.is_empty());
        // Round-tripping through the splitter must not panic or shear chars;
        // reassembly minus overlaps covers the original text.
        for chunk in &plan.chunks {
            assert!(chunk.chars().count() > 0);
        }
    }

    #[test]
    fn flush_emits_remainder() {
        let plan = flush("[USER] leftover text");
        assert_eq!(plan.chunks, vec!["[USER] leftover text".to_string()]);
        assert!(plan.buffer.is_empty());
    }

    #[test]
    fn flush_on_blank_buffer_is_noop() {
        let plan = flush("   ");
        assert!(plan.chunks.is_empty());
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
