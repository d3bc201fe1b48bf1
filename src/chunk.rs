//! Token-estimate text chunker.
//!
//! Splits input text into size-bounded pieces along paragraph boundaries,
//! falling back to sentence boundaries for oversized paragraphs, then fuses
//! undersized pieces with their right neighbor. Deterministic and
//! order-preserving: the concatenation of the output reproduces the input's
//! non-whitespace content.
//!
//! Token counts are estimated as `chars / 4`; the provider reports exact
//! counts after the fact.

/// Approximate chars-per-token ratio used for all estimates.
const CHARS_PER_TOKEN: usize = 4;

/// Bounds for [`split_text`].
#[derive(Debug, Clone, Copy)]
pub struct ChunkingConfig {
    /// Chunks estimated below this are fused with their right neighbor.
    pub min_tokens: usize,
    /// Paragraphs estimated above this are split on sentence boundaries.
    pub max_tokens: usize,
    /// Inputs estimated below this are returned whole.
    pub no_chunk_threshold: usize,
}

/// Estimate the token count of a piece of text.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / CHARS_PER_TOKEN
}

/// Split `text` into ordered chunks per the configured bounds.
///
/// Rules, applied in order: an input that trims to empty yields nothing;
/// an input under `no_chunk_threshold` is returned unchanged; otherwise the
/// text splits on blank lines, oversized paragraphs split again on
/// sentence terminators (`.`, `!`, `?`, `;`, or `--` followed by
/// whitespace), and a final left-to-right pass fuses runts below
/// `min_tokens` into their right neighbor. The last chunk is never dropped,
/// however small.
pub fn split_text(text: &str, config: &ChunkingConfig) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    if estimate_tokens(text) < config.no_chunk_threshold {
        return vec![text.to_string()];
    }

    let mut chunks: Vec<String> = Vec::new();
    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        if estimate_tokens(trimmed) > config.max_tokens {
            for sentence in split_sentences(trimmed) {
                let sentence = sentence.trim();
                if !sentence.is_empty() {
                    chunks.push(sentence.to_string());
                }
            }
        } else {
            chunks.push(trimmed.to_string());
        }
    }

    combine_small(chunks, config.min_tokens)
}

/// Split on sentence terminators followed by whitespace. The terminator
/// stays with the sentence to its left.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let bytes = text.as_bytes();
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        let boundary_end = match bytes[i] {
            b'.' | b'!' | b'?' | b';' => i + 1,
            b'-' if i + 1 < bytes.len() && bytes[i + 1] == b'-' => i + 2,
            _ => {
                i += 1;
                continue;
            }
        };

        // Only a terminator followed by whitespace ends a sentence;
        // "3.14" and "x--y" stay intact.
        if boundary_end < bytes.len() && bytes[boundary_end].is_ascii_whitespace() {
            pieces.push(&text[start..boundary_end]);
            start = boundary_end;
        }
        i = boundary_end;
    }

    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}

/// Left-to-right runt-fusion pass: while a chunk estimates below
/// `min_tokens` and is not the last, join it with its right neighbor by a
/// single space.
fn combine_small(chunks: Vec<String>, min_tokens: usize) -> Vec<String> {
    let mut combined: Vec<String> = Vec::with_capacity(chunks.len());
    let mut iter = chunks.into_iter();
    let mut current = match iter.next() {
        Some(c) => c,
        None => return Vec::new(),
    };

    for next in iter {
        if estimate_tokens(&current) < min_tokens {
            current.push(' ');
            current.push_str(&next);
        } else {
            combined.push(std::mem::replace(&mut current, next));
        }
    }
    combined.push(current);
    combined
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(min: usize, max: usize, threshold: usize) -> ChunkingConfig {
        ChunkingConfig {
            min_tokens: min,
            max_tokens: max,
            no_chunk_threshold: threshold,
        }
    }

    #[test]
    fn empty_and_whitespace_yield_nothing() {
        let c = config(5, 50, 10);
        assert!(split_text("", &c).is_empty());
        assert!(split_text("   \n\n\t  ", &c).is_empty());
    }

    #[test]
    fn short_input_returned_unchanged() {
        let c = config(5, 50, 100);
        let text = "First paragraph.\n\nSecond paragraph.";
        assert_eq!(split_text(text, &c), vec![text.to_string()]);
    }

    #[test]
    fn splits_on_blank_lines() {
        let c = config(0, 50, 0);
        let text = "First paragraph here.\n\nSecond paragraph here.\n\n\nThird one.";
        let chunks = split_text(text, &c);
        assert_eq!(
            chunks,
            vec![
                "First paragraph here.".to_string(),
                "Second paragraph here.".to_string(),
                "Third one.".to_string(),
            ]
        );
    }

    #[test]
    fn oversized_paragraph_splits_on_sentences() {
        // max_tokens = 5 => 20 chars; each sentence is longer than that.
        let c = config(0, 5, 0);
        let text = "The first sentence of many words. Another sentence follows here! A third one; and a fourth?";
        let chunks = split_text(text, &c);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0], "The first sentence of many words.");
        assert_eq!(chunks[1], "Another sentence follows here!");
        assert_eq!(chunks[2], "A third one;");
        assert_eq!(chunks[3], "and a fourth?");
    }

    #[test]
    fn double_dash_is_a_boundary() {
        let c = config(0, 1, 0);
        let chunks = split_text("alpha section-- beta section", &c);
        assert_eq!(chunks, vec!["alpha section--", "beta section"]);
    }

    #[test]
    fn decimal_points_do_not_split() {
        let c = config(0, 2, 0);
        let chunks = split_text("pi is 3.14159 approximately", &c);
        assert_eq!(chunks, vec!["pi is 3.14159 approximately"]);
    }

    #[test]
    fn runts_fuse_rightward() {
        // min_tokens = 5 => anything under 20 chars fuses right.
        let c = config(5, 1000, 0);
        let text = "Tiny.\n\nAlso small.\n\nThis paragraph is comfortably long enough to stand alone.";
        let chunks = split_text(text, &c);
        assert_eq!(
            chunks,
            vec!["Tiny. Also small. This paragraph is comfortably long enough to stand alone."]
        );
    }

    #[test]
    fn final_runt_survives() {
        let c = config(5, 1000, 0);
        let text = "This opening paragraph is comfortably long enough to stand alone.\n\nTail.";
        let chunks = split_text(text, &c);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1], "Tail.");
    }

    #[test]
    fn deterministic() {
        let c = config(3, 8, 2);
        let text = "Alpha beta gamma delta. Epsilon zeta eta theta!\n\nIota kappa lambda mu; nu xi omicron pi.";
        assert_eq!(split_text(text, &c), split_text(text, &c));
    }

    #[test]
    fn preserves_content_order() {
        let c = config(0, 4, 0);
        let text = "One two three four. Five six seven eight. Nine ten eleven twelve.";
        let chunks = split_text(text, &c);
        let rejoined: Vec<&str> = chunks
            .iter()
            .flat_map(|c| c.split_whitespace())
            .collect();
        let original: Vec<&str> = text.split_whitespace().collect();
        assert_eq!(rejoined, original);
    }
}
