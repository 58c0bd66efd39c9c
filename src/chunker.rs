//! Document chunking.
//!
//! Splits extracted text into overlapping spans sized for embedding. Spans
//! carry char offsets into the source text; adjacent spans overlap by the
//! configured amount and together cover the whole input. Splitting prefers a
//! paragraph break, then a sentence ending, and hard-cuts only when a single
//! semantic unit exceeds the window.

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// One chunk of a document, with char offsets into the extracted text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkSpan {
    /// Position within the document; matches offset order.
    pub ordinal: usize,
    /// Inclusive char offset of the span start.
    pub start: usize,
    /// Exclusive char offset of the span end.
    pub end: usize,
    pub text: String,
}

/// Split `text` into overlapping chunk spans.
///
/// Deterministic for identical input and configuration; an empty input
/// yields an empty sequence.
pub fn chunk(
    text: &str,
    max_chunk_size: usize,
    overlap: usize,
) -> Result<Vec<ChunkSpan>, EngineError> {
    if max_chunk_size == 0 {
        return Err(EngineError::Validation(
            "max_chunk_size must be positive".to_string(),
        ));
    }
    if overlap >= max_chunk_size {
        return Err(EngineError::Validation(format!(
            "overlap {} must be smaller than max_chunk_size {}",
            overlap, max_chunk_size
        )));
    }

    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();
    if total == 0 {
        return Ok(Vec::new());
    }

    let mut spans = Vec::new();
    let mut start = 0usize;
    let mut ordinal = 0usize;

    loop {
        let hard_end = (start + max_chunk_size).min(total);
        let end = if hard_end < total {
            find_boundary(&chars, start, hard_end).max(start + 1)
        } else {
            hard_end
        };

        spans.push(ChunkSpan {
            ordinal,
            start,
            end,
            text: chars[start..end].iter().collect(),
        });

        if end >= total {
            break;
        }

        // Overlapping windows: step back by `overlap`, always advancing.
        start = end.saturating_sub(overlap).max(start + 1);
        ordinal += 1;
    }

    Ok(spans)
}

/// Pick a split point in `(start, hard_end]`, searching backwards through
/// the trailing half of the window: paragraph break first, then sentence
/// ending, then the hard cut.
fn find_boundary(chars: &[char], start: usize, hard_end: usize) -> usize {
    let window = hard_end - start;
    let floor = start + window / 2;

    let mut sentence_end = None;
    let mut idx = hard_end;
    while idx > floor {
        idx -= 1;
        if idx > start && chars[idx] == '\n' && chars[idx - 1] == '\n' {
            return idx + 1;
        }
        if sentence_end.is_none() && matches!(chars[idx], '.' | '!' | '?') {
            let followed_by_break = chars
                .get(idx + 1)
                .map(|c| c.is_whitespace())
                .unwrap_or(true);
            if followed_by_break {
                sentence_end = Some(idx + 1);
            }
        }
    }

    sentence_end.unwrap_or(hard_end)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paragraph(sentence: &str, target_chars: usize) -> String {
        let mut out = String::new();
        while out.len() < target_chars {
            out.push_str(sentence);
        }
        out
    }

    #[test]
    fn empty_input_yields_empty_sequence() {
        assert!(chunk("", 200, 20).unwrap().is_empty());
    }

    #[test]
    fn invalid_config_is_rejected() {
        assert!(matches!(
            chunk("text", 0, 0),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            chunk("text", 10, 10),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn short_input_is_a_single_full_span() {
        let spans = chunk("A short note.", 200, 20).unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].start, 0);
        assert_eq!(spans[0].end, "A short note.".chars().count());
        assert_eq!(spans[0].text, "A short note.");
    }

    #[test]
    fn chunking_is_deterministic() {
        let text = paragraph("The quick brown fox jumps over the lazy dog. ", 1200);
        let first = chunk(&text, 256, 32).unwrap();
        let second = chunk(&text, 256, 32).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn spans_cover_input_with_configured_overlap() {
        let text = paragraph("Coverage must hold across every span boundary. ", 1500);
        let total = text.chars().count();
        let spans = chunk(&text, 200, 20).unwrap();

        assert_eq!(spans[0].start, 0);
        assert_eq!(spans.last().unwrap().end, total);
        for pair in spans.windows(2) {
            // No gaps, and the step back never exceeds the configured overlap.
            assert!(pair[1].start <= pair[0].end);
            assert!(pair[0].end - pair[1].start <= 20);
            assert_eq!(pair[1].ordinal, pair[0].ordinal + 1);
            assert!(pair[1].start > pair[0].start);
        }
    }

    #[test]
    fn span_text_matches_offsets() {
        let text = paragraph("Offsets index the original text exactly. ", 900);
        let chars: Vec<char> = text.chars().collect();
        for span in chunk(&text, 180, 30).unwrap() {
            let expected: String = chars[span.start..span.end].iter().collect();
            assert_eq!(span.text, expected);
        }
    }

    #[test]
    fn three_paragraphs_split_on_paragraph_breaks() {
        let p1 = paragraph("Solar panels convert light into power. ", 150);
        let p2 = paragraph("Wind turbines harvest moving air. ", 150);
        let p3 = paragraph("Batteries store the surplus for later. ", 150);
        let text = format!("{}\n\n{}\n\n{}", p1.trim(), p2.trim(), p3.trim());

        let spans = chunk(&text, 200, 20).unwrap();
        assert_eq!(spans.len(), 3);
        assert!(spans[0].text.contains("Solar panels"));
        assert!(spans[1].text.contains("Wind turbines"));
        assert!(spans[2].text.contains("Batteries"));
        // Overlapping boundaries: each later span starts before the previous ends.
        assert!(spans[1].start < spans[0].end);
        assert!(spans[2].start < spans[1].end);
    }

    #[test]
    fn oversized_sentence_falls_back_to_hard_cut() {
        let text: String = std::iter::repeat('x').take(100).collect();
        let spans = chunk(&text, 20, 5).unwrap();
        assert!(spans.len() > 1);
        assert_eq!(spans[0].end - spans[0].start, 20);
        assert_eq!(spans.last().unwrap().end, 100);
    }

    #[test]
    fn sentence_boundary_is_preferred_over_hard_cut() {
        let text = paragraph("One sentence here. ", 400);
        let spans = chunk(&text, 100, 10).unwrap();
        // Every non-final span should end right after a sentence terminator.
        for span in &spans[..spans.len() - 1] {
            assert!(
                span.text.trim_end().ends_with('.'),
                "span {:?} did not end on a sentence boundary",
                span.ordinal
            );
        }
    }
}
