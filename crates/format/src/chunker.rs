//! Chunking of formatted text under per-channel size limits.
//!
//! Splits the IR's text *before* rendering.  Break preference runs
//! paragraph → newline → sentence → whitespace → hard; split points inside
//! code fences are avoided when any candidate outside one exists.  A hard
//! split inside a fence slices the fence span, which makes the renderer
//! close it at the chunk edge and reopen it in the next chunk.  Inline
//! styles never straddle a boundary: spans are sliced per chunk and the
//! renderer re-opens them.

use sb_domain::channel::ChunkMode;

use crate::ir::{utf16_len, utf16_to_byte, CodeFence, FormattedText, LinkSpan, StyleSpan};

#[derive(Debug, Clone, Copy)]
pub struct ChunkParams {
    /// Emission floor; only the final chunk may be shorter.
    pub min_chars: usize,
    /// Hard bound per chunk, already clamped by the channel's text limit.
    pub max_chars: usize,
    pub mode: ChunkMode,
}

impl ChunkParams {
    pub fn new(min_chars: usize, max_chars: usize, mode: ChunkMode) -> Self {
        let max_chars = max_chars.max(1);
        Self { min_chars: min_chars.min(max_chars), max_chars, mode }
    }
}

/// Break patterns in preference order; splits land after the pattern.
const PREFER_NEWLINE: &[&str] = &["\n\n", "\n", ". ", " "];
const PREFER_LENGTH: &[&str] = &[" "];

/// Split an IR into chunks of at most `max_chars` UTF-16 code units.
pub fn chunk(ir: &FormattedText, params: &ChunkParams) -> Vec<FormattedText> {
    let total = ir.len_utf16();
    if total <= params.max_chars {
        return vec![ir.clone()];
    }

    let prefs = match params.mode {
        ChunkMode::NewlinePreferred => PREFER_NEWLINE,
        ChunkMode::Length => PREFER_LENGTH,
    };

    let mut chunks = Vec::new();
    let mut pos = 0usize;
    while pos < total {
        let remaining = total - pos;
        if remaining <= params.max_chars {
            chunks.push(slice_ir(ir, pos, total));
            break;
        }

        let limit = pos + params.max_chars;
        let floor = pos + params.min_chars.max(1);
        let split = find_split(ir, pos, floor, limit, prefs).unwrap_or(limit);
        chunks.push(slice_ir(ir, pos, split));
        pos = split;
    }

    chunks
}

/// Best split point in `[floor, limit]`, scanning preference patterns and
/// favoring candidates outside code fences.
fn find_split(
    ir: &FormattedText,
    pos: usize,
    floor: usize,
    limit: usize,
    prefs: &[&str],
) -> Option<usize> {
    let b_pos = utf16_to_byte(&ir.text, pos);
    let b_limit = utf16_to_byte(&ir.text, limit);
    let window = &ir.text[b_pos..b_limit];

    // Pass 1 skips candidates inside fences; pass 2 accepts them.
    for allow_in_fence in [false, true] {
        for pattern in prefs {
            let mut search_end = window.len();
            while let Some(found) = window[..search_end].rfind(pattern) {
                let split_b = b_pos + found + pattern.len();
                let split16 = utf16_len(&ir.text[..split_b]);
                if split16 >= floor && (allow_in_fence || !ir.in_fence(split16)) {
                    return Some(split16);
                }
                if found == 0 {
                    break;
                }
                search_end = found;
            }
        }
    }
    None
}

/// Slice `[start, end)` (UTF-16 units) into a standalone IR: spans clamp to
/// the window and rebase to 0; empty spans drop out.
fn slice_ir(ir: &FormattedText, start: usize, end: usize) -> FormattedText {
    let b_start = utf16_to_byte(&ir.text, start);
    let b_end = utf16_to_byte(&ir.text, end);
    let mut text = ir.text[b_start..b_end].to_owned();

    // Trailing delimiter whitespace at the split edge is noise on the wire.
    // Keep it when a fence runs to the chunk edge (fence bodies are verbatim).
    let fence_at_edge = ir.fences.iter().any(|f| f.start < end && end <= f.end);
    let mut len16 = utf16_len(&text);
    if !fence_at_edge {
        let trimmed = text.trim_end_matches(['\n', ' ']);
        if trimmed.len() < text.len() {
            text = trimmed.to_owned();
            len16 = utf16_len(&text);
        }
    }

    let clamp = |s: usize, e: usize| -> Option<(usize, usize)> {
        let s = s.max(start).min(end);
        let e = e.max(start).min(end);
        if s >= e {
            return None;
        }
        let (s, e) = (s - start, e - start);
        if s >= len16 {
            return None;
        }
        Some((s, e.min(len16)))
    };

    let styles = ir
        .styles
        .iter()
        .filter_map(|span| {
            clamp(span.start, span.end)
                .map(|(s, e)| StyleSpan { kind: span.kind, start: s, end: e })
        })
        .collect();
    let links = ir
        .links
        .iter()
        .filter_map(|span| {
            clamp(span.start, span.end).map(|(s, e)| LinkSpan {
                href: span.href.clone(),
                start: s,
                end: e,
            })
        })
        .collect();
    let fences = ir
        .fences
        .iter()
        .filter_map(|span| {
            clamp(span.start, span.end).map(|(s, e)| CodeFence {
                lang: span.lang.clone(),
                start: s,
                end: e,
            })
        })
        .collect();

    FormattedText { text, styles, links, fences }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{parse_markdown, ParseOptions, StyleKind};
    use crate::render::{render, MarkerTable};
    use sb_domain::config::MarkupFlavor;

    fn params(min: usize, max: usize) -> ChunkParams {
        ChunkParams::new(min, max, ChunkMode::NewlinePreferred)
    }

    #[test]
    fn short_text_is_one_chunk() {
        let ir = FormattedText::plain("hello");
        let chunks = chunk(&ir, &params(1, 100));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "hello");
    }

    #[test]
    fn chunks_respect_max() {
        let ir = FormattedText::plain("word ".repeat(100));
        let chunks = chunk(&ir, &params(10, 40));
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.len_utf16() <= 40, "chunk too long: {:?}", c.text);
        }
    }

    #[test]
    fn prefers_paragraph_boundary() {
        let text = format!("{}\n\n{}", "a".repeat(30), "b".repeat(30));
        let ir = FormattedText::plain(text);
        let chunks = chunk(&ir, &params(5, 40));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "a".repeat(30));
        assert_eq!(chunks[1].text, "b".repeat(30));
    }

    #[test]
    fn falls_back_to_whitespace() {
        let text = format!("{} {}", "a".repeat(30), "b".repeat(30));
        let ir = FormattedText::plain(text);
        let chunks = chunk(&ir, &params(5, 40));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "a".repeat(30));
    }

    #[test]
    fn hard_split_without_any_boundary() {
        let ir = FormattedText::plain("x".repeat(100));
        let chunks = chunk(&ir, &params(10, 40));
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len_utf16(), 40);
        assert_eq!(chunks[1].len_utf16(), 40);
        assert_eq!(chunks[2].len_utf16(), 20);
    }

    #[test]
    fn min_floor_skips_early_boundaries() {
        // A newline at offset 3 must not be used when min_chars is 20.
        let text = format!("abc\n{}", "d".repeat(60));
        let ir = FormattedText::plain(text);
        let chunks = chunk(&ir, &params(20, 40));
        assert!(chunks[0].len_utf16() >= 20);
    }

    #[test]
    fn styles_slice_and_reopen() {
        let mut ir = FormattedText::plain(format!("{} {}", "a".repeat(30), "b".repeat(30)));
        ir.styles.push(StyleSpan { kind: StyleKind::Bold, start: 0, end: 61 });
        let chunks = chunk(&ir, &params(5, 40));
        assert_eq!(chunks.len(), 2);
        // Both chunks carry a bold span covering their whole text.
        for c in &chunks {
            assert_eq!(c.styles.len(), 1);
            assert_eq!(c.styles[0].start, 0);
            assert_eq!(c.styles[0].end, c.len_utf16());
        }
    }

    #[test]
    fn fence_closes_and_reopens_on_hard_split() {
        let body = "line();\n".repeat(12); // 96 units, no fence-free boundary
        let ir = parse_markdown(&format!("```rust\n{body}```"), ParseOptions::default());
        let chunks = chunk(&ir, &params(10, 60));
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert_eq!(c.fences.len(), 1, "every chunk keeps its fence slice");
        }
        // Rendering each chunk produces balanced fences.
        for c in &chunks {
            let lite = render(c, MarkupFlavor::MarkdownLite, &MarkerTable::default());
            assert!(lite.starts_with("```rust\n"));
            assert!(lite.ends_with("```"));
        }
    }

    #[test]
    fn split_avoids_fence_when_alternative_exists() {
        let md = format!("{}\n\n```\n{}\n```", "intro ".repeat(4), "code ".repeat(5));
        let ir = parse_markdown(&md, ParseOptions::default());
        let chunks = chunk(&ir, &params(4, 30));
        // First chunk should break at the paragraph boundary before the
        // fence, not inside it.
        assert!(chunks[0].fences.is_empty());
    }

    #[test]
    fn utf16_boundary_safety() {
        let ir = FormattedText::plain("𝄞".repeat(30)); // 60 UTF-16 units
        let chunks = chunk(&ir, &params(5, 41));
        // A split at unit 41 would land mid-surrogate; slicing rounds to a
        // char boundary and must not panic.
        let total: String = chunks.iter().map(|c| c.text.clone()).collect();
        assert_eq!(total, "𝄞".repeat(30));
    }
}
