//! Rich-text shaping for outbound delivery: a shared formatted-text IR
//! parsed once from markdown, per-flavor renderers, size-bounded chunking,
//! and block-stream coalescing.

pub mod chunker;
pub mod coalesce;
pub mod ir;
pub mod render;

pub use chunker::{chunk, ChunkParams};
pub use coalesce::Coalescer;
pub use ir::{
    parse_markdown, utf16_len, utf16_to_byte, CodeFence, FormattedText, LinkSpan, ParseOptions,
    StyleKind, StyleSpan,
};
pub use render::{render, MarkerTable};

#[cfg(test)]
mod roundtrip_tests {
    use super::*;
    use sb_domain::config::MarkupFlavor;

    /// Render-for-flavor preserves semantic content: text, style spans, and
    /// links survive a parse → render → parse cycle for markdown-lite.
    #[test]
    fn markdown_lite_roundtrip_preserves_semantics() {
        let src = "intro **bold** then *italic* and `code`\n\nwith [a link](https://example.com)";
        let ir = parse_markdown(src, ParseOptions::default());
        let rendered = render(&ir, MarkupFlavor::MarkdownLite, &MarkerTable::default());
        let reparsed = parse_markdown(&rendered, ParseOptions::default());

        assert_eq!(ir.text, reparsed.text);
        assert_eq!(ir.styles, reparsed.styles);
        assert_eq!(ir.links, reparsed.links);
    }

    #[test]
    fn plain_flavor_preserves_text() {
        let src = "a **b** c";
        let ir = parse_markdown(src, ParseOptions::default());
        assert_eq!(render(&ir, MarkupFlavor::Plain, &MarkerTable::default()), "a b c");
    }

    #[test]
    fn chunked_render_concatenates_to_full_text() {
        let src = format!("{} **tail**", "lead ".repeat(40));
        let ir = parse_markdown(&src, ParseOptions::default());
        let chunks = chunk(
            &ir,
            &ChunkParams::new(10, 60, sb_domain::channel::ChunkMode::NewlinePreferred),
        );
        assert!(chunks.len() > 1);
        let joined: String = chunks
            .iter()
            .map(|c| render(c, MarkupFlavor::Plain, &MarkerTable::default()))
            .collect::<Vec<_>>()
            .join(" ");
        // Whitespace at chunk edges is trimmed; words and order survive.
        let words = |s: &str| s.split_whitespace().map(str::to_owned).collect::<Vec<_>>();
        assert_eq!(words(&joined), words(&ir.text));
    }
}
