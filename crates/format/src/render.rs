//! Per-flavor renderers over the shared IR.
//!
//! Each transport flavor gets one renderer; the IR is produced once and
//! never re-parsed per transport.  Inline styles are emitted per segment,
//! so a style sliced at a chunk boundary is re-opened in the next chunk by
//! construction.

use sb_domain::config::MarkupFlavor;

use crate::ir::{utf16_to_byte, FormattedText, StyleKind};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Style markers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Wrapping tokens for the lightweight-markup flavor, per channel.
#[derive(Debug, Clone)]
pub struct MarkerTable {
    pub bold: (String, String),
    pub italic: (String, String),
    pub strikethrough: (String, String),
    pub inline_code: (String, String),
    pub spoiler: (String, String),
}

impl Default for MarkerTable {
    fn default() -> Self {
        let pair = |t: &str| (t.to_owned(), t.to_owned());
        Self {
            bold: pair("**"),
            italic: pair("_"),
            strikethrough: pair("~~"),
            inline_code: pair("`"),
            spoiler: pair("||"),
        }
    }
}

impl MarkerTable {
    fn tokens(&self, kind: StyleKind) -> (&str, &str) {
        let (open, close) = match kind {
            StyleKind::Bold => &self.bold,
            StyleKind::Italic => &self.italic,
            StyleKind::Strikethrough => &self.strikethrough,
            StyleKind::InlineCode => &self.inline_code,
            StyleKind::Spoiler => &self.spoiler,
        };
        (open.as_str(), close.as_str())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entry point
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Render an IR (or one chunk of it) to the given flavor.
pub fn render(ir: &FormattedText, flavor: MarkupFlavor, markers: &MarkerTable) -> String {
    match flavor {
        MarkupFlavor::Html => render_segments(ir, &HtmlFlavor),
        MarkupFlavor::MarkdownLite => render_segments(ir, &LiteFlavor { markers }),
        MarkupFlavor::Plain => ir.text.clone(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Segment walk
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

trait Flavor {
    fn escape(&self, text: &str, out: &mut String);
    fn open_style(&self, kind: StyleKind, out: &mut String);
    fn close_style(&self, kind: StyleKind, out: &mut String);
    fn open_link(&self, href: &str, out: &mut String);
    fn close_link(&self, href: &str, out: &mut String);
    fn open_fence(&self, lang: Option<&str>, out: &mut String);
    fn close_fence(&self, out: &mut String);
}

/// Walk the IR once, emitting fences verbatim and styled segments through
/// the flavor callbacks.  Every segment is fully wrapped, which keeps the
/// output well-formed even when spans overlap.
fn render_segments(ir: &FormattedText, flavor: &dyn Flavor) -> String {
    let len = ir.len_utf16();
    let mut out = String::with_capacity(ir.text.len() + 32);

    // Collect segment boundaries from style/link/fence edges.
    let mut bounds: Vec<usize> = vec![0, len];
    for s in &ir.styles {
        bounds.push(s.start);
        bounds.push(s.end);
    }
    for l in &ir.links {
        bounds.push(l.start);
        bounds.push(l.end);
    }
    for f in &ir.fences {
        bounds.push(f.start);
        bounds.push(f.end);
    }
    bounds.sort_unstable();
    bounds.dedup();

    for window in bounds.windows(2) {
        let (a, b) = (window[0], window[1]);
        if a >= b {
            continue;
        }
        let slice = &ir.text[utf16_to_byte(&ir.text, a)..utf16_to_byte(&ir.text, b)];

        if let Some(fence) = ir.fences.iter().find(|f| f.start <= a && b <= f.end) {
            // Fence body is verbatim; open/close markers appear exactly at
            // the fence edges so a sliced fence reopens in the next chunk.
            if fence.start == a {
                flavor.open_fence(fence.lang.as_deref(), &mut out);
            }
            out.push_str(slice);
            if fence.end == b {
                flavor.close_fence(&mut out);
            }
            continue;
        }

        let link = ir.links.iter().find(|l| l.start <= a && b <= l.end);
        let mut active: Vec<StyleKind> = ir
            .styles
            .iter()
            .filter(|s| s.start <= a && b <= s.end)
            .map(|s| s.kind)
            .collect();
        active.dedup();

        if let Some(link) = link {
            flavor.open_link(&link.href, &mut out);
        }
        for kind in &active {
            flavor.open_style(*kind, &mut out);
        }
        flavor.escape(slice, &mut out);
        for kind in active.iter().rev() {
            flavor.close_style(*kind, &mut out);
        }
        if let Some(link) = link {
            flavor.close_link(&link.href, &mut out);
        }
    }

    out
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTML flavor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct HtmlFlavor;

impl Flavor for HtmlFlavor {
    fn escape(&self, text: &str, out: &mut String) {
        for ch in text.chars() {
            match ch {
                '&' => out.push_str("&amp;"),
                '<' => out.push_str("&lt;"),
                '>' => out.push_str("&gt;"),
                _ => out.push(ch),
            }
        }
    }

    fn open_style(&self, kind: StyleKind, out: &mut String) {
        out.push_str(match kind {
            StyleKind::Bold => "<b>",
            StyleKind::Italic => "<i>",
            StyleKind::Strikethrough => "<s>",
            StyleKind::InlineCode => "<code>",
            StyleKind::Spoiler => "<tg-spoiler>",
        });
    }

    fn close_style(&self, kind: StyleKind, out: &mut String) {
        out.push_str(match kind {
            StyleKind::Bold => "</b>",
            StyleKind::Italic => "</i>",
            StyleKind::Strikethrough => "</s>",
            StyleKind::InlineCode => "</code>",
            StyleKind::Spoiler => "</tg-spoiler>",
        });
    }

    fn open_link(&self, href: &str, out: &mut String) {
        out.push_str("<a href=\"");
        for ch in href.chars() {
            match ch {
                '&' => out.push_str("&amp;"),
                '"' => out.push_str("&quot;"),
                _ => out.push(ch),
            }
        }
        out.push_str("\">");
    }

    fn close_link(&self, _href: &str, out: &mut String) {
        out.push_str("</a>");
    }

    fn open_fence(&self, lang: Option<&str>, out: &mut String) {
        match lang {
            Some(lang) => {
                out.push_str("<pre><code class=\"language-");
                self.escape(lang, out);
                out.push_str("\">");
            }
            None => out.push_str("<pre><code>"),
        }
    }

    fn close_fence(&self, out: &mut String) {
        out.push_str("</code></pre>");
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lightweight-markup flavor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct LiteFlavor<'a> {
    markers: &'a MarkerTable,
}

impl Flavor for LiteFlavor<'_> {
    fn escape(&self, text: &str, out: &mut String) {
        out.push_str(text);
    }

    fn open_style(&self, kind: StyleKind, out: &mut String) {
        out.push_str(self.markers.tokens(kind).0);
    }

    fn close_style(&self, kind: StyleKind, out: &mut String) {
        out.push_str(self.markers.tokens(kind).1);
    }

    fn open_link(&self, _href: &str, out: &mut String) {
        out.push('[');
    }

    fn close_link(&self, href: &str, out: &mut String) {
        out.push_str("](");
        out.push_str(href);
        out.push(')');
    }

    fn open_fence(&self, lang: Option<&str>, out: &mut String) {
        out.push_str("```");
        if let Some(lang) = lang {
            out.push_str(lang);
        }
        out.push('\n');
    }

    fn close_fence(&self, out: &mut String) {
        // Fence bodies keep their trailing newline, so the closer starts
        // on its own line.
        out.push_str("```");
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{parse_markdown, ParseOptions};

    fn parse(src: &str) -> FormattedText {
        parse_markdown(src, ParseOptions::default())
    }

    #[test]
    fn html_bold_and_escape() {
        let ir = parse("**a<b** & c");
        let html = render(&ir, MarkupFlavor::Html, &MarkerTable::default());
        assert_eq!(html, "<b>a&lt;b</b> &amp; c");
    }

    #[test]
    fn html_link() {
        let ir = parse("[docs](https://example.com?a=1&b=2)");
        let html = render(&ir, MarkupFlavor::Html, &MarkerTable::default());
        assert_eq!(html, "<a href=\"https://example.com?a=1&amp;b=2\">docs</a>");
    }

    #[test]
    fn html_code_fence() {
        let ir = parse("```rust\nlet x = 1;\n```");
        let html = render(&ir, MarkupFlavor::Html, &MarkerTable::default());
        assert_eq!(
            html,
            "<pre><code class=\"language-rust\">let x = 1;\n</code></pre>"
        );
    }

    #[test]
    fn lite_markers_roundtrip() {
        let ir = parse("**bold** and `code`");
        let lite = render(&ir, MarkupFlavor::MarkdownLite, &MarkerTable::default());
        assert_eq!(lite, "**bold** and `code`");
    }

    #[test]
    fn lite_custom_markers() {
        let ir = parse("**bold**");
        let markers = MarkerTable {
            bold: ("<<".into(), ">>".into()),
            ..MarkerTable::default()
        };
        let lite = render(&ir, MarkupFlavor::MarkdownLite, &markers);
        assert_eq!(lite, "<<bold>>");
    }

    #[test]
    fn lite_fence_keeps_trailing_newline() {
        let ir = parse("```\nbody\n```");
        let lite = render(&ir, MarkupFlavor::MarkdownLite, &MarkerTable::default());
        assert_eq!(lite, "```\nbody\n```");
    }

    #[test]
    fn plain_strips_markup() {
        let ir = parse("**bold** [x](https://e.com) ||s||");
        let plain = render(&ir, MarkupFlavor::Plain, &MarkerTable::default());
        assert_eq!(plain, "bold x s");
    }

    #[test]
    fn nested_styles_close_in_reverse_order() {
        let ir = parse("***both***");
        let html = render(&ir, MarkupFlavor::Html, &MarkerTable::default());
        // Either nesting order is acceptable as long as tags are balanced.
        assert!(html == "<i><b>both</b></i>" || html == "<b><i>both</i></b>");
    }
}
