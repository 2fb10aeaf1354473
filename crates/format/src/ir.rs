//! The shared formatted-text intermediate representation.
//!
//! Source markdown is parsed once into `{ text, styles[], links[] }`;
//! every transport renderer consumes the same IR.  Offsets are half-open
//! `[start, end)` ranges measured in UTF-16 code units, matching the most
//! restrictive downstream consumer.

use pulldown_cmark::{CodeBlockKind, Event, Options, Parser, Tag, TagEnd};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// IR model
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StyleKind {
    Bold,
    Italic,
    Strikethrough,
    InlineCode,
    Spoiler,
}

/// A styled `[start, end)` range, UTF-16 code units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StyleSpan {
    pub kind: StyleKind,
    pub start: usize,
    pub end: usize,
}

/// A linked `[start, end)` range, UTF-16 code units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSpan {
    pub href: String,
    pub start: usize,
    pub end: usize,
}

/// A fenced code block.  Fences render with a preserved trailing newline
/// and are never split across chunks except by a forced hard split, which
/// closes and reopens the fence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeFence {
    pub lang: Option<String>,
    pub start: usize,
    pub end: usize,
}

/// Parsed rich text: plain text plus range metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormattedText {
    pub text: String,
    pub styles: Vec<StyleSpan>,
    pub links: Vec<LinkSpan>,
    pub fences: Vec<CodeFence>,
}

impl FormattedText {
    pub fn plain(text: impl Into<String>) -> Self {
        Self { text: text.into(), ..Default::default() }
    }

    /// Length in UTF-16 code units.
    pub fn len_utf16(&self) -> usize {
        utf16_len(&self.text)
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Whether a UTF-16 offset falls inside a code fence.
    pub fn in_fence(&self, offset: usize) -> bool {
        self.fences.iter().any(|f| f.start < offset && offset < f.end)
    }
}

/// UTF-16 length of a string.
pub fn utf16_len(s: &str) -> usize {
    s.encode_utf16().count()
}

/// Convert a UTF-16 offset into a byte index.  Offsets inside a surrogate
/// pair round down to the scalar's start.
pub fn utf16_to_byte(s: &str, utf16_offset: usize) -> usize {
    let mut units = 0;
    for (byte_idx, ch) in s.char_indices() {
        if units >= utf16_offset {
            return byte_idx;
        }
        units += ch.len_utf16();
    }
    s.len()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Parser
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, Default)]
pub struct ParseOptions {
    /// Tables are parsed only when a channel opts in; otherwise table
    /// source passes through as plain text lines.
    pub tables: bool,
}

/// Parse source-flavor markdown into the shared IR.
pub fn parse_markdown(src: &str, opts: ParseOptions) -> FormattedText {
    let mut cmark_opts = Options::ENABLE_STRIKETHROUGH;
    if opts.tables {
        cmark_opts.insert(Options::ENABLE_TABLES);
    }

    let mut b = IrBuilder::default();
    for event in Parser::new_ext(src, cmark_opts) {
        match event {
            Event::Start(tag) => b.start_tag(tag),
            Event::End(tag) => b.end_tag(tag),
            Event::Text(t) => b.push_text(&t),
            Event::Code(t) => b.push_inline_code(&t),
            Event::SoftBreak => b.push_raw("\n"),
            Event::HardBreak => b.push_raw("\n"),
            Event::Rule => {
                b.break_block();
                b.push_raw("———");
            }
            Event::Html(h) | Event::InlineHtml(h) => b.push_text(&h),
            Event::TaskListMarker(done) => {
                b.push_raw(if done { "[x] " } else { "[ ] " })
            }
            Event::FootnoteReference(_) | Event::InlineMath(_) | Event::DisplayMath(_) => {}
        }
    }
    b.finish()
}

#[derive(Default)]
struct IrBuilder {
    text: String,
    /// Running length in UTF-16 units.
    len16: usize,
    styles: Vec<StyleSpan>,
    links: Vec<LinkSpan>,
    fences: Vec<CodeFence>,
    open_styles: Vec<(StyleKind, usize)>,
    open_link: Option<(String, usize)>,
    open_fence: Option<(Option<String>, usize)>,
    /// Pending `||` spoiler delimiter start.
    spoiler_start: Option<usize>,
    /// Block separation is deferred so trailing blank lines never appear.
    needs_block_break: bool,
    list_depth: usize,
    in_table: bool,
    table_cell_open: bool,
}

impl IrBuilder {
    fn start_tag(&mut self, tag: Tag<'_>) {
        match tag {
            Tag::Paragraph | Tag::Heading { .. } | Tag::BlockQuote(_) => self.break_block(),
            Tag::Strong => {
                self.flush_break();
                self.open_styles.push((StyleKind::Bold, self.len16));
            }
            Tag::Emphasis => {
                self.flush_break();
                self.open_styles.push((StyleKind::Italic, self.len16));
            }
            Tag::Strikethrough => {
                self.flush_break();
                self.open_styles.push((StyleKind::Strikethrough, self.len16));
            }
            Tag::Link { dest_url, .. } => {
                self.flush_break();
                self.open_link = Some((dest_url.to_string(), self.len16));
            }
            Tag::CodeBlock(kind) => {
                self.break_block();
                self.flush_break();
                let lang = match kind {
                    CodeBlockKind::Fenced(lang) if !lang.is_empty() => Some(lang.to_string()),
                    _ => None,
                };
                self.open_fence = Some((lang, self.len16));
            }
            Tag::List(_) => {
                self.break_block();
                self.list_depth += 1;
            }
            Tag::Item => {
                if !self.text.is_empty() && !self.text.ends_with('\n') {
                    self.push_raw("\n");
                }
                let indent = "  ".repeat(self.list_depth.saturating_sub(1));
                self.push_raw(&format!("{indent}- "));
            }
            Tag::Table(_) => {
                self.break_block();
                self.in_table = true;
            }
            Tag::TableRow | Tag::TableHead => {
                if self.in_table && !self.text.is_empty() && !self.text.ends_with('\n') {
                    self.push_raw("\n");
                }
                self.table_cell_open = false;
            }
            Tag::TableCell => {
                if self.table_cell_open {
                    self.push_raw(" | ");
                }
                self.table_cell_open = true;
            }
            _ => {}
        }
    }

    fn end_tag(&mut self, tag: TagEnd) {
        match tag {
            TagEnd::Strong => self.close_style(StyleKind::Bold),
            TagEnd::Emphasis => self.close_style(StyleKind::Italic),
            TagEnd::Strikethrough => self.close_style(StyleKind::Strikethrough),
            TagEnd::Link => {
                if let Some((href, start)) = self.open_link.take() {
                    if self.len16 > start {
                        self.links.push(LinkSpan { href, start, end: self.len16 });
                    }
                }
            }
            TagEnd::CodeBlock => {
                if let Some((lang, start)) = self.open_fence.take() {
                    // Preserve exactly one trailing newline inside the fence.
                    if !self.text.ends_with('\n') {
                        self.push_raw("\n");
                    }
                    self.fences.push(CodeFence { lang, start, end: self.len16 });
                }
                self.needs_block_break = true;
            }
            TagEnd::Paragraph | TagEnd::Heading(_) | TagEnd::BlockQuote(_) => {
                self.needs_block_break = true;
            }
            TagEnd::List(_) => {
                self.list_depth = self.list_depth.saturating_sub(1);
                if self.list_depth == 0 {
                    self.needs_block_break = true;
                }
            }
            TagEnd::Table => {
                self.in_table = false;
                self.needs_block_break = true;
            }
            _ => {}
        }
    }

    /// Append visible text, honoring `||…||` spoiler delimiters.
    fn push_text(&mut self, t: &str) {
        if self.open_fence.is_some() {
            // Fence content is verbatim; no spoiler scanning.
            self.push_raw(t);
            return;
        }
        if !t.is_empty() {
            self.flush_break();
        }
        let mut rest = t;
        while let Some(pos) = rest.find("||") {
            let (before, after) = rest.split_at(pos);
            self.push_raw(before);
            match self.spoiler_start.take() {
                Some(start) => {
                    if self.len16 > start {
                        self.styles.push(StyleSpan {
                            kind: StyleKind::Spoiler,
                            start,
                            end: self.len16,
                        });
                    }
                }
                None => self.spoiler_start = Some(self.len16),
            }
            rest = &after[2..];
        }
        self.push_raw(rest);
    }

    fn push_inline_code(&mut self, t: &str) {
        let start = self.len16;
        self.push_raw(t);
        if self.len16 > start {
            self.styles.push(StyleSpan { kind: StyleKind::InlineCode, start, end: self.len16 });
        }
    }

    fn push_raw(&mut self, t: &str) {
        if t.is_empty() {
            return;
        }
        self.flush_break();
        self.text.push_str(t);
        self.len16 += utf16_len(t);
    }

    /// Apply a pending block separator before anything records offsets.
    fn flush_break(&mut self) {
        if self.needs_block_break {
            self.needs_block_break = false;
            if !self.text.is_empty() {
                self.text.push_str("\n\n");
                self.len16 += 2;
            }
        }
    }

    fn break_block(&mut self) {
        if !self.text.is_empty() {
            self.needs_block_break = true;
        }
    }

    fn close_style(&mut self, kind: StyleKind) {
        if let Some(pos) = self.open_styles.iter().rposition(|(k, _)| *k == kind) {
            let (_, start) = self.open_styles.remove(pos);
            if self.len16 > start {
                self.styles.push(StyleSpan { kind, start, end: self.len16 });
            }
        }
    }

    fn finish(mut self) -> FormattedText {
        // Unterminated spoiler delimiters are literal text; drop the marker.
        self.spoiler_start = None;
        // Close any dangling styles at end-of-text.
        while let Some((kind, start)) = self.open_styles.pop() {
            if self.len16 > start {
                self.styles.push(StyleSpan { kind, start, end: self.len16 });
            }
        }
        self.styles.sort_by_key(|s| (s.start, s.end));
        self.links.sort_by_key(|l| (l.start, l.end));
        self.fences.sort_by_key(|f| (f.start, f.end));
        FormattedText {
            text: self.text,
            styles: self.styles,
            links: self.links,
            fences: self.fences,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
