//! HTML → compact Markdown conversion.
//!
//! Output is normalized for diff-friendliness: one-line ATX headings, `-`
//! list markers, fenced code blocks, inlined links, and no runs of blank
//! lines.

use htmd::options::{BulletListMarker, CodeBlockStyle, HeadingStyle, LinkStyle, Options};
use htmd::HtmlToMarkdown;
use std::sync::OnceLock;

fn converter() -> &'static HtmlToMarkdown {
    static CONVERTER: OnceLock<HtmlToMarkdown> = OnceLock::new();
    CONVERTER.get_or_init(|| {
        HtmlToMarkdown::builder()
            .skip_tags(vec!["script", "style", "iframe", "noscript"])
            .options(Options {
                heading_style: HeadingStyle::Atx,
                bullet_list_marker: BulletListMarker::Dash,
                code_block_style: CodeBlockStyle::Fenced,
                link_style: LinkStyle::Inlined,
                ..Default::default()
            })
            .build()
    })
}

pub fn to_markdown(html: &str) -> String {
    let md = converter().convert(html).unwrap_or_default();
    compact(&md)
}

/// Collapse runs of 3+ newlines to a single blank line and trim surrounding
/// whitespace.
pub fn compact(md: &str) -> String {
    let mut out = String::with_capacity(md.len());
    let mut newlines = 0usize;
    for ch in md.chars() {
        if ch == '\n' {
            newlines += 1;
            if newlines <= 2 {
                out.push(ch);
            }
        } else {
            newlines = 0;
            out.push(ch);
        }
    }
    out.trim().to_string()
}
