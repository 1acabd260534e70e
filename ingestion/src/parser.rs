use crate::frontmatter::{parse_frontmatter, Frontmatter};
use notemesh_core::model::{sha256_hex, BlockKind};
use regex::Regex;
use std::sync::OnceLock;

#[derive(Debug, Clone)]
pub struct ParserConfig {
    /// Spaces per list nesting level. Two by convention.
    pub spaces_per_indent: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            spaces_per_indent: 2,
        }
    }
}

/// Source span of a block: 0-based lines, byte offsets from document start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub line_start: u32,
    pub line_end: u32,
    pub char_start: usize,
    pub char_end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub text: String,
    pub target: String,
}

/// Annotations pulled out of a text run: `#tag` tokens, links, embeds, and
/// inline `key::value` properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InlineAnnotations {
    pub tags: Vec<String>,
    pub links: Vec<Link>,
    pub embeds: Vec<String>,
    pub properties: Vec<(String, String)>,
}

impl InlineAnnotations {
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
            && self.links.is_empty()
            && self.embeds.is_empty()
            && self.properties.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub kind: BlockKind,
    pub text: String,
    pub heading_level: Option<u8>,
    pub indent: Option<u16>,
    pub language: Option<String>,
    pub span: Span,
    pub inline: InlineAnnotations,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDocument {
    pub source_id: String,
    pub frontmatter: Frontmatter,
    pub blocks: Vec<Block>,
    pub content_hash: String,
    pub line_count: usize,
    pub byte_len: usize,
}

/// Deterministic line-based parser for the lightweight-markup dialect:
/// optional `---` frontmatter, `#`..`######` headings, `-`/`*`/`+` bullets
/// with space indentation, fenced code blocks, blockquotes, paragraphs.
#[derive(Debug, Clone, Default)]
pub struct Parser {
    config: ParserConfig,
}

impl Parser {
    pub fn new(config: ParserConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ParserConfig {
        &self.config
    }

    pub fn parse(&self, source_id: &str, text: &str) -> ParsedDocument {
        let lines: Vec<&str> = text.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l)).collect();
        let mut offsets = Vec::with_capacity(lines.len());
        let mut offset = 0usize;
        for line in text.split('\n') {
            offsets.push(offset);
            offset += line.len() + 1;
        }
        let byte_len = text.len();

        let frontmatter = parse_frontmatter(&lines);
        let mut blocks = Vec::new();
        let mut i = frontmatter.lines_consumed;

        while i < lines.len() {
            let line = lines[i];
            let trimmed = line.trim();

            if trimmed.is_empty() {
                i += 1;
                continue;
            }

            if let Some(rest) = trimmed.strip_prefix("```") {
                let language = rest.trim();
                let fence_start = i;
                let mut j = i + 1;
                while j < lines.len() && lines[j].trim() != "```" {
                    j += 1;
                }
                let body = lines[fence_start + 1..j.min(lines.len())].join("\n");
                let close = j.min(lines.len().saturating_sub(1));
                blocks.push(Block {
                    kind: BlockKind::CodeBlock,
                    text: body,
                    heading_level: None,
                    indent: None,
                    language: (!language.is_empty()).then(|| language.to_string()),
                    span: span_of(&offsets, &lines, fence_start, close, byte_len),
                    // Code is opaque: no inline extraction inside fences.
                    inline: InlineAnnotations::default(),
                });
                i = j + 1;
                continue;
            }

            if let Some((level, text)) = parse_heading(trimmed) {
                blocks.push(Block {
                    kind: BlockKind::Heading,
                    text: text.to_string(),
                    heading_level: Some(level),
                    indent: None,
                    language: None,
                    span: span_of(&offsets, &lines, i, i, byte_len),
                    inline: extract_inline(text),
                });
                i += 1;
                continue;
            }

            if trimmed.starts_with('>') {
                let start = i;
                let mut j = i;
                let mut quote_lines = Vec::new();
                while j < lines.len() {
                    let candidate = lines[j].trim();
                    if let Some(rest) = candidate.strip_prefix('>') {
                        quote_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
                        j += 1;
                    } else {
                        break;
                    }
                }
                let text = quote_lines.join("\n");
                blocks.push(Block {
                    kind: BlockKind::Blockquote,
                    text: text.clone(),
                    heading_level: None,
                    indent: None,
                    language: None,
                    span: span_of(&offsets, &lines, start, j - 1, byte_len),
                    inline: extract_inline(&text),
                });
                i = j;
                continue;
            }

            if let Some((indent, text)) = parse_list_item(line) {
                blocks.push(Block {
                    kind: BlockKind::ListItem,
                    text: text.to_string(),
                    heading_level: None,
                    indent: Some(indent),
                    language: None,
                    span: span_of(&offsets, &lines, i, i, byte_len),
                    inline: extract_inline(text),
                });
                i += 1;
                continue;
            }

            // Paragraph: consecutive plain lines.
            let start = i;
            let mut j = i;
            while j < lines.len() {
                let candidate = lines[j];
                let candidate_trimmed = candidate.trim();
                if candidate_trimmed.is_empty()
                    || candidate_trimmed.starts_with("```")
                    || candidate_trimmed.starts_with('>')
                    || parse_heading(candidate_trimmed).is_some()
                    || parse_list_item(candidate).is_some()
                {
                    break;
                }
                j += 1;
            }
            let text = lines[start..j].join("\n");
            blocks.push(Block {
                kind: BlockKind::Paragraph,
                text: text.clone(),
                heading_level: None,
                indent: None,
                language: None,
                span: span_of(&offsets, &lines, start, j - 1, byte_len),
                inline: extract_inline(&text),
            });
            i = j;
        }

        ParsedDocument {
            source_id: source_id.to_string(),
            frontmatter,
            blocks,
            content_hash: sha256_hex(text.as_bytes()),
            line_count: lines.len(),
            byte_len,
        }
    }

    /// Indent level of a list item span, per the configured spaces-per-level.
    pub fn indent_level(&self, indent_spaces: u16) -> usize {
        indent_spaces as usize / self.config.spaces_per_indent.max(1)
    }
}

fn span_of(offsets: &[usize], lines: &[&str], start: usize, end: usize, byte_len: usize) -> Span {
    let char_start = offsets.get(start).copied().unwrap_or(0);
    let char_end = offsets
        .get(end)
        .map(|o| o + lines.get(end).map(|l| l.len()).unwrap_or(0))
        .unwrap_or(byte_len);
    Span {
        line_start: start as u32,
        line_end: end as u32,
        char_start,
        char_end,
    }
}

fn parse_heading(trimmed: &str) -> Option<(u8, &str)> {
    let hashes = trimmed.bytes().take_while(|b| *b == b'#').count();
    if !(1..=6).contains(&hashes) {
        return None;
    }
    let rest = &trimmed[hashes..];
    let text = rest.strip_prefix(' ')?;
    Some((hashes as u8, text.trim()))
}

fn parse_list_item(line: &str) -> Option<(u16, &str)> {
    let indent = line.len() - line.trim_start_matches(' ').len();
    let rest = &line[indent..];
    let mut chars = rest.chars();
    let bullet = chars.next()?;
    if !matches!(bullet, '-' | '*' | '+') {
        return None;
    }
    let after = chars.as_str();
    let text = after.strip_prefix(' ')?;
    Some((indent as u16, text.trim_end()))
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|\s)#([A-Za-z0-9_][A-Za-z0-9_/-]*)").unwrap())
}

fn wiki_embed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"!\[\[([^\]]+)\]\]").unwrap())
}

fn wiki_link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[\[([^\]]+)\]\]").unwrap())
}

fn md_embed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"!\[([^\]]*)\]\(([^)]+)\)").unwrap())
}

fn md_link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[([^\]]*)\]\(([^)]+)\)").unwrap())
}

fn property_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*([A-Za-z][A-Za-z0-9_-]*)::\s*(.+)$").unwrap())
}

pub fn extract_inline(text: &str) -> InlineAnnotations {
    let mut out = InlineAnnotations::default();

    for capture in tag_re().captures_iter(text) {
        out.tags.push(capture[1].to_string());
    }

    let mut embed_spans = Vec::new();
    for capture in wiki_embed_re().captures_iter(text) {
        let whole = capture.get(0).unwrap();
        embed_spans.push((whole.start(), whole.end()));
        out.embeds.push(capture[1].to_string());
    }
    for capture in md_embed_re().captures_iter(text) {
        let whole = capture.get(0).unwrap();
        embed_spans.push((whole.start(), whole.end()));
        out.embeds.push(capture[2].to_string());
    }

    for capture in wiki_link_re().captures_iter(text) {
        let whole = capture.get(0).unwrap();
        // `![[..]]` already matched as an embed.
        if embed_spans
            .iter()
            .any(|(start, end)| whole.start() >= *start && whole.end() <= *end)
        {
            continue;
        }
        let target = capture[1].to_string();
        out.links.push(Link {
            text: target.clone(),
            target,
        });
    }
    for capture in md_link_re().captures_iter(text) {
        let whole = capture.get(0).unwrap();
        if embed_spans
            .iter()
            .any(|(start, end)| whole.start() >= *start && whole.end() <= *end)
        {
            continue;
        }
        out.links.push(Link {
            text: capture[1].to_string(),
            target: capture[2].to_string(),
        });
    }

    for capture in property_re().captures_iter(text) {
        out.properties
            .push((capture[1].to_string(), capture[2].trim().to_string()));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_headings_lists_paragraphs_with_positions() {
        let text = "---\ntitle: Note A\ntags: [alpha, beta]\n---\n# Heading\nPara one mentions PostgreSQL.\n- bullet\n";
        let doc = Parser::default().parse("notes/a.md", text);

        assert_eq!(doc.frontmatter.title.as_deref(), Some("Note A"));
        assert_eq!(doc.blocks.len(), 3);

        let heading = &doc.blocks[0];
        assert_eq!(heading.kind, BlockKind::Heading);
        assert_eq!(heading.heading_level, Some(1));
        assert_eq!(heading.text, "Heading");
        assert_eq!(heading.span.line_start, 4);

        let para = &doc.blocks[1];
        assert_eq!(para.kind, BlockKind::Paragraph);
        assert_eq!(para.span.line_start, 5);
        assert!(para.text.contains("PostgreSQL"));

        let bullet = &doc.blocks[2];
        assert_eq!(bullet.kind, BlockKind::ListItem);
        assert_eq!(bullet.indent, Some(0));
        assert_eq!(bullet.span.line_start, 6);
    }

    #[test]
    fn parse_is_deterministic() {
        let text = "# A\n- one\n  - two\npara\n";
        let parser = Parser::default();
        assert_eq!(parser.parse("d", text), parser.parse("d", text));
    }

    #[test]
    fn code_blocks_are_opaque() {
        let text = "```rust\nlet x = 1; // #not-a-tag\n```\n";
        let doc = Parser::default().parse("d", text);
        assert_eq!(doc.blocks.len(), 1);
        let code = &doc.blocks[0];
        assert_eq!(code.kind, BlockKind::CodeBlock);
        assert_eq!(code.language.as_deref(), Some("rust"));
        assert_eq!(code.text, "let x = 1; // #not-a-tag");
        assert!(code.inline.tags.is_empty());
    }

    #[test]
    fn blockquote_lines_group_into_one_block() {
        let text = "> first\n> second\npara\n";
        let doc = Parser::default().parse("d", text);
        assert_eq!(doc.blocks[0].kind, BlockKind::Blockquote);
        assert_eq!(doc.blocks[0].text, "first\nsecond");
        assert_eq!(doc.blocks[0].span.line_end, 1);
        assert_eq!(doc.blocks[1].kind, BlockKind::Paragraph);
    }

    #[test]
    fn inline_annotations_are_extracted() {
        let annotations = extract_inline("see [[Other Note]] and ![[image.png]] #alpha #b/c");
        assert_eq!(annotations.tags, vec!["alpha", "b/c"]);
        assert_eq!(annotations.embeds, vec!["image.png"]);
        assert_eq!(annotations.links.len(), 1);
        assert_eq!(annotations.links[0].target, "Other Note");

        let props = extract_inline("status:: in progress");
        assert_eq!(
            props.properties,
            vec![("status".to_string(), "in progress".to_string())]
        );
    }

    #[test]
    fn md_links_and_embeds() {
        let annotations = extract_inline("a [label](https://example.com) and ![alt](pic.png)");
        assert_eq!(annotations.links.len(), 1);
        assert_eq!(annotations.links[0].text, "label");
        assert_eq!(annotations.links[0].target, "https://example.com");
        assert_eq!(annotations.embeds, vec!["pic.png"]);
    }

    #[test]
    fn empty_document_has_no_blocks() {
        let doc = Parser::default().parse("d", "");
        assert!(doc.blocks.is_empty());

        let only_fm = Parser::default().parse("d", "---\ntitle: T\n---\n");
        assert!(only_fm.blocks.is_empty());
        assert_eq!(only_fm.frontmatter.title.as_deref(), Some("T"));
    }

    #[test]
    fn nested_list_indent_is_recorded_in_spaces() {
        let text = "- top\n  - nested\n    - deeper\n";
        let doc = Parser::default().parse("d", text);
        let indents: Vec<u16> = doc.blocks.iter().filter_map(|b| b.indent).collect();
        assert_eq!(indents, vec![0, 2, 4]);
        assert_eq!(Parser::default().indent_level(4), 2);
    }
}
