use crate::parser::{Block, ParsedDocument, Parser};
use notemesh_core::model::{BlockKind, ChunkMetadata, DocumentScope, Position};
use serde_json::Value;

/// A chunk proposed by the parser, before ingestion assigns ids. `parent` is
/// an index into the proposal list; slot 0 is always the page.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedChunk {
    pub contents: String,
    pub is_page: bool,
    pub kind: Option<BlockKind>,
    pub parent: Option<usize>,
    pub metadata: ChunkMetadata,
    pub position: Option<Position>,
    pub tag_names: Vec<String>,
    pub document_scope: DocumentScope,
}

/// Turn parse events into the proposed chunk forest:
/// - one page chunk per source (frontmatter title, else source basename);
/// - headings nest under the closest heading of strictly lower level;
/// - list items nest under the closest item of lower indent, else the
///   enclosing heading or page;
/// - paragraphs, code blocks, and blockquotes attach to the closest
///   enclosing heading or page.
pub fn synthesize(doc: &ParsedDocument, parser: &Parser) -> Vec<ProposedChunk> {
    let mut proposals = vec![page_proposal(doc)];

    // (level, proposal index) for headings; (indent, proposal index) for list items.
    let mut heading_stack: Vec<(u8, usize)> = Vec::new();
    let mut list_stack: Vec<(u16, usize)> = Vec::new();

    for block in &doc.blocks {
        match block.kind {
            BlockKind::Heading => {
                let level = block.heading_level.unwrap_or(1);
                while heading_stack
                    .last()
                    .map(|(l, _)| *l >= level)
                    .unwrap_or(false)
                {
                    heading_stack.pop();
                }
                list_stack.clear();

                let parent = heading_stack.last().map(|(_, idx)| *idx).unwrap_or(0);
                let idx = push_block(&mut proposals, doc, block, parent, parser);
                heading_stack.push((level, idx));
            }
            BlockKind::ListItem => {
                let indent = block.indent.unwrap_or(0);
                while list_stack
                    .last()
                    .map(|(i, _)| *i >= indent)
                    .unwrap_or(false)
                {
                    list_stack.pop();
                }
                let parent = list_stack
                    .last()
                    .map(|(_, idx)| *idx)
                    .or_else(|| heading_stack.last().map(|(_, idx)| *idx))
                    .unwrap_or(0);
                let idx = push_block(&mut proposals, doc, block, parent, parser);
                list_stack.push((indent, idx));
            }
            BlockKind::Paragraph | BlockKind::CodeBlock | BlockKind::Blockquote => {
                list_stack.clear();
                let parent = heading_stack.last().map(|(_, idx)| *idx).unwrap_or(0);
                push_block(&mut proposals, doc, block, parent, parser);
            }
        }
    }

    proposals
}

fn page_proposal(doc: &ParsedDocument) -> ProposedChunk {
    let title = doc
        .frontmatter
        .title
        .clone()
        .unwrap_or_else(|| source_basename(&doc.source_id));

    let mut metadata = ChunkMetadata {
        title: Some(title),
        tags: doc.frontmatter.tags.clone(),
        aliases: doc.frontmatter.aliases.clone(),
        css_classes: doc.frontmatter.css_classes.clone(),
        created: doc.frontmatter.created,
        modified: doc.frontmatter.modified,
        ..ChunkMetadata::default()
    };
    for (key, value) in &doc.frontmatter.extra {
        metadata.extra.insert(key.clone(), value.clone());
    }

    ProposedChunk {
        contents: String::new(),
        is_page: true,
        kind: None,
        parent: None,
        metadata,
        position: Some(Position {
            source_id: doc.source_id.clone(),
            line_start: 0,
            line_end: doc.line_count.saturating_sub(1) as u32,
            char_start: 0,
            char_end: doc.byte_len,
        }),
        tag_names: doc.frontmatter.tags.clone(),
        document_scope: DocumentScope::File,
    }
}

fn push_block(
    proposals: &mut Vec<ProposedChunk>,
    doc: &ParsedDocument,
    block: &Block,
    parent: usize,
    parser: &Parser,
) -> usize {
    let mut metadata = ChunkMetadata {
        heading_level: block.heading_level,
        list_indent: block.indent,
        block: Some(block.kind),
        code_language: block.language.clone(),
        ..ChunkMetadata::default()
    };

    if block.indent.is_some() {
        let level = parser.indent_level(block.indent.unwrap_or(0));
        metadata
            .extra
            .insert("list_level".into(), Value::from(level as u64));
    }
    for (key, value) in &block.inline.properties {
        metadata
            .extra
            .insert(key.clone(), Value::String(value.clone()));
    }
    if !block.inline.links.is_empty() {
        metadata.extra.insert(
            "links".into(),
            Value::Array(
                block
                    .inline
                    .links
                    .iter()
                    .map(|l| Value::String(l.target.clone()))
                    .collect(),
            ),
        );
    }
    if !block.inline.embeds.is_empty() {
        metadata.extra.insert(
            "embeds".into(),
            Value::Array(
                block
                    .inline
                    .embeds
                    .iter()
                    .map(|e| Value::String(e.clone()))
                    .collect(),
            ),
        );
    }

    proposals.push(ProposedChunk {
        contents: block.text.clone(),
        is_page: false,
        kind: Some(block.kind),
        parent: Some(parent),
        metadata,
        position: Some(Position {
            source_id: doc.source_id.clone(),
            line_start: block.span.line_start,
            line_end: block.span.line_end,
            char_start: block.span.char_start,
            char_end: block.span.char_end,
        }),
        tag_names: block.inline.tags.clone(),
        document_scope: DocumentScope::File,
    });
    proposals.len() - 1
}

fn source_basename(source_id: &str) -> String {
    let name = source_id.rsplit('/').next().unwrap_or(source_id);
    name.rsplit_once('.')
        .map(|(stem, _)| stem.to_string())
        .unwrap_or_else(|| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Vec<ProposedChunk> {
        let parser = Parser::default();
        let doc = parser.parse("notes/a.md", text);
        synthesize(&doc, &parser)
    }

    #[test]
    fn empty_document_yields_one_page_chunk() {
        let proposals = parse("");
        assert_eq!(proposals.len(), 1);
        assert!(proposals[0].is_page);
        assert_eq!(proposals[0].metadata.title.as_deref(), Some("a"));
    }

    #[test]
    fn frontmatter_only_document_yields_page_with_metadata() {
        let proposals = parse("---\ntitle: Note A\ntags: [alpha]\n---\n");
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].metadata.title.as_deref(), Some("Note A"));
        assert_eq!(proposals[0].tag_names, vec!["alpha"]);
    }

    #[test]
    fn parent_chain_follows_heading_and_list_structure() {
        let proposals = parse("# H1\npara\n## H2\n- a\n  - b\n");
        // page, H1, para, H2, a, b
        assert_eq!(proposals.len(), 6);
        assert_eq!(proposals[1].parent, Some(0)); // H1 -> page
        assert_eq!(proposals[2].parent, Some(1)); // para -> H1
        assert_eq!(proposals[3].parent, Some(1)); // H2 -> H1
        assert_eq!(proposals[4].parent, Some(3)); // a -> H2
        assert_eq!(proposals[5].parent, Some(4)); // b -> a
    }

    #[test]
    fn sibling_heading_of_same_level_pops_the_stack() {
        let proposals = parse("## A\n## B\npara\n");
        assert_eq!(proposals[2].parent, Some(0)); // B -> page, not A
        assert_eq!(proposals[3].parent, Some(2)); // para -> B
    }

    #[test]
    fn list_after_paragraph_attaches_to_heading() {
        let proposals = parse("# H\n- a\npara\n- b\n");
        // page, H, a, para, b
        assert_eq!(proposals[2].parent, Some(1));
        assert_eq!(proposals[3].parent, Some(1));
        // Paragraph interrupts the list: "b" starts a new one under H.
        assert_eq!(proposals[4].parent, Some(1));
    }

    #[test]
    fn inline_tags_become_tag_names() {
        let proposals = parse("# H\nmentions #alpha here\n");
        assert_eq!(proposals[2].tag_names, vec!["alpha"]);
    }
}
