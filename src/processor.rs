//! DocumentProcessor (§4.2): type detection, front-matter extraction,
//! heading-tree chunking with overlap and hierarchical summary chunks.
//!
//! Grounded on the teacher's `vector_store.rs` boundary-aware chunk splitting
//! (`ast_chunk`/`line_range_chunks`, generalized here from AST-symbol
//! boundaries to heading/paragraph boundaries) and on
//! `other_examples/836dffd5_cortesi-ra__crates-ra-index-src-document.rs.rs`'s
//! parent/child chunk-tree shape.

use crate::config::ChunkingConfig;
use crate::document::{
    chunk_id, content_hash, document_id, ChunkType, Document, DocumentChunk, DocumentType,
    Priority,
};
use crate::redact::{is_blocklisted_key, redact};
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

const MAX_INPUT_BYTES: usize = 1024 * 1024; // 1 MiB cap (§4.2 Security)

fn script_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<script.*?>.*?</script>").unwrap())
}

fn event_handler_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)\son[a-z]+\s*=\s*"[^"]*""#).unwrap())
}

fn sanitize_content(input: &str) -> String {
    let no_script = script_tag_re().replace_all(input, "");
    let no_handlers = event_handler_re().replace_all(&no_script, "");
    no_handlers.into_owned()
}

pub fn detect_type(path: &str, content: &str) -> DocumentType {
    let ext = path.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "md" | "markdown" | "mdx" => DocumentType::Markdown,
        "rst" => DocumentType::Rst,
        "html" | "htm" => DocumentType::Html,
        "yaml" | "yml" => DocumentType::Yaml,
        "json" => DocumentType::Json,
        "xml" => DocumentType::Xml,
        "rs" | "ts" | "tsx" | "js" | "jsx" | "py" | "go" | "java" | "kt" | "cs" | "cpp" | "c"
        | "rb" | "php" => DocumentType::Code,
        "" => sniff_type(content),
        _ => DocumentType::Plain,
    }
}

fn sniff_type(content: &str) -> DocumentType {
    let trimmed = content.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if serde_json::from_str::<serde_json::Value>(trimmed).is_ok() {
            return DocumentType::Json;
        }
    }
    if trimmed.starts_with("<?xml") || (trimmed.starts_with('<') && trimmed.contains('>')) {
        return DocumentType::Xml;
    }
    DocumentType::Plain
}

struct FrontMatter {
    map: HashMap<String, String>,
    title: Option<String>,
    description: Option<String>,
    tags: Vec<String>,
    category: Option<String>,
    language: Option<String>,
    framework: Option<String>,
    author: Option<String>,
}

/// Parses a leading `---`-delimited YAML block. Malformed blocks are ignored
/// (the document still processes) per §4.2.
fn extract_front_matter(content: &str) -> (FrontMatter, &str) {
    let empty = FrontMatter {
        map: HashMap::new(),
        title: None,
        description: None,
        tags: Vec::new(),
        category: None,
        language: None,
        framework: None,
        author: None,
    };

    let Some(rest) = content.strip_prefix("---\n").or_else(|| content.strip_prefix("---\r\n"))
    else {
        return (empty, content);
    };

    let Some(end) = rest.find("\n---") else {
        return (empty, content);
    };

    let yaml_block = &rest[..end];
    let after_delimiter = end + "\n---".len();
    let body_start = rest[after_delimiter.min(rest.len())..]
        .find('\n')
        .map(|i| after_delimiter + i + 1)
        .unwrap_or(rest.len());
    let body = &rest[body_start.min(rest.len())..];

    let Ok(serde_yaml::Value::Mapping(mapping)) = serde_yaml::from_str::<serde_yaml::Value>(yaml_block)
    else {
        return (empty, content);
    };

    let mut map = HashMap::new();
    for (k, v) in mapping.iter() {
        let Some(key) = k.as_str() else { continue };
        if is_blocklisted_key(key) {
            continue; // dropped outright, per §4.2
        }
        let value_str = match v {
            serde_yaml::Value::String(s) => s.clone(),
            serde_yaml::Value::Sequence(seq) => seq
                .iter()
                .filter_map(|i| i.as_str().map(|s| s.to_string()))
                .collect::<Vec<_>>()
                .join(", "),
            other => serde_yaml::to_string(other).unwrap_or_default().trim().to_string(),
        };
        map.insert(key.to_string(), redact(&value_str));
    }

    let tags = mapping
        .get("tags")
        .and_then(|v| v.as_sequence())
        .map(|seq| seq.iter().filter_map(|i| i.as_str().map(String::from)).collect())
        .unwrap_or_default();

    let fm = FrontMatter {
        title: map.get("title").cloned(),
        description: map.get("description").cloned(),
        category: map.get("category").cloned(),
        language: map.get("language").cloned(),
        framework: map.get("framework").cloned(),
        author: map.get("author").cloned(),
        tags,
        map,
    };
    (fm, body)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Paragraph,
    Code,
    List,
    Table,
    Blockquote,
}

impl From<BlockKind> for ChunkType {
    fn from(b: BlockKind) -> Self {
        match b {
            BlockKind::Paragraph => ChunkType::Paragraph,
            BlockKind::Code => ChunkType::Code,
            BlockKind::List => ChunkType::List,
            BlockKind::Table => ChunkType::Table,
            BlockKind::Blockquote => ChunkType::Blockquote,
        }
    }
}

struct Block {
    content: String,
    start_line: usize,
    end_line: usize,
    kind: BlockKind,
}

/// Splits text on blank-line boundaries, keeping fenced code blocks intact as
/// a single block regardless of blank lines inside them.
fn split_into_blocks(text: &str, line_offset: usize) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_start = 0usize;
    let mut in_fence = false;

    let lines: Vec<&str> = text.lines().collect();
    for (idx, line) in lines.iter().enumerate() {
        let is_fence_delim = line.trim_start().starts_with("```");
        if is_fence_delim {
            in_fence = !in_fence;
        }

        if line.trim().is_empty() && !in_fence {
            if !current.is_empty() {
                blocks.push(finish_block(&current, current_start, line_offset));
                current.clear();
            }
            continue;
        }

        if current.is_empty() {
            current_start = idx;
        }
        current.push(line);
    }
    if !current.is_empty() {
        blocks.push(finish_block(&current, current_start, line_offset));
    }
    blocks
}

fn finish_block(lines: &[&str], start_idx: usize, line_offset: usize) -> Block {
    let content = lines.join("\n");
    let first = lines[0].trim_start();
    let kind = if first.starts_with("```") {
        BlockKind::Code
    } else if first.starts_with('|') {
        BlockKind::Table
    } else if first.starts_with('>') {
        BlockKind::Blockquote
    } else if first.starts_with('-') || first.starts_with('*') || first.starts_with('+')
        || first.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false) && first.contains('.')
    {
        BlockKind::List
    } else {
        BlockKind::Paragraph
    };
    Block {
        content,
        start_line: start_idx + line_offset + 1,
        end_line: start_idx + line_offset + lines.len(),
        kind,
    }
}

struct RawChunk {
    content: String,
    start_line: Option<usize>,
    end_line: Option<usize>,
    kind: BlockKind,
}

/// Packs blocks into chunks up to `max_chars`, prefixing each chunk after the
/// first with the overlap tail of the previous one, snapped to a line
/// boundary. A single oversize block is hard-split on character count unless
/// it's a code fence, which is kept intact per §4.2.
fn pack_blocks(blocks: &[Block], max_chars: usize, overlap_chars: usize) -> Vec<RawChunk> {
    let mut out: Vec<RawChunk> = Vec::new();
    let mut cur_content = String::new();
    let mut cur_start: Option<usize> = None;
    let mut cur_end: Option<usize> = None;
    let mut cur_kind = BlockKind::Paragraph;

    let flush = |out: &mut Vec<RawChunk>, content: &mut String, start: &mut Option<usize>, end: &mut Option<usize>, kind: BlockKind| {
        if !content.trim().is_empty() {
            out.push(RawChunk {
                content: content.clone(),
                start_line: *start,
                end_line: *end,
                kind,
            });
        }
        content.clear();
        *start = None;
        *end = None;
    };

    for block in blocks {
        let would_be = if cur_content.is_empty() {
            block.content.len()
        } else {
            cur_content.len() + 2 + block.content.len()
        };

        if !cur_content.is_empty() && would_be > max_chars {
            flush(&mut out, &mut cur_content, &mut cur_start, &mut cur_end, cur_kind);
            let tail = overlap_tail(&out, overlap_chars);
            cur_content = tail;
        }

        if block.content.len() > max_chars && block.kind != BlockKind::Code {
            // Hard-split an oversize non-fence block on char count, snapped to lines.
            if !cur_content.is_empty() {
                flush(&mut out, &mut cur_content, &mut cur_start, &mut cur_end, cur_kind);
                cur_content = overlap_tail(&out, overlap_chars);
            }
            for piece in hard_split(&block.content, max_chars) {
                out.push(RawChunk {
                    content: piece,
                    start_line: Some(block.start_line),
                    end_line: Some(block.end_line),
                    kind: block.kind,
                });
            }
            continue;
        }

        if cur_content.is_empty() {
            cur_start = Some(block.start_line);
        }
        if !cur_content.is_empty() {
            cur_content.push_str("\n\n");
        }
        cur_content.push_str(&block.content);
        cur_end = Some(block.end_line);
        cur_kind = block.kind;
    }

    flush(&mut out, &mut cur_content, &mut cur_start, &mut cur_end, cur_kind);
    out
}

fn overlap_tail(existing: &[RawChunk], overlap_chars: usize) -> String {
    let Some(prev) = existing.last() else {
        return String::new();
    };
    if overlap_chars == 0 || prev.content.len() <= overlap_chars {
        return prev.content.clone();
    }
    let mut cut = prev.content.len() - overlap_chars;
    // snap forward to the next line boundary so we never start mid-line
    while cut < prev.content.len() && !prev.content.as_bytes().get(cut).map(|b| *b == b'\n').unwrap_or(true) {
        cut += 1;
    }
    prev.content[cut.min(prev.content.len())..].trim_start_matches('\n').to_string()
}

fn hard_split(text: &str, max_chars: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut buf = String::new();
    for line in text.lines() {
        if !buf.is_empty() && buf.len() + 1 + line.len() > max_chars {
            out.push(std::mem::take(&mut buf));
        }
        if !buf.is_empty() {
            buf.push('\n');
        }
        buf.push_str(line);
    }
    if !buf.is_empty() {
        out.push(buf);
    }
    if out.is_empty() {
        out.push(text.to_string());
    }
    out
}

struct HeadingNode<'a> {
    level: usize,
    title: String,
    /// Content belonging directly to this heading, before any child heading.
    body: &'a str,
    body_line_offset: usize,
    children: Vec<HeadingNode<'a>>,
}

fn heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(#{1,6})\s+(.+?)\s*$").unwrap())
}

/// Builds the heading tree for a markdown document. The returned root has
/// level 0 and holds the document's preamble (content before the first
/// heading) as its own body.
fn parse_heading_tree(text: &str) -> HeadingNode<'_> {
    let lines: Vec<&str> = text.lines().collect();
    let mut heads: Vec<(usize, usize, String)> = Vec::new(); // (line_idx, level, title)
    for (i, line) in lines.iter().enumerate() {
        if let Some(caps) = heading_re().captures(line) {
            let level = caps[1].len();
            let title = caps[2].to_string();
            heads.push((i, level, title));
        }
    }

    fn body_slice<'a>(text: &'a str, lines: &[&str], start_line: usize, end_line: usize) -> &'a str {
        if start_line >= end_line || start_line >= lines.len() {
            return "";
        }
        let start_byte: usize = lines[..start_line].iter().map(|l| l.len() + 1).sum();
        let end_byte: usize = lines[..end_line.min(lines.len())]
            .iter()
            .map(|l| l.len() + 1)
            .sum();
        text.get(start_byte..end_byte.min(text.len())).unwrap_or("")
    }

    // Build recursively using a cursor over `heads`.
    fn build<'a>(
        text: &'a str,
        lines: &[&str],
        heads: &[(usize, usize, String)],
        idx: &mut usize,
        level: usize,
        body_start_line: usize,
    ) -> HeadingNode<'a> {
        let own_line = if *idx > 0 { heads[*idx - 1].0 + 1 } else { body_start_line };
        let title = if *idx > 0 { heads[*idx - 1].2.clone() } else { String::new() };

        let mut children = Vec::new();
        // Body runs from own_line until the next heading at any level (start
        // of that heading's line) — captured as `own_body_end`.
        let own_body_end = heads.get(*idx).map(|(l, _, _)| *l).unwrap_or(lines.len());
        let own_body = body_slice(text, lines, own_line, own_body_end);

        while *idx < heads.len() && heads[*idx].1 > level {
            let child_start = heads[*idx].0 + 1;
            *idx += 1;
            children.push(build(text, lines, heads, idx, heads[*idx - 1].1, child_start));
        }

        HeadingNode {
            level,
            title,
            body: own_body,
            body_line_offset: own_line,
            children,
        }
    }

    let mut idx = 0usize;
    // Skip directly into building root (level 0); `build` consumes headings
    // whose level > 0 as children.
    let mut root = build(text, &lines, &heads, &mut idx, 0, 0);
    // Re-drive: because build() above already advances idx past all heads
    // once started at level 0 (every heading level is >0), root.children is
    // fully populated in one pass.
    if idx < heads.len() {
        // Defensive: shouldn't happen since level 0 > any 1..=6 is false and
        // the while loop consumes everything, but guard against stragglers.
        root.children.extend(std::iter::empty());
    }
    root
}

struct ChunkBuildCtx<'a> {
    document_id: &'a str,
    repository: &'a str,
    filepath: &'a str,
    priority: Priority,
    category: Option<&'a str>,
    language: Option<&'a str>,
    framework: Option<&'a str>,
    cfg: &'a ChunkingConfig,
}

fn make_chunk(
    ctx: &ChunkBuildCtx,
    content: String,
    chunk_type: ChunkType,
    start_line: Option<usize>,
    end_line: Option<usize>,
    heading_context: Vec<String>,
    section: String,
    parent_chunk_id: Option<String>,
) -> DocumentChunk {
    let id = chunk_id(ctx.document_id, &content);
    let hash = content_hash(&content);
    DocumentChunk {
        id,
        document_id: ctx.document_id.to_string(),
        repository: ctx.repository.to_string(),
        filepath: ctx.filepath.to_string(),
        chunk_type,
        content,
        start_line,
        end_line,
        parent_chunk_id,
        child_chunk_ids: Vec::new(),
        heading_context,
        section,
        title: None,
        category: ctx.category.map(String::from),
        language: ctx.language.map(String::from),
        framework: ctx.framework.map(String::from),
        priority: ctx.priority,
        content_hash: hash,
        embedding: None,
    }
}

/// Emits chunks for a heading subtree. Returns (chunks, representative_id)
/// where representative_id is what a parent links to via child_chunk_ids —
/// the summary chunk's ID for a non-leaf node, or the first leaf chunk's ID
/// for a leaf node.
fn emit_heading_chunks(
    node: &HeadingNode,
    ctx: &ChunkBuildCtx,
    heading_context: Vec<String>,
    parent_id: Option<String>,
    out: &mut Vec<DocumentChunk>,
) -> Option<String> {
    let is_root = node.level == 0;

    if node.children.is_empty() {
        // Leaf section: chunk the body directly.
        if node.body.trim().is_empty() {
            return None;
        }
        let blocks = split_into_blocks(node.body, node.body_line_offset);
        let raw = pack_blocks(&blocks, ctx.cfg.max_chunk_size, ctx.cfg.overlap_size);
        let mut first_id = None;
        for (i, rc) in raw.into_iter().enumerate() {
            let chunk_type = if is_root { ChunkType::Paragraph } else { rc.kind.into() };
            let chunk = make_chunk(
                ctx,
                rc.content,
                chunk_type,
                rc.start_line,
                rc.end_line,
                heading_context.clone(),
                node.title.clone(),
                if i == 0 { parent_id.clone() } else { None },
            );
            if first_id.is_none() {
                first_id = Some(chunk.id.clone());
            }
            out.push(chunk);
        }
        first_id
    } else {
        // Non-leaf: a summary chunk (heading line + intro paragraph) linking
        // down to each child's representative chunk.
        let mut own_heading_context = heading_context.clone();
        if !is_root {
            own_heading_context.push(node.title.clone());
        }

        let mut child_ids = Vec::new();
        let mut child_out = Vec::new();
        for child in &node.children {
            if let Some(cid) =
                emit_heading_chunks(child, ctx, own_heading_context.clone(), None, &mut child_out)
            {
                child_ids.push(cid);
            }
        }

        let summary_id = if is_root {
            if node.body.trim().is_empty() {
                None
            } else {
                let mut chunk = make_chunk(
                    ctx,
                    node.body.trim().to_string(),
                    ChunkType::Paragraph,
                    None,
                    None,
                    heading_context.clone(),
                    String::new(),
                    parent_id.clone(),
                );
                chunk.child_chunk_ids = child_ids.clone();
                let id = chunk.id.clone();
                out.push(chunk);
                Some(id)
            }
        } else {
            let summary_content = format!(
                "{}\n\n{}",
                "#".repeat(node.level) + " " + &node.title,
                node.body.trim()
            );
            let mut chunk = make_chunk(
                ctx,
                summary_content,
                ChunkType::Heading,
                None,
                None,
                heading_context.clone(),
                node.title.clone(),
                parent_id.clone(),
            );
            chunk.child_chunk_ids = child_ids.clone();
            let id = chunk.id.clone();
            out.push(chunk);
            Some(id)
        };

        // Fix up each child's parent_chunk_id to point at the summary we just
        // created (children were built with parent_id = None above since the
        // summary's own id wasn't known yet).
        if let Some(ref sid) = summary_id {
            for c in child_out.iter_mut() {
                if c.parent_chunk_id.is_none() && is_direct_child_repr(c, &child_ids) {
                    c.parent_chunk_id = Some(sid.clone());
                }
            }
        }
        out.extend(child_out);

        summary_id
    }
}

fn is_direct_child_repr(chunk: &DocumentChunk, child_ids: &[String]) -> bool {
    child_ids.iter().any(|id| id == &chunk.id)
}

fn chunk_non_structured(body: &str, ctx: &ChunkBuildCtx) -> Vec<DocumentChunk> {
    let blocks = split_into_blocks(body, 0);
    let raw = pack_blocks(&blocks, ctx.cfg.max_chunk_size, ctx.cfg.overlap_size);
    raw.into_iter()
        .map(|rc| {
            make_chunk(
                ctx,
                rc.content,
                rc.kind.into(),
                rc.start_line,
                rc.end_line,
                Vec::new(),
                String::new(),
                None,
            )
        })
        .collect()
}

/// `process(path, bytes, repository) → (Document, [Chunk])` (§4.2). Pure:
/// calling twice on identical input yields identical IDs and hashes.
pub fn process(
    path: &str,
    bytes: &[u8],
    repository: &Repository,
    cfg: &ChunkingConfig,
) -> anyhow::Result<(Document, Vec<DocumentChunk>)> {
    let capped = if bytes.len() > MAX_INPUT_BYTES {
        &bytes[..MAX_INPUT_BYTES]
    } else {
        bytes
    };
    let raw = String::from_utf8_lossy(capped).into_owned();
    let sanitized = sanitize_content(&raw);

    let doc_type = detect_type(path, &sanitized);
    let (fm, body) = if doc_type == DocumentType::Markdown {
        extract_front_matter(&sanitized)
    } else {
        (
            FrontMatter {
                map: HashMap::new(),
                title: None,
                description: None,
                tags: Vec::new(),
                category: None,
                language: None,
                framework: None,
                author: None,
            },
            sanitized.as_str(),
        )
    };

    let hash = content_hash(body);
    let doc_id = document_id(&repository.name, path, &hash);

    let extra_metadata: HashMap<String, String> = fm
        .map
        .iter()
        .filter(|(k, _)| {
            !matches!(
                k.as_str(),
                "title" | "description" | "tags" | "category" | "language" | "framework"
                    | "author" | "version" | "date"
            )
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let ctx = ChunkBuildCtx {
        document_id: &doc_id,
        repository: &repository.name,
        filepath: path,
        priority: repository.priority,
        category: fm.category.as_deref().or(repository.category.as_deref()),
        language: fm.language.as_deref(),
        framework: fm.framework.as_deref(),
        cfg,
    };

    let mut chunks = match doc_type {
        DocumentType::Markdown => {
            let tree = parse_heading_tree(body);
            let mut out = Vec::new();
            emit_heading_chunks(&tree, &ctx, Vec::new(), None, &mut out);
            out
        }
        _ => chunk_non_structured(body, &ctx),
    };

    for c in chunks.iter_mut() {
        c.title = fm.title.clone();
    }

    let document = Document {
        id: doc_id.clone(),
        repository: repository.name.clone(),
        filepath: path.to_string(),
        doc_type,
        title: fm.title,
        description: fm.description,
        tags: fm.tags,
        category: ctx.category.map(String::from),
        language: fm.language,
        framework: fm.framework,
        author: fm.author,
        extra_metadata,
        content: body.to_string(),
        chunk_ids: chunks.iter().map(|c| c.id.clone()).collect(),
        last_modified: chrono::Utc::now(),
        content_hash: hash,
    };

    Ok((document, chunks))
}

use crate::document::Repository;
