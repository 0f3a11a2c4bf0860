use crate::models::{
    Block, Chunk, ChunkKind, ChunkMetadata, IngestionOptions, StructuredDocument, Table,
    TextSegment,
};
use sha2::{Digest, Sha256};

pub const EMPTY_CELL: &str = "[空]";
const CONTEXT_BEFORE_LABEL: &str = "上文：";
const CONTEXT_AFTER_LABEL: &str = "下文：";

#[derive(Debug, Clone)]
pub struct ChunkingConfig {
    pub max_chars: usize,
    pub overlap_chars: usize,
    pub table_context_chars: Option<usize>,
    pub tag_tables_for_doc_types: Vec<String>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self::from(&IngestionOptions::default())
    }
}

impl From<&IngestionOptions> for ChunkingConfig {
    fn from(value: &IngestionOptions) -> Self {
        Self {
            max_chars: value.chunk_max_chars.max(1),
            overlap_chars: value.chunk_overlap_chars,
            table_context_chars: value.table_context_chars,
            tag_tables_for_doc_types: value.tag_tables_for_doc_types.clone(),
        }
    }
}

/// Collapses runs of horizontal whitespace inside each line and squeezes
/// consecutive blank lines, keeping paragraph breaks intact.
pub fn normalize_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0usize;

    for line in text.replace('\u{a0}', " ").replace("\r\n", "\n").split('\n') {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            blank_run += 1;
            if blank_run == 1 && !out.is_empty() {
                out.push('\n');
            }
            continue;
        }
        blank_run = 0;
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&collapsed);
        out.push('\n');
    }

    out.trim_end().to_string()
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn byte_offset_of_char(text: &str, chars: usize) -> usize {
    text.char_indices()
        .nth(chars)
        .map_or(text.len(), |(offset, _)| offset)
}

fn tail_chars(text: &str, count: usize) -> &str {
    let total = char_len(text);
    &text[byte_offset_of_char(text, total.saturating_sub(count))..]
}

fn head_chars(text: &str, count: usize) -> &str {
    &text[..byte_offset_of_char(text, count)]
}

pub fn make_chunk_id(source: &str, kind: &str, ordinal: u32, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update(kind.as_bytes());
    hasher.update(ordinal.to_le_bytes());
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Renders a table as one `行N: a | b | c` line per row.
pub fn render_table(table: &Table) -> String {
    table
        .rows
        .iter()
        .enumerate()
        .map(|(index, row)| {
            let cells = row
                .iter()
                .map(|cell| {
                    let trimmed = cell.trim();
                    if trimmed.is_empty() {
                        EMPTY_CELL
                    } else {
                        trimmed
                    }
                })
                .collect::<Vec<_>>()
                .join(" | ");
            format!("行{}: {}", index + 1, cells)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug)]
struct TablePlan<'a> {
    table: &'a Table,
    ordinal: u32,
    title: Option<&'a str>,
    before: String,
    after: String,
}

#[derive(Debug)]
enum PlannedBlock<'a> {
    Paragraph(&'a str),
    Table(TablePlan<'a>),
}

/// Walks paragraphs and tables in document order, emitting size-bounded text
/// chunks and one atomic chunk per table.
pub struct StructuralChunker<'a> {
    config: &'a ChunkingConfig,
}

impl<'a> StructuralChunker<'a> {
    pub fn new(config: &'a ChunkingConfig) -> Self {
        Self { config }
    }

    pub fn chunk(&self, document: &StructuredDocument, source: &str, doc_type: &str) -> Vec<Chunk> {
        let plan = self.plan_blocks(document);
        self.emit(plan, &document.file_name, source, doc_type)
    }

    fn plan_blocks<'d>(&self, document: &'d StructuredDocument) -> Vec<PlannedBlock<'d>> {
        let mut planned = Vec::with_capacity(document.blocks.len());
        let mut pending_title: Option<&'d str> = None;
        let mut ordinal = 0u32;

        for (position, block) in document.blocks.iter().enumerate() {
            match block {
                Block::Paragraph(text) => {
                    let trimmed = text.trim();
                    if !trimmed.is_empty() {
                        pending_title = Some(trimmed);
                    }
                    planned.push(PlannedBlock::Paragraph(text.as_str()));
                }
                Block::Table(table) => {
                    ordinal += 1;
                    let (before, after) = match self.config.table_context_chars {
                        Some(limit) if limit > 0 => (
                            tail_chars(&prose_before(&document.blocks, position), limit)
                                .to_string(),
                            head_chars(&prose_after(&document.blocks, position), limit)
                                .to_string(),
                        ),
                        _ => (String::new(), String::new()),
                    };
                    planned.push(PlannedBlock::Table(TablePlan {
                        table,
                        ordinal,
                        title: pending_title,
                        before,
                        after,
                    }));
                }
            }
        }

        planned
    }

    fn emit(
        &self,
        plan: Vec<PlannedBlock<'_>>,
        file_name: &str,
        source: &str,
        doc_type: &str,
    ) -> Vec<Chunk> {
        let max_chars = self.config.max_chars;
        let tag_tables = self
            .config
            .tag_tables_for_doc_types
            .iter()
            .any(|candidate| candidate == doc_type);

        let mut chunks = Vec::new();
        let mut accumulator = String::new();
        let mut accumulated_chars = 0usize;
        let mut text_index = 0u32;

        let mut push_text = |chunks: &mut Vec<Chunk>, text: String| {
            if text.trim().is_empty() {
                return;
            }
            text_index += 1;
            chunks.push(text_chunk(source, doc_type, text_index, text));
        };

        for block in plan {
            match block {
                PlannedBlock::Paragraph(text) => {
                    let trimmed = text.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    accumulator.push_str(trimmed);
                    accumulator.push('\n');
                    accumulated_chars += char_len(trimmed) + 1;

                    while accumulated_chars >= max_chars {
                        let cut = byte_offset_of_char(&accumulator, max_chars);
                        let rest = accumulator.split_off(cut);
                        let piece = std::mem::replace(&mut accumulator, rest);
                        accumulated_chars -= max_chars;
                        push_text(&mut chunks, piece);
                    }
                }
                PlannedBlock::Table(plan) => {
                    if !accumulator.is_empty() {
                        push_text(&mut chunks, std::mem::take(&mut accumulator));
                        accumulated_chars = 0;
                    }
                    chunks.push(table_chunk(&plan, file_name, source, doc_type, tag_tables));
                }
            }
        }

        if !accumulator.is_empty() {
            push_text(&mut chunks, accumulator);
        }

        chunks
    }
}

fn prose_before(blocks: &[Block], position: usize) -> String {
    let mut collected = Vec::new();
    for block in blocks[..position].iter().rev() {
        match block {
            Block::Paragraph(text) if !text.trim().is_empty() => collected.push(text.trim()),
            Block::Paragraph(_) => {}
            Block::Table(_) => break,
        }
    }
    collected.reverse();
    collected.join("\n")
}

fn prose_after(blocks: &[Block], position: usize) -> String {
    blocks[position + 1..]
        .iter()
        .take_while(|block| matches!(block, Block::Paragraph(_)))
        .filter_map(|block| match block {
            Block::Paragraph(text) if !text.trim().is_empty() => Some(text.trim()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn text_chunk(source: &str, doc_type: &str, chunk_index: u32, content: String) -> Chunk {
    Chunk {
        chunk_id: make_chunk_id(source, "text", chunk_index, &content),
        metadata: ChunkMetadata {
            source: source.to_string(),
            doc_type: doc_type.to_string(),
            kind: ChunkKind::Text {
                chunk_index,
                length: char_len(&content),
            },
        },
        content,
    }
}

fn table_chunk(
    plan: &TablePlan<'_>,
    file_name: &str,
    source: &str,
    doc_type: &str,
    tag_tables: bool,
) -> Chunk {
    let table_name = plan
        .title
        .map(str::to_string)
        .unwrap_or_else(|| format!("表格{}", plan.ordinal));

    let mut lines = Vec::new();
    if tag_tables {
        lines.push(format!("[{file_name}]"));
    }
    if !plan.before.is_empty() {
        lines.push(format!("{CONTEXT_BEFORE_LABEL}{}", plan.before));
    }
    lines.push(render_table(plan.table));
    if !plan.after.is_empty() {
        lines.push(format!("{CONTEXT_AFTER_LABEL}{}", plan.after));
    }
    let content = lines.join("\n");

    Chunk {
        chunk_id: make_chunk_id(source, "table", plan.ordinal, &content),
        metadata: ChunkMetadata {
            source: source.to_string(),
            doc_type: doc_type.to_string(),
            kind: ChunkKind::Table {
                table_index: plan.ordinal,
                table_name,
                row_count: plan.table.row_count(),
                col_count: plan.table.col_count,
                has_context: !plan.before.is_empty() || !plan.after.is_empty(),
            },
        },
        content,
    }
}

fn is_unit_boundary(ch: char) -> bool {
    matches!(ch, '\n' | '。' | '！' | '？' | '；' | '.' | '!' | '?')
}

/// Sentence and paragraph aware splitter for plain text sources.
pub struct TextSplitter {
    max_chars: usize,
    overlap_chars: usize,
}

impl TextSplitter {
    pub fn new(config: &ChunkingConfig) -> Self {
        Self {
            max_chars: config.max_chars.max(1),
            overlap_chars: config.overlap_chars,
        }
    }

    fn units<'t>(&self, text: &'t str) -> Vec<&'t str> {
        let mut sentences = Vec::new();
        let mut start = 0;
        for (offset, ch) in text.char_indices() {
            if is_unit_boundary(ch) {
                let end = offset + ch.len_utf8();
                sentences.push(&text[start..end]);
                start = end;
            }
        }
        if start < text.len() {
            sentences.push(&text[start..]);
        }

        // Sentences longer than a chunk are force-cut without overlap.
        let mut units = Vec::with_capacity(sentences.len());
        for sentence in sentences {
            let mut rest = sentence;
            while char_len(rest) > self.max_chars {
                let cut = byte_offset_of_char(rest, self.max_chars);
                units.push(&rest[..cut]);
                rest = &rest[cut..];
            }
            if !rest.is_empty() {
                units.push(rest);
            }
        }
        units
    }

    pub fn split(&self, text: &str) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut current: Vec<(&str, usize)> = Vec::new();
        let mut current_len = 0usize;

        for unit in self.units(text) {
            let unit_len = char_len(unit);
            if current_len + unit_len > self.max_chars && !current.is_empty() {
                chunks.push(current.iter().map(|(piece, _)| *piece).collect::<String>());

                let mut carried = Vec::new();
                let mut carried_len = 0usize;
                for &(piece, len) in current.iter().rev() {
                    if carried_len + len > self.overlap_chars
                        || carried_len + len + unit_len > self.max_chars
                    {
                        break;
                    }
                    carried.push((piece, len));
                    carried_len += len;
                }
                carried.reverse();
                current = carried;
                current_len = carried_len;
            }
            current.push((unit, unit_len));
            current_len += unit_len;
        }

        if !current.is_empty() {
            chunks.push(current.iter().map(|(piece, _)| *piece).collect::<String>());
        }

        chunks.retain(|chunk| !chunk.trim().is_empty());
        chunks
    }
}

/// Splits every segment of a text-only document, numbering chunks across the
/// whole document.
pub fn chunk_text_segments(
    segments: &[TextSegment],
    source: &str,
    doc_type: &str,
    config: &ChunkingConfig,
) -> Vec<Chunk> {
    let splitter = TextSplitter::new(config);
    let mut index = 0u32;

    segments
        .iter()
        .flat_map(|segment| splitter.split(&segment.text))
        .map(|content| {
            index += 1;
            text_chunk(source, doc_type, index, content)
        })
        .collect()
}
