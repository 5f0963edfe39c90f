//! Markdown chunking multiplier block

use crate::blocks::{parse_config, Block, BlockFactory, BlockOutput, BlockSpec, ConfigSchema, ParamSchema};
use crate::context::BlockExecutionContext;
use crate::error::EngineResult;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct MarkdownMultiplierConfig {
    parser_type: String,
    chunk_size: usize,
    chunk_overlap: usize,
}

impl Default for MarkdownMultiplierConfig {
    fn default() -> Self {
        Self {
            parser_type: "markdown".to_string(),
            chunk_size: 0,
            chunk_overlap: 50,
        }
    }
}

/// Split `file_content` into chunks, fanning each chunk out as an
/// independent seed. `markdown` mode splits at headings, `sentence`
/// mode yields one chunk per sentence.
pub struct MarkdownMultiplier {
    parser_type: String,
    chunk_size: usize,
    chunk_overlap: usize,
}

impl MarkdownMultiplier {
    pub fn spec() -> BlockSpec {
        BlockSpec {
            type_name: "MarkdownMultiplier".to_string(),
            name: "Markdown Chunker".to_string(),
            description: "Split markdown into chunks, one seed per chunk".to_string(),
            category: "seeders".to_string(),
            inputs: vec!["file_content".to_string()],
            outputs: vec!["chunk_text".to_string(), "chunk_index".to_string()],
            is_multiplier: true,
            dependencies: vec![],
            config_schema: ConfigSchema::new()
                .property(
                    "parser_type",
                    ParamSchema::new("string")
                        .with_default(json!("markdown"))
                        .with_enum(vec![json!("markdown"), json!("sentence")])
                        .with_description(
                            "Chunking strategy: 'markdown' respects structure, \
                             'sentence' splits by sentences",
                        ),
                )
                .property(
                    "chunk_size",
                    ParamSchema::new("integer")
                        .with_default(json!(0))
                        .with_description(
                            "Maximum chunk size in characters (0 keeps markdown sections whole)",
                        ),
                )
                .property(
                    "chunk_overlap",
                    ParamSchema::new("integer")
                        .with_default(json!(50))
                        .with_description("Overlap between packed chunks in characters"),
                ),
        }
    }

    pub fn factory() -> BlockFactory {
        Arc::new(|config| {
            let config: MarkdownMultiplierConfig = parse_config("MarkdownMultiplier", config)?;
            Ok(Arc::new(MarkdownMultiplier {
                parser_type: config.parser_type,
                chunk_size: config.chunk_size,
                chunk_overlap: config.chunk_overlap,
            }) as Arc<dyn Block>)
        })
    }

    fn chunk(&self, content: &str) -> Vec<String> {
        if self.parser_type == "sentence" {
            self.sentence_chunks(content)
        } else {
            self.markdown_chunks(content)
        }
    }

    /// One chunk per sentence; sentences longer than `chunk_size` are
    /// hard-split.
    fn sentence_chunks(&self, content: &str) -> Vec<String> {
        let mut chunks = Vec::new();
        for sentence in split_sentences(content) {
            if self.chunk_size > 0 && sentence.len() > self.chunk_size {
                chunks.extend(hard_split(&sentence, self.chunk_size));
            } else {
                chunks.push(sentence);
            }
        }
        chunks
    }

    /// Sections at heading boundaries; with a chunk size, sentences inside
    /// each section are packed up to that size with overlap carried from
    /// the previous chunk.
    fn markdown_chunks(&self, content: &str) -> Vec<String> {
        let sections = split_sections(content);
        if self.chunk_size == 0 {
            return sections;
        }

        let mut chunks = Vec::new();
        for section in sections {
            chunks.extend(pack_sentences(
                &split_sentences(&section),
                self.chunk_size,
                self.chunk_overlap,
            ));
        }
        chunks
    }
}

#[async_trait]
impl Block for MarkdownMultiplier {
    async fn execute(&self, context: &BlockExecutionContext) -> EngineResult<BlockOutput> {
        let content = context.get_state_str("file_content");
        let seeds = self
            .chunk(content)
            .into_iter()
            .enumerate()
            .map(|(index, text)| {
                let mut seed = serde_json::Map::new();
                seed.insert("chunk_text".to_string(), Value::String(text));
                seed.insert("chunk_index".to_string(), json!(index));
                seed
            })
            .collect();
        Ok(BlockOutput::Fanout(seeds))
    }
}

/// Split text into sentences at `.`/`!`/`?` boundaries, keeping the
/// terminator with the sentence
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);
        if matches!(c, '.' | '!' | '?') {
            let at_boundary = chars.peek().map_or(true, |next| next.is_whitespace());
            if at_boundary {
                let sentence = current.trim();
                if !sentence.is_empty() {
                    sentences.push(sentence.to_string());
                }
                current.clear();
            }
        }
    }
    let tail = current.trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }
    sentences
}

/// Split markdown into sections at heading lines
fn split_sections(content: &str) -> Vec<String> {
    let mut sections = Vec::new();
    let mut current = String::new();

    for line in content.lines() {
        if line.trim_start().starts_with('#') && !current.trim().is_empty() {
            sections.push(current.trim().to_string());
            current.clear();
        }
        current.push_str(line);
        current.push('\n');
    }
    if !current.trim().is_empty() {
        sections.push(current.trim().to_string());
    }
    sections
}

fn hard_split(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(size)
        .map(|piece| piece.iter().collect::<String>().trim().to_string())
        .filter(|piece| !piece.is_empty())
        .collect()
}

/// Pack sentences into chunks of at most `size` characters; each chunk
/// after the first starts with up to `overlap` characters of the
/// previous chunk's tail
fn pack_sentences(sentences: &[String], size: usize, overlap: usize) -> Vec<String> {
    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();

    for sentence in sentences {
        let candidate_len = if current.is_empty() {
            sentence.len()
        } else {
            current.len() + 1 + sentence.len()
        };
        if candidate_len > size && !current.is_empty() {
            chunks.push(current.clone());
            let tail_start = current.len().saturating_sub(overlap);
            let tail = current
                .get(tail_start..)
                .unwrap_or_default()
                .trim_start()
                .to_string();
            current = tail;
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(sentence);
    }
    if !current.trim().is_empty() {
        chunks.push(current.trim().to_string());
    }
    chunks
}
