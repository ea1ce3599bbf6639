//! Sentence-level chunking of raw document text.
//!
//! Text is split on Unicode sentence boundaries (UAX #29). Each sentence
//! becomes one chunk unless the document is long, in which case adjacent
//! sentences are merged into coarser segments so a single document cannot
//! explode into thousands of index entries.
//!
//! Token counts drive both the long-document switch and the noise filter.
//! By default a token is a whitespace-separated word; a Hugging Face
//! tokenizer can be loaded instead with [`Chunker::from_pretrained`].

use std::path::Path;

use tokenizers::Tokenizer;
use unicode_segmentation::UnicodeSegmentation;

use crate::{
    error::{Error, Result},
    model_manager,
};

/// Documents with more tokens than this are chunked into coarser segments.
pub const DEFAULT_LONG_DOCUMENT_TOKENS: usize = 500;

/// Upper bound for a merged segment in long documents.
pub const DEFAULT_SEGMENT_TOKENS: usize = 128;

/// Chunks shorter than this are dropped as noise.
pub const DEFAULT_MIN_TOKENS: usize = 3;

/// Separator used when chunks are stored as a single blob.
///
/// Chunks produced by [`Chunker`] never contain it.
pub const CHUNK_SEPARATOR: char = '\n';

/// Thresholds controlling how text is cut into chunks.
#[derive(Debug, Clone, Copy)]
pub struct ChunkingConfig {
    pub long_document_tokens: usize,
    pub segment_tokens: usize,
    pub min_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            long_document_tokens: DEFAULT_LONG_DOCUMENT_TOKENS,
            segment_tokens: DEFAULT_SEGMENT_TOKENS,
            min_tokens: DEFAULT_MIN_TOKENS,
        }
    }
}

enum TokenCounter {
    Words,
    Model(Box<Tokenizer>),
}

impl TokenCounter {
    fn count(&self, text: &str) -> usize {
        match self {
            TokenCounter::Words => text.split_whitespace().count(),
            TokenCounter::Model(tokenizer) => tokenizer
                .encode(text, false)
                .map(|enc| enc.get_ids().len())
                // A tokenizer that cannot encode the text still has words.
                .unwrap_or_else(|_| text.split_whitespace().count()),
        }
    }
}

/// Splits raw text into ordered, sentence-like chunks.
///
/// # Examples
///
/// ```
/// use docfuse::chunking::Chunker;
///
/// let chunker = Chunker::new();
/// let chunks = chunker.chunk(
///     "Paris is the capital of France. Berlin is the capital of Germany.",
/// );
/// assert_eq!(
///     chunks,
///     vec![
///         "Paris is the capital of France.",
///         "Berlin is the capital of Germany.",
///     ]
/// );
/// ```
pub struct Chunker {
    config: ChunkingConfig,
    counter: TokenCounter,
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new()
    }
}

impl Chunker {
    /// A chunker that counts whitespace-separated words as tokens.
    pub fn new() -> Self {
        Self::with_config(ChunkingConfig::default())
    }

    pub fn with_config(config: ChunkingConfig) -> Self {
        Self {
            config,
            counter: TokenCounter::Words,
        }
    }

    /// A chunker that counts tokens with the tokenizer of `model_id`.
    ///
    /// `model_id` is either a local directory containing `tokenizer.json`
    /// or a Hugging Face Hub model id. Fails with
    /// [`Error::ModelUnavailable`] when the tokenizer cannot be loaded.
    pub fn from_pretrained(model_id: &str, config: ChunkingConfig) -> Result<Self> {
        let path = model_manager::fetch_model_file(model_id, "tokenizer.json")?;
        let tokenizer = load_tokenizer(model_id, &path)?;
        Ok(Self {
            config,
            counter: TokenCounter::Model(Box::new(tokenizer)),
        })
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Split `text` into chunks. Empty or whitespace-only text yields none.
    pub fn chunk(&self, text: &str) -> Vec<String> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        // UAX #29 breaks after every line feed, so hard-wrapped lines are
        // joined first and only blank lines act as paragraph boundaries.
        let sentences: Vec<String> = paragraphs(text)
            .iter()
            .flat_map(|p| {
                p.split_sentence_bounds()
                    .map(normalize_whitespace)
                    .collect::<Vec<_>>()
            })
            .filter(|s| !s.is_empty())
            .collect();

        let counts: Vec<usize> =
            sentences.iter().map(|s| self.counter.count(s)).collect();
        let total: usize = counts.iter().sum();

        let units = if total > self.config.long_document_tokens {
            merge_segments(sentences, &counts, self.config.segment_tokens)
        } else {
            sentences.into_iter().zip(counts).collect()
        };

        units
            .into_iter()
            .filter(|(_, tokens)| *tokens >= self.config.min_tokens)
            .map(|(text, _)| text)
            .collect()
    }

    /// Chunk each input independently, returning one sequence per input.
    pub fn chunk_many<I, S>(&self, texts: I) -> Vec<Vec<String>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        texts.into_iter().map(|t| self.chunk(t.as_ref())).collect()
    }
}

impl std::fmt::Debug for Chunker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counter = match self.counter {
            TokenCounter::Words => "words",
            TokenCounter::Model(_) => "model",
        };
        f.debug_struct("Chunker")
            .field("config", &self.config)
            .field("counter", &counter)
            .finish()
    }
}

fn load_tokenizer(model_id: &str, path: &Path) -> Result<Tokenizer> {
    Tokenizer::from_file(path).map_err(|e| Error::ModelUnavailable {
        model: model_id.to_string(),
        hint: format!(
            "failed to read tokenizer at {}: {e}; delete the cached file or \
             point to a local model directory",
            path.display()
        ),
    })
}

/// Group lines into paragraphs separated by blank lines, each paragraph
/// flattened to a single line.
fn paragraphs(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                out.push(normalize_whitespace(&current.join(" ")));
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        out.push(normalize_whitespace(&current.join(" ")));
    }

    out
}

/// Collapse every run of whitespace (including line breaks) into one space.
fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Greedily merge consecutive sentences into segments of at most
/// `max_tokens` tokens. A sentence longer than the budget stays on its own.
fn merge_segments(
    sentences: Vec<String>,
    counts: &[usize],
    max_tokens: usize,
) -> Vec<(String, usize)> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut current_tokens = 0;

    for (sentence, &tokens) in sentences.into_iter().zip(counts) {
        if !current.is_empty() && current_tokens + tokens > max_tokens {
            segments.push((std::mem::take(&mut current), current_tokens));
            current_tokens = 0;
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(&sentence);
        current_tokens += tokens;
    }

    if !current.is_empty() {
        segments.push((current, current_tokens));
    }

    segments
}
