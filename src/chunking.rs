//! Word-window chunking of normalized document text.
//!
//! Text is split on whitespace into consecutive, non-overlapping windows of
//! at most `max_words` words. Windows whose trimmed length falls below a
//! character floor are dropped as noise. The split is deterministic, which
//! is what lets an interrupted batch be redone with identical output.

use serde::{Deserialize, Serialize};

/// Default window size in words.
pub const DEFAULT_MAX_WORDS: usize = 400;

/// Chunks shorter than this many characters are discarded.
pub const DEFAULT_MIN_CHUNK_CHARS: usize = 50;

/// Chunk window settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    /// Maximum number of words per chunk.
    pub max_words: usize,
    /// Minimum trimmed character count for a chunk to be kept.
    pub min_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_words: DEFAULT_MAX_WORDS,
            min_chars: DEFAULT_MIN_CHUNK_CHARS,
        }
    }
}

/// A bounded passage of a document, the unit of indexing and retrieval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Build-wide id, increasing in corpus line order.
    pub id: u64,
    pub text: String,
    /// Provenance: the record's own source, or `line_<n>`.
    pub source: String,
    /// Zero-based index of the originating non-empty corpus line.
    pub line: u64,
    /// Batch that produced this chunk.
    pub batch: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub category: String,
}

/// Split text into word windows of at most `max_words` words.
///
/// Words are joined with single spaces, so runs of whitespace in the input
/// collapse. Windows with fewer than `min_chars` characters are skipped.
/// A `max_words` of zero is treated as one.
///
/// # Examples
///
/// ```
/// use memdex::chunking::chunk_text;
///
/// let text = "alpha beta gamma delta";
/// assert_eq!(chunk_text(text, 2, 0), vec!["alpha beta", "gamma delta"]);
///
/// // Tiny windows are dropped
/// assert!(chunk_text("too short", 400, 50).is_empty());
/// ```
pub fn chunk_text(
    text: &str,
    max_words: usize,
    min_chars: usize,
) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    let window = max_words.max(1);

    words
        .chunks(window)
        .map(|w| w.join(" "))
        .filter(|chunk| chunk.chars().count() >= min_chars)
        .collect()
}

/// Chunk text with the given configuration.
pub fn chunk_with(text: &str, config: &ChunkingConfig) -> Vec<String> {
    chunk_text(text, config.max_words, config.min_chars)
}
