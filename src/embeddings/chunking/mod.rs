
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ConfigError;

/// How far (in characters) on either side of a raw cut point to look for a sentence end
pub const SENTENCE_SEARCH_RADIUS: usize = 20;

const SENTENCE_TERMINALS: [char; 3] = ['.', '!', '?'];

/// Represents a chunk of document text ready for embedding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    /// The chunk text, an exact slice of the source
    pub text: String,
    /// Position of this chunk within the document
    pub ordinal: usize,
    /// Start offset in characters (inclusive)
    pub start: usize,
    /// End offset in characters (exclusive)
    pub end: usize,
}

/// Configuration for text chunking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Window size in characters
    pub chunk_size: usize,
    /// Characters shared between adjacent windows
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    #[inline]
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
        }
    }
}

impl ChunkingConfig {
    #[inline]
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size,
            chunk_overlap,
        }
    }

    /// Distance the window start moves after each chunk.
    ///
    /// Rejects configurations that would never advance instead of looping forever.
    #[inline]
    pub fn stride(&self) -> Result<usize, ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::InvalidChunkSize(self.chunk_size));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(ConfigError::OverlapNotSmallerThanSize(
                self.chunk_overlap,
                self.chunk_size,
            ));
        }
        Ok(self.chunk_size - self.chunk_overlap)
    }
}

/// Split text into overlapping, sentence-aware chunks.
///
/// Windows are `chunk_size` characters wide. When a window does not reach the end of the
/// text, the cut point is moved to just after the last `.`, `!` or `?` found within
/// [`SENTENCE_SEARCH_RADIUS`] characters of the raw cut; otherwise it is cut hard.
/// Every character of `text` is contained in at least one chunk.
#[inline]
pub fn chunk_text(text: &str, config: &ChunkingConfig) -> Result<Vec<TextChunk>, ConfigError> {
    let stride = config.stride()?;

    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();
    let mut chunks = Vec::with_capacity(len / stride + 1);
    let mut start = 0;

    while start < len {
        let raw_end = (start + config.chunk_size).min(len);
        let end = if raw_end < len {
            snap_to_sentence_end(&chars, start, raw_end)
        } else {
            raw_end
        };

        chunks.push(TextChunk {
            text: chars[start..end].iter().collect(),
            ordinal: chunks.len(),
            start,
            end,
        });

        if end >= len {
            break;
        }

        // Snapping backwards by more than the overlap would otherwise open a gap
        start = (start + stride).min(end);
    }

    debug!(
        "Chunked {} characters into {} chunks (size {}, overlap {})",
        len,
        chunks.len(),
        config.chunk_size,
        config.chunk_overlap
    );

    Ok(chunks)
}

/// Find the cut point for a window starting at `start` whose raw cut is `raw_end`.
fn snap_to_sentence_end(chars: &[char], start: usize, raw_end: usize) -> usize {
    let low = raw_end
        .saturating_sub(SENTENCE_SEARCH_RADIUS)
        .max(start + 1);
    let high = (raw_end + SENTENCE_SEARCH_RADIUS).min(chars.len());

    chars[low..high]
        .iter()
        .rposition(|c| SENTENCE_TERMINALS.contains(c))
        .map_or(raw_end, |offset| low + offset + 1)
}
