//! Boundary-aware overlapping text chunker.
//!
//! Splits document text into windows of roughly `chunk_size` characters
//! that overlap by `overlap` characters. Near the nominal end of each
//! window the chunker looks `search_window` characters either side for a
//! natural boundary and snaps to the first marker kind found, in priority
//! order:
//!
//! 1. paragraph break (`\n\n`)
//! 2. sentence terminal followed by a newline
//! 3. sentence terminal followed by a space
//! 4. bare newline
//!
//! Offsets are character (not byte) positions so Cyrillic text is split
//! on the same boundaries a reader sees. Output is a pure function of the
//! input text.

use sha2::{Digest, Sha256};

use crate::config::ChunkingConfig;
use crate::models::TextChunk;

const SENTENCE_TERMINALS: [char; 3] = ['.', '!', '?'];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Boundary {
    Paragraph,
    SentenceNewline,
    SentenceSpace,
    Newline,
}

impl Boundary {
    const PRIORITY: [Boundary; 4] = [
        Boundary::Paragraph,
        Boundary::SentenceNewline,
        Boundary::SentenceSpace,
        Boundary::Newline,
    ];

    /// If the boundary occurs at `pos`, the offset just past it.
    fn match_at(&self, chars: &[char], pos: usize) -> Option<usize> {
        let c = chars[pos];
        let next = chars.get(pos + 1).copied();
        match self {
            Boundary::Paragraph => (c == '\n' && next == Some('\n')).then_some(pos + 2),
            Boundary::SentenceNewline => {
                (SENTENCE_TERMINALS.contains(&c) && next == Some('\n')).then_some(pos + 2)
            }
            Boundary::SentenceSpace => {
                (SENTENCE_TERMINALS.contains(&c) && next == Some(' ')).then_some(pos + 2)
            }
            Boundary::Newline => (c == '\n').then_some(pos + 1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Chunker {
    chunk_size: usize,
    overlap: usize,
    min_chunk_chars: usize,
    search_window: usize,
}

impl Chunker {
    pub fn new(config: &ChunkingConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            overlap: config.overlap.min(config.chunk_size.saturating_sub(1)),
            min_chunk_chars: config.min_chunk_chars,
            search_window: config.search_window,
        }
    }

    /// Split text into ordered, overlapping chunks.
    ///
    /// Chunks whose trimmed content is `min_chunk_chars` long or shorter are
    /// dropped, so empty or very short input yields no chunks at all.
    pub fn split(&self, text: &str) -> Vec<TextChunk> {
        let chars: Vec<char> = text.chars().collect();
        let n = chars.len();
        let mut chunks = Vec::new();
        let mut start = 0usize;

        while start < n {
            let nominal_end = (start + self.chunk_size).min(n);
            let end = if n - nominal_end <= self.min_chunk_chars {
                // Tail too small for its own chunk: absorb it here.
                n
            } else {
                self.snap_end(&chars, start, nominal_end)
            };

            let content: String = chars[start..end].iter().collect();
            let content = content.trim();
            if content.chars().count() > self.min_chunk_chars {
                chunks.push(TextChunk {
                    content: content.to_string(),
                    index: chunks.len(),
                    start_char: start,
                    end_char: end,
                });
            }

            if end >= n {
                break;
            }
            start = end - self.overlap;
        }

        chunks
    }

    fn snap_end(&self, chars: &[char], start: usize, nominal_end: usize) -> usize {
        let n = chars.len();
        // Never snap back into the overlap, or the window would not advance.
        let lo = nominal_end
            .saturating_sub(self.search_window)
            .max(start + self.overlap + 1);
        let hi = (nominal_end + self.search_window).min(n);
        if lo >= hi {
            return nominal_end;
        }

        for boundary in Boundary::PRIORITY {
            let found = (lo..hi)
                .rev()
                .find_map(|pos| boundary.match_at(chars, pos))
                .map(|after| after.min(n));
            if let Some(end) = found {
                return end;
            }
        }
        nominal_end
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(&ChunkingConfig::default())
    }
}

/// SHA-256 of chunk content, stored alongside each persisted chunk.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
