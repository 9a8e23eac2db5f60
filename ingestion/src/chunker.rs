use serde::{Deserialize, Serialize};

/// Separator preference, strongest boundary first. The final fallback is
/// a hard character split.
const SEPARATORS: &[&str] = &["\n\n", ". ", "! ", "? ", "; ", " "];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSpan {
    pub index: u32,
    pub text: String,
    /// Char offsets into the sanitized document.
    pub start: usize,
    pub end: usize,
}

/// Recursive splitter with exact overlap: adjacent chunks share exactly
/// `min(overlap, previous_chunk_len − 1)` characters, the shared region
/// being a suffix of the earlier chunk and a prefix of the later one.
#[derive(Debug, Clone, Copy)]
pub struct RecursiveChunker {
    chunk_size: usize,
    overlap: usize,
}

impl RecursiveChunker {
    pub fn new(chunk_size: usize, overlap: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            overlap: overlap.min(chunk_size - 1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    pub fn split(&self, text: &str) -> Vec<ChunkSpan> {
        let chars: Vec<char> = text.chars().collect();
        let total = chars.len();
        if total == 0 {
            return Vec::new();
        }

        let mut spans = Vec::new();
        let mut start = 0usize;
        let mut index = 0u32;
        loop {
            let window_end = (start + self.chunk_size).min(total);
            let end = if window_end == total {
                total
            } else {
                best_split(&chars, start, window_end)
            };

            spans.push(ChunkSpan {
                index,
                text: chars[start..end].iter().collect(),
                start,
                end,
            });

            if end == total {
                break;
            }
            let len = end - start;
            start = end - self.overlap.min(len - 1);
            index += 1;
        }
        spans
    }

    /// Streaming variant: feed the document in arbitrary pieces; chunks
    /// come out as soon as their right boundary is determined. Produces
    /// the same spans as `split` on the concatenated input while holding
    /// at most `chunk_size + overlap` characters plus one push of slack.
    pub fn streaming(&self) -> StreamingChunker {
        StreamingChunker {
            splitter: *self,
            buffer: Vec::new(),
            base_offset: 0,
            next_index: 0,
            carried: 0,
        }
    }
}

/// Latest boundary within `(start, limit]` for the strongest separator
/// that fits; the hard split at `limit` when nothing fits.
fn best_split(chars: &[char], start: usize, limit: usize) -> usize {
    for separator in SEPARATORS {
        let sep: Vec<char> = separator.chars().collect();
        if limit - start < sep.len() {
            continue;
        }
        let mut candidate = limit - sep.len();
        loop {
            if chars[candidate..candidate + sep.len()] == sep[..] {
                let split = candidate + sep.len();
                if split > start {
                    return split;
                }
            }
            if candidate == start {
                break;
            }
            candidate -= 1;
        }
    }
    limit
}

pub struct StreamingChunker {
    splitter: RecursiveChunker,
    buffer: Vec<char>,
    /// Char offset of buffer[0] in the overall stream.
    base_offset: usize,
    next_index: u32,
    /// Chars at the head of the buffer still owned by the previous
    /// chunk's overlap.
    carried: usize,
}

impl StreamingChunker {
    pub fn push(&mut self, piece: &str) -> Vec<ChunkSpan> {
        self.buffer.extend(piece.chars());
        let mut out = Vec::new();
        // A boundary is only final once more than chunk_size characters
        // are buffered; at exactly chunk_size the next push could still
        // extend the chunk's window.
        while self.buffer.len() > self.splitter.chunk_size {
            out.push(self.emit_one());
        }
        out
    }

    pub fn finish(mut self) -> Vec<ChunkSpan> {
        let mut out = Vec::new();
        while self.buffer.len() > self.splitter.chunk_size {
            out.push(self.emit_one());
        }

        if self.buffer.len() > self.carried {
            out.push(ChunkSpan {
                index: self.next_index,
                text: self.buffer.iter().collect(),
                start: self.base_offset,
                end: self.base_offset + self.buffer.len(),
            });
        }
        out
    }

    fn emit_one(&mut self) -> ChunkSpan {
        let end = best_split(&self.buffer, 0, self.splitter.chunk_size);
        let span = ChunkSpan {
            index: self.next_index,
            text: self.buffer[..end].iter().collect(),
            start: self.base_offset,
            end: self.base_offset + end,
        };

        let keep_from = end - self.splitter.overlap.min(end - 1);
        self.buffer.drain(..keep_from);
        self.base_offset += keep_from;
        self.next_index += 1;
        self.carried = end - keep_from;
        span
    }
}

/// P2-style reconstruction: chunk 0 plus each later chunk minus its
/// leading overlap reproduces the input exactly.
pub fn reconstruct(spans: &[ChunkSpan]) -> String {
    let mut out = String::new();
    let mut covered = 0usize;
    for span in spans {
        let skip = covered.saturating_sub(span.start);
        out.extend(span.text.chars().skip(skip));
        covered = span.end;
    }
    out
}
