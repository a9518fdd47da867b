//! Incremental sentence segmentation
//!
//! Turns a stream of text fragments (which may split mid-word) into complete
//! sentences at terminal punctuation, so synthesis can start while the
//! generator is still producing. Long run-on text without punctuation is
//! soft-split at a word break to keep first-audio latency bounded; anything
//! still buffered at stream end comes out of [`SentenceSegmenter::flush`].

/// Terminal punctuation that closes a sentence
const TERMINALS: &[char] = &['.', '!', '?', '。', '！', '？'];

/// Break characters acceptable for a soft split
const SOFT_BREAKS: &[char] = &[' ', ',', '，'];

/// Minimum length of a soft-split chunk, in characters
const MIN_SOFT_CHARS: usize = 28;

/// Accumulates text fragments and emits complete sentences
#[derive(Debug)]
pub struct SentenceSegmenter {
    buffer: String,
    max_chars: usize,
}

impl SentenceSegmenter {
    /// Create a segmenter that soft-splits run-on text past `max_chars`
    #[must_use]
    pub fn new(max_chars: usize) -> Self {
        Self {
            buffer: String::new(),
            max_chars: max_chars.max(MIN_SOFT_CHARS),
        }
    }

    /// Feed one fragment, returning any sentences completed by it, in order
    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        self.buffer.push_str(fragment);

        let mut sentences = Vec::new();
        loop {
            if let Some(raw) = self.take_sentence() {
                if let Some(sentence) = clean(&raw) {
                    sentences.push(sentence);
                }
                continue;
            }
            if let Some(raw) = self.take_soft_chunk() {
                if let Some(chunk) = clean(&raw) {
                    sentences.push(chunk);
                }
                continue;
            }
            break;
        }
        sentences
    }

    /// Emit the trailing partial sentence at stream end, if any
    pub fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        clean(&rest)
    }

    /// Remove and return everything up to and including the first terminal
    /// punctuation mark
    fn take_sentence(&mut self) -> Option<String> {
        let end = self
            .buffer
            .char_indices()
            .find_map(|(i, c)| TERMINALS.contains(&c).then(|| i + c.len_utf8()))?;

        Some(self.buffer.drain(..end).collect())
    }

    /// Soft-split a run-on buffer at the last word break before `max_chars`
    fn take_soft_chunk(&mut self) -> Option<String> {
        let mut min_idx = None;
        let mut limit_idx = self.buffer.len();
        for (chars, (i, _)) in self.buffer.char_indices().enumerate() {
            if chars == MIN_SOFT_CHARS {
                min_idx = Some(i);
            }
            if chars == self.max_chars {
                limit_idx = i;
                break;
            }
        }

        // Shorter than max_chars: keep accumulating
        if limit_idx == self.buffer.len() && self.buffer.chars().count() < self.max_chars {
            return None;
        }
        let min_idx = min_idx?;

        let cut = self.buffer[..limit_idx].rfind(|c: char| SOFT_BREAKS.contains(&c))?;
        if cut < min_idx {
            return None;
        }

        let end = cut + self.buffer[cut..].chars().next().map_or(1, char::len_utf8);
        Some(self.buffer.drain(..end).collect())
    }
}

/// Trim and drop degenerate (empty or single-character) segments
fn clean(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.chars().count() > 1 {
        Some(trimmed.to_string())
    } else {
        None
    }
}
