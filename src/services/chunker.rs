//! Sentence-aware text chunking with token-bounded overlap.

use crate::error::ChunkError;
use crate::models::{IndexingConfig, TailPolicy, TextChunk};
use crate::utils::estimate_tokens;

/// Size bounds for chunking, all measured in estimated tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingOptions {
    /// Target tokens per chunk
    pub chunk_size: usize,
    /// Tokens of trailing context carried into the next chunk
    pub overlap_size: usize,
    /// Chunks below this are only emitted through the tail policy
    pub min_chunk_size: usize,
    /// Hard ceiling that forces a flush before the target is reached
    pub max_chunk_size: usize,
    pub tail_policy: TailPolicy,
}

impl Default for ChunkingOptions {
    fn default() -> Self {
        Self::from(&IndexingConfig::default())
    }
}

impl From<&IndexingConfig> for ChunkingOptions {
    fn from(config: &IndexingConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            overlap_size: config.overlap_size,
            min_chunk_size: config.min_chunk_size,
            max_chunk_size: config.max_chunk_size,
            tail_policy: config.tail_policy,
        }
    }
}

impl ChunkingOptions {
    pub fn validate(&self) -> Result<(), ChunkError> {
        for (field, value) in [
            ("chunk_size", self.chunk_size),
            ("min_chunk_size", self.min_chunk_size),
            ("max_chunk_size", self.max_chunk_size),
        ] {
            if value == 0 {
                return Err(ChunkError::ZeroSize { field });
            }
        }
        if self.min_chunk_size > self.chunk_size {
            return Err(ChunkError::MinExceedsTarget {
                min: self.min_chunk_size,
                chunk: self.chunk_size,
            });
        }
        if self.chunk_size > self.max_chunk_size {
            return Err(ChunkError::TargetExceedsMax {
                chunk: self.chunk_size,
                max: self.max_chunk_size,
            });
        }
        if self.overlap_size >= self.chunk_size {
            return Err(ChunkError::OverlapTooLarge {
                overlap: self.overlap_size,
                chunk: self.chunk_size,
            });
        }
        Ok(())
    }
}

/// One sentence of the source, located by both byte and char offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Sentence<'a> {
    text: &'a str,
    byte_start: usize,
    byte_end: usize,
    char_start: usize,
    char_end: usize,
    tokens: usize,
}

impl<'a> Sentence<'a> {
    fn new(source: &'a str, bytes: (usize, usize), chars: (usize, usize)) -> Self {
        let text = &source[bytes.0..bytes.1];
        Self {
            text,
            byte_start: bytes.0,
            byte_end: bytes.1,
            char_start: chars.0,
            char_end: chars.1,
            // Every sentence costs at least one token so emitted chunks never count zero.
            tokens: estimate_tokens(text).max(1),
        }
    }
}

/// Split on `.`, `!` or `?` followed by whitespace; each sentence is trimmed.
///
/// Text without terminal punctuation comes back as one sentence.
fn split_sentences(text: &str) -> Vec<Sentence<'_>> {
    let mut sentences = Vec::new();
    // (byte, char) of the first non-whitespace character of the open sentence
    let mut open: Option<(usize, usize)> = None;
    // (byte, char) just past the last non-whitespace character seen
    let mut last_end = (0, 0);

    let mut chars = text.char_indices().enumerate().peekable();
    while let Some((char_idx, (byte_idx, c))) = chars.next() {
        if c.is_whitespace() {
            continue;
        }
        if open.is_none() {
            open = Some((byte_idx, char_idx));
        }
        last_end = (byte_idx + c.len_utf8(), char_idx + 1);

        let at_boundary = matches!(c, '.' | '!' | '?')
            && chars
                .peek()
                .is_some_and(|(_, (_, next))| next.is_whitespace());
        if at_boundary && let Some(start) = open.take() {
            sentences.push(Sentence::new(
                text,
                (start.0, last_end.0),
                (start.1, last_end.1),
            ));
        }
    }

    if let Some(start) = open {
        sentences.push(Sentence::new(
            text,
            (start.0, last_end.0),
            (start.1, last_end.1),
        ));
    }

    sentences
}

/// Working buffer of sentences awaiting emission.
#[derive(Default)]
struct Buffer<'a> {
    sentences: Vec<Sentence<'a>>,
    tokens: usize,
    /// Sentences added since the last flush (the rest are overlap seed)
    fresh: usize,
}

impl<'a> Buffer<'a> {
    fn is_empty(&self) -> bool {
        self.sentences.is_empty()
    }

    fn push(&mut self, sentence: Sentence<'a>) {
        self.tokens += sentence.tokens;
        self.fresh += 1;
        self.sentences.push(sentence);
    }

    fn clear(&mut self) {
        self.sentences.clear();
        self.tokens = 0;
        self.fresh = 0;
    }

    /// Replace the buffer with its trailing overlap: the longest suffix whose
    /// token total stays within `overlap`, never the whole buffer.
    fn reseed(&mut self, overlap: usize) {
        let mut acc = 0;
        let mut keep = 0;
        for sentence in self.sentences.iter().rev().take(self.sentences.len() - 1) {
            if acc + sentence.tokens > overlap {
                break;
            }
            acc += sentence.tokens;
            keep += 1;
        }
        self.sentences.drain(..self.sentences.len() - keep);
        self.tokens = acc;
        self.fresh = 0;
    }

    fn fresh_tokens(&self) -> usize {
        self.sentences[self.sentences.len() - self.fresh..]
            .iter()
            .map(|s| s.tokens)
            .sum()
    }
}

/// Splits document text into overlapping, size-bounded chunks.
#[derive(Debug, Clone)]
pub struct TextChunker {
    options: ChunkingOptions,
}

impl TextChunker {
    /// Create a chunker, rejecting malformed options.
    pub fn new(options: ChunkingOptions) -> Result<Self, ChunkError> {
        options.validate()?;
        Ok(Self { options })
    }

    /// Create a chunker with default settings.
    pub fn with_defaults() -> Self {
        Self {
            options: ChunkingOptions::default(),
        }
    }

    pub fn options(&self) -> &ChunkingOptions {
        &self.options
    }

    /// Chunk `text` into an ordered sequence of chunks.
    pub fn chunk(&self, text: &str) -> Vec<TextChunk> {
        let opts = &self.options;
        let mut chunks: Vec<TextChunk> = Vec::new();
        let mut buffer = Buffer::default();

        for sentence in split_sentences(text) {
            if !buffer.is_empty() && buffer.tokens + sentence.tokens > opts.max_chunk_size {
                if buffer.fresh > 0 {
                    chunks.push(Self::emit(text, &buffer.sentences, chunks.len()));
                    buffer.reseed(opts.overlap_size);
                }
                // The seed alone cannot make room for this sentence.
                if buffer.fresh == 0 && buffer.tokens + sentence.tokens > opts.max_chunk_size {
                    buffer.clear();
                }
            }

            buffer.push(sentence);

            if buffer.tokens >= opts.chunk_size && buffer.tokens >= opts.min_chunk_size {
                chunks.push(Self::emit(text, &buffer.sentences, chunks.len()));
                buffer.reseed(opts.overlap_size);
            }
        }

        if buffer.fresh > 0 {
            self.finish_tail(text, &mut chunks, &buffer);
        }

        chunks
    }

    fn finish_tail(&self, text: &str, chunks: &mut Vec<TextChunk>, buffer: &Buffer<'_>) {
        let opts = &self.options;
        if buffer.tokens >= opts.min_chunk_size {
            let index = chunks.len();
            chunks.push(Self::emit(text, &buffer.sentences, index));
            return;
        }

        match opts.tail_policy {
            TailPolicy::Discard => {}
            TailPolicy::Merge => {
                let fresh = &buffer.sentences[buffer.sentences.len() - buffer.fresh..];
                let fresh_tokens = buffer.fresh_tokens();
                match chunks.last_mut() {
                    Some(last) if last.token_count + fresh_tokens <= opts.max_chunk_size => {
                        let end = fresh[fresh.len() - 1];
                        let start_byte = byte_offset(text, last.start_position);
                        last.content = text[start_byte..end.byte_end].to_string();
                        last.end_position = end.char_end;
                        last.token_count += fresh_tokens;
                        last.sentences
                            .extend(fresh.iter().map(|s| s.text.to_string()));
                    }
                    _ => {
                        let index = chunks.len();
                        chunks.push(Self::emit(text, &buffer.sentences, index));
                    }
                }
            }
        }
    }

    fn emit(text: &str, sentences: &[Sentence<'_>], index: usize) -> TextChunk {
        let first = sentences[0];
        let last = sentences[sentences.len() - 1];
        TextChunk {
            chunk_index: index as u32,
            content: text[first.byte_start..last.byte_end].to_string(),
            start_position: first.char_start,
            end_position: last.char_end,
            token_count: sentences.iter().map(|s| s.tokens).sum(),
            sentences: sentences.iter().map(|s| s.text.to_string()).collect(),
        }
    }
}

/// Byte offset of the `char_pos`-th character.
fn byte_offset(text: &str, char_pos: usize) -> usize {
    text.char_indices()
        .nth(char_pos)
        .map(|(b, _)| b)
        .unwrap_or(text.len())
}

/// Validate `options` and chunk `text` in one call.
pub fn chunk_text(text: &str, options: &ChunkingOptions) -> Result<Vec<TextChunk>, ChunkError> {
    Ok(TextChunker::new(*options)?.chunk(text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn options(chunk: usize, overlap: usize, min: usize, max: usize) -> ChunkingOptions {
        ChunkingOptions {
            chunk_size: chunk,
            overlap_size: overlap,
            min_chunk_size: min,
            max_chunk_size: max,
            tail_policy: TailPolicy::Merge,
        }
    }

    #[test]
    fn test_three_sentences_single_chunk() {
        let text = "Sentence one. Sentence two. Sentence three.";
        let chunks = chunk_text(text, &options(1000, 0, 1, 1000)).unwrap();

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, text);
        assert_eq!(chunks[0].sentences.len(), 3);
        assert_eq!(chunks[0].start_position, 0);
        assert_eq!(chunks[0].end_position, text.chars().count());
        assert_eq!(chunks[0].token_count, 6);
    }

    #[test]
    fn test_empty_and_blank_input() {
        let chunker = TextChunker::with_defaults();
        assert!(chunker.chunk("").is_empty());
        assert!(chunker.chunk("   \n\t ").is_empty());
    }

    #[test]
    fn test_no_terminal_punctuation_is_one_sentence() {
        let sentences = split_sentences("no punctuation here at all");
        assert_eq!(sentences.len(), 1);
        assert_eq!(sentences[0].text, "no punctuation here at all");
    }

    #[test]
    fn test_split_requires_whitespace_after_punctuation() {
        let sentences = split_sentences("Version 1.2 is out! Really?Yes. Done");
        let texts: Vec<_> = sentences.iter().map(|s| s.text).collect();
        assert_eq!(texts, vec!["Version 1.2 is out!", "Really?Yes.", "Done"]);
    }

    #[test]
    fn test_offsets_are_char_based() {
        let text = "Héllo wörld. Ünïcode text.";
        let sentences = split_sentences(text);
        assert_eq!(sentences[1].char_start, 13);
        assert_eq!(sentences[1].char_end, text.chars().count());
    }

    #[test]
    fn test_overlap_carries_trailing_sentence() {
        // Each sentence is "wN wN wN wN." = 3 tokens.
        let text = (0..6)
            .map(|i| format!("w{i} w{i} w{i} w{i}."))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = chunk_text(&text, &options(6, 3, 1, 12)).unwrap();

        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            let tail = pair[0].sentences.last().unwrap();
            assert_eq!(&pair[1].sentences[0], tail);
        }
    }

    #[test]
    fn test_max_forces_flush() {
        let text = "a b c d. e f g h. i j k l. m n o p.";
        // target unreachable before the ceiling
        let chunks = chunk_text(text, &options(8, 0, 8, 8)).unwrap();
        assert!(chunks.iter().all(|c| c.token_count <= 8));
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn test_small_tail_merges_into_previous() {
        let text = "a b c d e f g h. i j k l m n o p. tail.";
        let chunks = chunk_text(text, &options(6, 0, 4, 20)).unwrap();

        assert_eq!(chunks.len(), 2);
        let last = chunks.last().unwrap();
        assert!(last.content.ends_with("tail."));
        assert_eq!(last.end_position, text.chars().count());
    }

    #[test]
    fn test_small_tail_discarded_with_discard_policy() {
        let text = "a b c d e f g h. i j k l m n o p. tail.";
        let mut opts = options(6, 0, 4, 20);
        opts.tail_policy = TailPolicy::Discard;
        let chunks = chunk_text(text, &opts).unwrap();

        assert_eq!(chunks.len(), 2);
        assert!(!chunks[1].content.contains("tail"));
    }

    #[test]
    fn test_short_document_yields_one_chunk() {
        let chunks = TextChunker::with_defaults().chunk("Just a short note.");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "Just a short note.");
    }

    #[test]
    fn test_overlap_only_buffer_not_emitted() {
        let text = "a b c d e f g h. i j k l m n o p.";
        let chunks = chunk_text(text, &options(6, 5, 1, 20)).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].sentences, vec!["i j k l m n o p."]);
    }

    #[test]
    fn test_validate_rejects_malformed_options() {
        assert_eq!(
            options(0, 0, 1, 10).validate(),
            Err(ChunkError::ZeroSize {
                field: "chunk_size"
            })
        );
        assert!(matches!(
            options(10, 0, 20, 30).validate(),
            Err(ChunkError::MinExceedsTarget { .. })
        ));
        assert!(matches!(
            options(40, 0, 1, 30).validate(),
            Err(ChunkError::TargetExceedsMax { .. })
        ));
        assert!(matches!(
            options(10, 10, 1, 30).validate(),
            Err(ChunkError::OverlapTooLarge { .. })
        ));
        assert!(ChunkingOptions::default().validate().is_ok());
    }

    fn sentence_strategy() -> impl Strategy<Value = String> {
        prop::collection::vec("[a-zé]{1,6}", 1..=5)
            .prop_map(|words| format!("{}.", words.join(" ")))
    }

    proptest! {
        #[test]
        fn prop_offsets_and_indices(
            sentences in prop::collection::vec(sentence_strategy(), 0..40),
            chunk in 4usize..30,
            overlap_frac in 0usize..4,
            min_frac in 1usize..4,
            extra in 0usize..20,
        ) {
            let text = sentences.join(" ");
            let overlap = chunk * overlap_frac / 4;
            let min = (chunk * min_frac / 4).max(1);
            let opts = options(chunk, overlap, min, chunk + extra);
            let chunks = chunk_text(&text, &opts).unwrap();
            let chars: Vec<char> = text.chars().collect();

            for (i, c) in chunks.iter().enumerate() {
                prop_assert_eq!(c.chunk_index as usize, i);
                prop_assert!(c.start_position <= c.end_position);
                prop_assert!(c.end_position <= chars.len());
                prop_assert!(c.token_count > 0);
                let span: String = chars[c.start_position..c.end_position].iter().collect();
                prop_assert_eq!(&span, &c.content);
            }
        }

        #[test]
        fn prop_overlap_reappears_at_head(
            sentences in prop::collection::vec(sentence_strategy(), 2..40),
            chunk in 6usize..24,
            overlap in 4usize..6,
            extra in 0usize..10,
        ) {
            // Sentences hold at most 4 tokens, so a seed always fits.
            let text = sentences.join(" ");
            let opts = options(chunk, overlap, 1, chunk + overlap + 4 + extra);
            let chunks = chunk_text(&text, &opts).unwrap();

            for pair in chunks.windows(2) {
                let (cur, next) = (&pair[0], &pair[1]);
                let carried = (1..=next.sentences.len().min(cur.sentences.len()))
                    .any(|k| cur.sentences.ends_with(&next.sentences[..k]));
                prop_assert!(carried, "chunk {} tail missing from chunk {}", cur.chunk_index, next.chunk_index);
            }
        }
    }
}
