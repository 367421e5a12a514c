use crate::document::Document;
use std::collections::VecDeque;

const DEFAULT_CHUNK_SIZE: usize = 4000;
const DEFAULT_CHUNK_OVERLAP: usize = 50;

/// Splitter parameters. Sizes are counted in characters.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkingConfig {
    /// Maximum characters per chunk
    pub chunk_size: usize,
    /// Characters shared between adjacent chunks of a document
    pub chunk_overlap: usize,
    /// Separators to split on, tried in order
    pub separators: Vec<String>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        ChunkingConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            separators: vec![" ".to_string(), ",".to_string(), "\n".to_string()],
        }
    }
}

/// Represents a text chunk with metadata
#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    /// The actual text content of this chunk
    pub text: String,
    /// Title of the document this chunk was cut from
    pub title: String,
    /// Page of the source document, when paginated
    pub page: Option<u32>,
    /// Folder the source document belongs to
    pub folder_id: String,
    /// Byte offset of this chunk in the original document
    pub start_position: usize,
}

/// A contiguous span of the input that is never split further
#[derive(Debug, Clone, Copy)]
struct Piece {
    start: usize,
    end: usize,
    chars: usize,
}

/// Recursive separator-based splitter.
///
/// Text longer than `chunk_size` is cut at the first configured separator that
/// occurs in it; any resulting segment still too long is cut again with the
/// remaining separators. Segments are then packed greedily into chunks, and each
/// new chunk starts with the trailing segments of the previous one, up to
/// `chunk_overlap` characters. Separators stay attached to the segment that
/// follows them, so chunks are exact slices of the input. Chunks holding only
/// whitespace are dropped.
pub struct TextSplitter {
    config: ChunkingConfig,
}

impl TextSplitter {
    pub fn new(config: ChunkingConfig) -> Self {
        TextSplitter { config }
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Split every document, carrying its metadata onto each chunk
    pub fn split_documents(&self, docs: &[Document]) -> Vec<TextChunk> {
        docs.iter()
            .flat_map(|doc| {
                self.split_text(&doc.content)
                    .into_iter()
                    .map(move |(start_position, text)| TextChunk {
                        text: text.to_string(),
                        title: doc.title.clone(),
                        page: doc.page,
                        folder_id: doc.folder_id.clone(),
                        start_position,
                    })
            })
            .collect()
    }

    /// Split text into `(byte offset, slice)` pairs
    pub fn split_text<'a>(&self, text: &'a str) -> Vec<(usize, &'a str)> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let mut pieces = Vec::new();
        self.collect_pieces(text, 0, &self.config.separators, &mut pieces);

        self.merge_pieces(&pieces)
            .into_iter()
            .map(|(start, end)| (start, &text[start..end]))
            .filter(|(_, chunk)| !chunk.trim().is_empty())
            .collect()
    }

    fn collect_pieces(&self, text: &str, offset: usize, separators: &[String], out: &mut Vec<Piece>) {
        let chars = text.chars().count();
        let whole = Piece {
            start: offset,
            end: offset + text.len(),
            chars,
        };

        if chars <= self.config.chunk_size {
            out.push(whole);
            return;
        }

        let Some(position) = separators
            .iter()
            .position(|sep| !sep.is_empty() && text.contains(sep.as_str()))
        else {
            // Nothing left to split on
            out.push(whole);
            return;
        };
        let separator = separators[position].as_str();
        let narrower = &separators[position + 1..];

        let mut segment_start = 0;
        for (idx, _) in text.match_indices(separator) {
            if idx > segment_start {
                self.collect_pieces(&text[segment_start..idx], offset + segment_start, narrower, out);
                segment_start = idx;
            }
        }
        self.collect_pieces(&text[segment_start..], offset + segment_start, narrower, out);
    }

    fn merge_pieces(&self, pieces: &[Piece]) -> Vec<(usize, usize)> {
        let size = self.config.chunk_size;
        let overlap = self.config.chunk_overlap;

        let mut spans = Vec::new();
        let mut window: VecDeque<Piece> = VecDeque::new();
        let mut total = 0;

        for piece in pieces {
            if total + piece.chars > size {
                if let (Some(first), Some(last)) = (window.front(), window.back()) {
                    spans.push((first.start, last.end));
                }

                while total > overlap || (total > 0 && total + piece.chars > size) {
                    match window.pop_front() {
                        Some(dropped) => total -= dropped.chars,
                        None => break,
                    }
                }
            }

            total += piece.chars;
            window.push_back(*piece);
        }

        if let (Some(first), Some(last)) = (window.front(), window.back()) {
            spans.push((first.start, last.end));
        }

        spans
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn splitter(chunk_size: usize, chunk_overlap: usize) -> TextSplitter {
        TextSplitter::new(ChunkingConfig {
            chunk_size,
            chunk_overlap,
            ..ChunkingConfig::default()
        })
    }

    /// Rebuild the source by appending the part of each chunk past the previous end
    fn reassemble(text: &str, spans: &[(usize, &str)]) -> String {
        let mut rebuilt = String::new();
        let mut covered = 0;
        for (start, chunk) in spans {
            assert!(*start <= covered, "gap before offset {}", start);
            let end = start + chunk.len();
            assert_eq!(&text[*start..end], *chunk);
            if end > covered {
                rebuilt.push_str(&text[covered..end]);
                covered = end;
            }
        }
        rebuilt
    }

    const POLICY: &str = "Refunds are issued within 30 days of purchase, provided the item is \
        unused.\nStore credit is offered after that, at the discretion of the manager, for up \
        to 90 days.\nDigital goods are final sale.";

    #[test]
    fn test_chunks_cover_whole_text() {
        for (size, overlap) in [(20, 5), (35, 10), (64, 0), (4000, 50)] {
            let spans = splitter(size, overlap).split_text(POLICY);
            assert_eq!(reassemble(POLICY, &spans), POLICY, "size {} overlap {}", size, overlap);
        }
    }

    #[test]
    fn test_chunks_respect_max_size() {
        let spans = splitter(30, 8).split_text(POLICY);
        assert!(spans.len() > 1);
        for (_, chunk) in spans {
            assert!(chunk.chars().count() <= 30, "chunk too long: {:?}", chunk);
        }
    }

    #[test]
    fn test_adjacent_chunks_overlap() {
        let text = "aa bb cc dd ee ff gg hh";
        let spans = splitter(10, 4).split_text(text);
        let chunks: Vec<&str> = spans.iter().map(|(_, c)| *c).collect();
        assert_eq!(chunks, vec!["aa bb cc", " cc dd ee", " ee ff gg", " gg hh"]);

        for pair in spans.windows(2) {
            let (prev_start, prev) = pair[0];
            let (next_start, _) = pair[1];
            let shared = prev_start + prev.len() - next_start;
            assert!(shared > 0 && shared <= 4);
        }
    }

    #[test]
    fn test_zero_overlap_produces_disjoint_chunks() {
        let spans = splitter(10, 0).split_text("aa bb cc dd ee ff gg hh");
        for pair in spans.windows(2) {
            assert_eq!(pair[0].0 + pair[0].1.len(), pair[1].0);
        }
    }

    #[test]
    fn test_unsplittable_word_is_kept_whole() {
        let text = "short averyveryverylongwordthatcannotsplit end";
        let spans = splitter(10, 0).split_text(text);
        let chunks: Vec<&str> = spans.iter().map(|(_, c)| *c).collect();
        assert!(chunks.contains(&" averyveryverylongwordthatcannotsplit"));
        assert_eq!(reassemble(text, &spans), text);
    }

    #[test]
    fn test_falls_back_to_narrower_separators() {
        let text = "alpha,beta,gamma,delta,epsilon";
        let spans = TextSplitter::new(ChunkingConfig {
            chunk_size: 12,
            chunk_overlap: 0,
            separators: vec![" ".into(), ",".into()],
        })
        .split_text(text);
        let chunks: Vec<&str> = spans.iter().map(|(_, c)| *c).collect();
        assert_eq!(chunks, vec!["alpha,beta", ",gamma,delta", ",epsilon"]);
    }

    #[test]
    fn test_counts_characters_not_bytes() {
        let text = "héllo wörld ça va";
        let spans = splitter(11, 0).split_text(text);
        assert_eq!(spans[0].1, "héllo wörld");
        assert_eq!(reassemble(text, &spans), text);
    }

    #[test]
    fn test_split_is_deterministic() {
        let docs = vec![
            Document::new(POLICY.to_string(), "Policy.pdf", Some(2), "F1"),
            Document::new("Ask support for help.".to_string(), "FAQ", None, "F1"),
        ];
        let splitter = splitter(25, 6);
        let first = splitter.split_documents(&docs);
        let second = splitter.split_documents(&docs);
        assert_eq!(first, second);
    }

    #[test]
    fn test_chunks_inherit_document_metadata() {
        let docs = vec![Document::new(POLICY.to_string(), "Policy.pdf", Some(2), "F1")];
        let chunks = splitter(40, 10).split_documents(&docs);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert_eq!(chunk.title, "Policy.pdf");
            assert_eq!(chunk.page, Some(2));
            assert_eq!(chunk.folder_id, "F1");
            assert!(POLICY[chunk.start_position..].starts_with(&chunk.text));
        }
    }

    #[test]
    fn test_whitespace_runs_yield_no_blank_chunks() {
        let text = " x  y   z    w     ";
        let spans = splitter(5, 2).split_text(text);
        assert!(!spans.is_empty());
        for (start, chunk) in &spans {
            assert!(!chunk.trim().is_empty(), "blank chunk at {}: {:?}", start, chunk);
            assert_eq!(&text[*start..start + chunk.len()], *chunk);
        }
        let words: String = spans.iter().flat_map(|(_, c)| c.split_whitespace()).collect();
        for word in ["x", "y", "z", "w"] {
            assert!(words.contains(word), "lost {:?}", word);
        }
    }

    #[test]
    fn test_blank_documents_produce_no_chunks() {
        let docs = vec![Document::new("  \n ".to_string(), "Empty", None, "F1")];
        assert!(splitter(10, 2).split_documents(&docs).is_empty());
    }
}
