use crate::error::PipelineError;
use crate::models::{Document, RecommendedSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub size: usize,
    pub overlap: usize,
}

impl ChunkingConfig {
    pub fn new(size: usize, overlap: usize) -> Result<Self, PipelineError> {
        if size == 0 {
            return Err(PipelineError::InvalidChunkConfig(
                "chunk size must be greater than zero".to_string(),
            ));
        }
        if overlap >= size {
            return Err(PipelineError::InvalidChunkConfig(format!(
                "chunk overlap {overlap} must be smaller than chunk size {size}"
            )));
        }
        Ok(Self { size, overlap })
    }

    /// Distance between the starts of consecutive chunks.
    pub fn stride(&self) -> usize {
        self.size - self.overlap
    }

    /// Number of chunks produced for a text of `len` characters.
    pub fn chunk_count(&self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        len.saturating_sub(self.overlap).div_ceil(self.stride()).max(1)
    }
}

/// Splits `text` into character windows of `size` that overlap by `overlap` characters.
///
/// Chunk `i` starts at `i * (size - overlap)`; the last chunk may be shorter than `size`.
pub fn chunk(text: &str, size: usize, overlap: usize) -> Result<Vec<String>, PipelineError> {
    let config = ChunkingConfig::new(size, overlap)?;
    Ok(chunk_with(text, config))
}

pub fn chunk_with(text: &str, config: ChunkingConfig) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let count = config.chunk_count(chars.len());

    (0..count)
        .map(|index| {
            let start = index * config.stride();
            let end = (start + config.size).min(chars.len());
            chars[start..end].iter().collect()
        })
        .collect()
}

const KB: f64 = 1024.0;

/// Advisory `(size, overlap)` for a set of uploads of `total_bytes` combined.
pub fn recommend_settings(total_bytes: u64) -> RecommendedSettings {
    let total_size_kb = total_bytes as f64 / KB;
    let (size, overlap) = if total_size_kb < 50.0 {
        (300, 30)
    } else if total_size_kb < 500.0 {
        (600, 60)
    } else if total_size_kb < 2000.0 {
        (1000, 100)
    } else {
        (1500, 150)
    };

    RecommendedSettings {
        recommended_chunk_size: size,
        recommended_chunk_overlap: overlap,
        total_size_kb: (total_size_kb * 100.0).round() / 100.0,
    }
}

/// Recommendation for a set of uploads; only their sizes matter.
pub fn recommend_for(documents: &[Document]) -> RecommendedSettings {
    recommend_settings(documents.iter().map(|document| document.bytes.len() as u64).sum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn stitch(chunks: &[String], overlap: usize) -> String {
        let mut text = String::new();
        for (index, chunk) in chunks.iter().enumerate() {
            let skip = if index == 0 { 0 } else { overlap };
            text.extend(chunk.chars().skip(skip));
        }
        text
    }

    fn expected_windows(text: &str, size: usize, overlap: usize) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        let stride = size - overlap;
        let count = (chars.len().saturating_sub(overlap) + stride - 1) / stride;
        (0..count)
            .map(|i| {
                let start = i * stride;
                chars[start..(start + size).min(chars.len())].iter().collect()
            })
            .collect()
    }

    #[test]
    fn boundaries_follow_the_stride_formula() {
        let text = "abcdefghij";
        let chunks = chunk(text, 4, 1).expect("valid config");
        assert_eq!(chunks, expected_windows(text, 4, 1));
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.last().map(String::as_str), Some("ghij"));
    }

    #[test]
    fn chunking_is_deterministic_and_stitches_back() {
        let texts = [
            "abcdefghij",
            "The quick brown fox jumps over the lazy dog",
            "हिन्दी पाठ के साथ मिश्रित English text",
            "x",
        ];
        for text in texts {
            for (size, overlap) in [(1, 0), (4, 1), (5, 4), (7, 3), (50, 10)] {
                let first = chunk(text, size, overlap).expect("valid config");
                let second = chunk(text, size, overlap).expect("valid config");
                assert_eq!(first, second);
                assert!(first.iter().all(|c| c.chars().count() <= size));
                assert_eq!(stitch(&first, overlap), text, "size={size} overlap={overlap}");
            }
        }
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(chunk("", 10, 2).expect("valid config").is_empty());
    }

    #[test]
    fn text_shorter_than_overlap_is_one_chunk() {
        assert_eq!(chunk("abc", 10, 5).expect("valid config"), vec!["abc"]);
    }

    #[test]
    fn invalid_configs_are_rejected() {
        for (size, overlap) in [(0, 0), (4, 4), (4, 9)] {
            let error = chunk("text", size, overlap).expect_err("invalid config");
            assert_eq!(error.kind(), ErrorKind::InvalidChunkConfig);
        }
    }

    #[test]
    fn recommendation_thresholds() {
        let cases = [
            (10 * 1024, (300, 30)),
            (50 * 1024, (600, 60)),
            (1200 * 1024, (1000, 100)),
            (2000 * 1024, (1500, 150)),
        ];
        for (bytes, (size, overlap)) in cases {
            let settings = recommend_settings(bytes);
            assert_eq!(settings.recommended_chunk_size, size);
            assert_eq!(settings.recommended_chunk_overlap, overlap);
        }
        assert_eq!(recommend_settings(1200 * 1024).total_size_kb, 1200.0);
    }

    #[test]
    fn recommendation_sums_every_upload() {
        let documents = vec![
            Document::new("a.pdf", vec![0; 30 * 1024]),
            Document::new("b.csv", vec![0; 30 * 1024]),
        ];
        let settings = recommend_for(&documents);
        assert_eq!(settings.recommended_chunk_size, 600);
        assert_eq!(settings.total_size_kb, 60.0);
    }
}
