//! Candidate cut points, as character offsets, in decreasing preference:
//! paragraph breaks, sentence boundaries (UAX #29), word boundaries and
//! finally grapheme cluster boundaries.

use unicode_segmentation::UnicodeSegmentation;

pub(crate) struct Boundaries {
    paragraphs: Vec<usize>,
    sentences: Vec<usize>,
    words: Vec<usize>,
    graphemes: Vec<usize>,
}

impl Boundaries {
    pub(crate) fn scan(text: &str) -> Self {
        let char_starts: Vec<usize> = text.char_indices().map(|(b, _)| b).collect();
        let to_char = |byte: usize| char_starts.partition_point(|&b| b < byte);

        let mut paragraphs = Vec::new();
        let mut prev_newline = false;
        for (i, c) in text.chars().enumerate() {
            if c == '\n' && prev_newline {
                paragraphs.push(i + 1);
            }
            if c == '\n' {
                prev_newline = true;
            } else if !c.is_whitespace() {
                prev_newline = false;
            }
        }

        let sentences = text
            .split_sentence_bound_indices()
            .map(|(b, _)| to_char(b))
            .filter(|&c| c > 0)
            .collect();

        let words = text
            .split_word_bound_indices()
            .map(|(b, _)| to_char(b))
            .filter(|&c| c > 0)
            .collect();

        let graphemes = text
            .grapheme_indices(true)
            .map(|(b, _)| to_char(b))
            .filter(|&c| c > 0)
            .collect();

        Self {
            paragraphs,
            sentences,
            words,
            graphemes,
        }
    }

    /// Best cut in `lo..=hi`, or `hi` when not even a grapheme boundary
    /// falls in the range.
    pub(crate) fn best_cut(&self, lo: usize, hi: usize) -> usize {
        [&self.paragraphs, &self.sentences, &self.words, &self.graphemes]
            .into_iter()
            .find_map(|cuts| last_within(cuts, lo, hi))
            .unwrap_or(hi)
    }

    /// First word boundary in `lo..hi`.
    pub(crate) fn first_word_start(&self, lo: usize, hi: usize) -> Option<usize> {
        let idx = self.words.partition_point(|&w| w < lo);
        self.words.get(idx).copied().filter(|&w| w < hi)
    }

    /// First grapheme cluster start in `lo..hi`.
    pub(crate) fn first_grapheme_start(&self, lo: usize, hi: usize) -> Option<usize> {
        let idx = self.graphemes.partition_point(|&g| g < lo);
        self.graphemes.get(idx).copied().filter(|&g| g < hi)
    }
}

fn last_within(sorted: &[usize], lo: usize, hi: usize) -> Option<usize> {
    let idx = sorted.partition_point(|&b| b <= hi);
    idx.checked_sub(1)
        .map(|i| sorted[i])
        .filter(|&b| b >= lo)
}
