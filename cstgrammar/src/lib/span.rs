/// A `Span` records what portion of the user's grammar file something (a declaration, an
/// expression, an error) references. It does not hold a copy of the input.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Span {
    start: usize,
    end: usize,
}

impl Span {
    /// Create a new span starting at byte `start` and ending at byte `end`.
    ///
    /// # Panics
    ///
    /// If `end` is less than `start`.
    pub fn new(start: usize, end: usize) -> Self {
        if end < start {
            panic!("Span starts ({}) after it ends ({})!", start, end);
        }
        Span { start, end }
    }

    /// Byte offset of the start of the span.
    pub fn start(&self) -> usize {
        self.start
    }

    /// Byte offset of the end of the span.
    pub fn end(&self) -> usize {
        self.end
    }

    /// Length in bytes of the span.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Returns `true` if this `Span` covers 0 bytes, or `false` otherwise.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Caches the newline positions of an input so that UTF-8 byte offsets can be turned into
/// human-friendly `(line, column)` pairs without storing the input itself. The cache is filled
/// incrementally with [NewlineCache::feed].
pub struct NewlineCache {
    newlines: Vec<usize>,
    trailing_bytes: usize,
}

impl NewlineCache {
    pub fn new() -> Self {
        Self {
            newlines: vec![0],
            trailing_bytes: 0,
        }
    }

    /// Feed further input into the cache. The input is considered a direct continuation of any
    /// previous input fed into the cache.
    pub fn feed(&mut self, src: &str) {
        let start_pos = self.newlines.last().unwrap() + self.trailing_bytes;
        self.newlines
            .extend(src.char_indices().filter_map(|c| match c {
                (offset, '\n') => {
                    self.trailing_bytes = 0;
                    Some(start_pos + offset + 1)
                }
                (_, c) => {
                    self.trailing_bytes += c.len_utf8();
                    None
                }
            }));
    }

    fn feed_len(&self) -> usize {
        self.newlines.last().unwrap() + self.trailing_bytes
    }

    /// Convert a byte offset into a 1-based line number, or `None` if the offset exceeds the fed
    /// input length.
    pub fn byte_to_line_num(&self, byte: usize) -> Option<usize> {
        if byte > self.feed_len() {
            return None;
        }
        let (line_m1, _) = self
            .newlines
            .iter()
            .enumerate()
            .rev()
            .find(|&(_, &line_off)| line_off <= byte)
            .unwrap();
        Some(line_m1 + 1)
    }

    /// Convert a byte offset into 1-based `(line, column)`. `src` must be the same string (or
    /// concatenation of strings) previously passed to `feed`.
    pub fn byte_to_line_and_col(&self, src: &str, byte: usize) -> Option<(usize, usize)> {
        if byte > self.feed_len() || src.len() != self.feed_len() {
            return None;
        }
        self.byte_to_line_num(byte).map(|line_num| {
            let line_byte = self.newlines[line_num - 1];
            let col = src[line_byte..byte.min(src.len())].chars().count() + 1;
            (line_num, col)
        })
    }
}

impl Default for NewlineCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::{NewlineCache, Span};

    #[test]
    fn span_basics() {
        let sp = Span::new(2, 5);
        assert_eq!(sp.start(), 2);
        assert_eq!(sp.end(), 5);
        assert_eq!(sp.len(), 3);
        assert!(!sp.is_empty());
        assert!(Span::new(4, 4).is_empty());
    }

    #[test]
    #[should_panic]
    fn span_backwards() {
        Span::new(5, 2);
    }

    #[test]
    fn line_col() {
        let src = "ab\ncde\nf";
        let mut nc = NewlineCache::new();
        nc.feed(src);
        assert_eq!(nc.byte_to_line_and_col(src, 0), Some((1, 1)));
        assert_eq!(nc.byte_to_line_and_col(src, 1), Some((1, 2)));
        assert_eq!(nc.byte_to_line_and_col(src, 3), Some((2, 1)));
        assert_eq!(nc.byte_to_line_and_col(src, 5), Some((2, 3)));
        assert_eq!(nc.byte_to_line_and_col(src, 7), Some((3, 1)));
        assert_eq!(nc.byte_to_line_and_col(src, 100), None);
    }

    #[test]
    fn line_col_multibyte() {
        let src = "aé\nb";
        let mut nc = NewlineCache::new();
        nc.feed(src);
        assert_eq!(nc.byte_to_line_and_col(src, 1), Some((1, 2)));
        assert_eq!(nc.byte_to_line_and_col(src, 4), Some((2, 1)));
    }
}
