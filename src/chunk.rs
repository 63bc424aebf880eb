//! Object-level and link-level chunking of firmware buffers.

/// Next chunk of `buf` starting at `offset`, at most `max` bytes long.
///
/// Returns an empty slice once `offset` reaches the end of the buffer.
pub fn next_chunk(buf: &[u8], offset: usize, max: usize) -> &[u8] {
    let start = offset.min(buf.len());
    let end = start + (buf.len() - start).min(max);
    &buf[start..end]
}

/// A chunk equal to the maximum size is "full"; only the last one may be short.
pub fn is_full(chunk: &[u8], max: usize) -> bool {
    chunk.len() == max
}

/// A slice of a buffer together with the offset it starts at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    pub offset: usize,
    pub data: &'a [u8],
}

impl Chunk<'_> {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn end(&self) -> usize {
        self.offset + self.data.len()
    }
}

/// Iterator over consecutive chunks of a buffer.
pub struct Chunks<'a> {
    buf: &'a [u8],
    offset: usize,
    max: usize,
}

/// Split `buf` into chunks of at most `max` bytes. `max` must be non-zero.
pub fn chunks(buf: &[u8], max: usize) -> Chunks<'_> {
    assert!(max > 0, "chunk size must be non-zero");
    Chunks { buf, offset: 0, max }
}

impl<'a> Iterator for Chunks<'a> {
    type Item = Chunk<'a>;

    fn next(&mut self) -> Option<Chunk<'a>> {
        let data = next_chunk(self.buf, self.offset, self.max);
        if data.is_empty() {
            return None;
        }
        let chunk = Chunk {
            offset: self.offset,
            data,
        };
        self.offset += data.len();
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = count(self.buf.len() - self.offset, self.max);
        (n, Some(n))
    }
}

impl ExactSizeIterator for Chunks<'_> {}

/// Number of chunks `len` bytes split into.
pub fn count(len: usize, max: usize) -> usize {
    len.div_ceil(max)
}
