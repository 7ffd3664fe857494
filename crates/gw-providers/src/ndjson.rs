//! Chunk-to-line framer for the CLA's NDJSON stdout stream.
//!
//! Mirrors the shape of an SSE buffer drain (append, split, keep the
//! trailing partial), but the delimiter is a bare `\n` rather than `\n\n`
//! and a stray `\r` is stripped from each complete line.

pub struct NdjsonLineBuffer {
    tail: String,
}

impl NdjsonLineBuffer {
    pub fn new() -> Self {
        Self { tail: String::new() }
    }

    /// Appends `chunk`, returning every complete, non-blank line it
    /// produced (in order). The trailing partial fragment is kept for the
    /// next call.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.tail.push_str(chunk);
        let mut lines = Vec::new();

        while let Some(pos) = self.tail.find('\n') {
            let line: String = self.tail.drain(..=pos).collect();
            let trimmed = line.strip_suffix('\n').unwrap_or(&line);
            let trimmed = trimmed.strip_suffix('\r').unwrap_or(trimmed);
            if !trimmed.trim().is_empty() {
                lines.push(trimmed.to_string());
            }
        }

        lines
    }

    /// Returns the trimmed tail if non-empty, clearing it either way.
    pub fn flush(&mut self) -> Option<String> {
        let tail = std::mem::take(&mut self.tail);
        let trimmed = tail.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }
}

impl Default for NdjsonLineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_complete_lines_and_keeps_partial_tail() {
        let mut buf = NdjsonLineBuffer::new();
        let lines = buf.push("{\"a\":1}\n{\"b\":2}\n{\"c\":3");
        assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}"]);
        assert_eq!(buf.flush(), Some("{\"c\":3".to_string()));
    }

    #[test]
    fn tolerates_crlf() {
        let mut buf = NdjsonLineBuffer::new();
        let lines = buf.push("{\"a\":1}\r\n{\"b\":2}\r\n");
        assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn drops_whitespace_only_lines() {
        let mut buf = NdjsonLineBuffer::new();
        let lines = buf.push("  \n\t\n{\"a\":1}\n");
        assert_eq!(lines, vec!["{\"a\":1}"]);
    }

    #[test]
    fn chunk_boundary_splits_a_single_line() {
        let mut buf = NdjsonLineBuffer::new();
        assert!(buf.push("{\"par").is_empty());
        let lines = buf.push("tial\":true}\n");
        assert_eq!(lines, vec!["{\"partial\":true}"]);
    }

    #[test]
    fn flush_on_empty_buffer_returns_none() {
        let mut buf = NdjsonLineBuffer::new();
        assert_eq!(buf.flush(), None);
    }
}
