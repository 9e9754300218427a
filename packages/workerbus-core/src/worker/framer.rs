//! Line framer for the worker's stdout.
//!
//! Pipe reads arrive in arbitrary chunk sizes that do not line up with
//! message boundaries. The framer keeps the unterminated tail between reads
//! and only releases a frame once its newline has been seen.

/// Reassembles newline-terminated frames from a byte stream.
#[derive(Debug, Default)]
pub struct LineFramer {
    partial: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return every frame it completed, in arrival order.
    ///
    /// Empty and whitespace-only lines are discarded. Invalid UTF-8 is
    /// replaced with U+FFFD rather than failing the whole stream.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut frames = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            self.partial.extend_from_slice(&rest[..pos]);
            rest = &rest[pos + 1..];

            let line = std::mem::take(&mut self.partial);
            if let Some(frame) = Self::to_frame(&line) {
                frames.push(frame);
            }
        }

        self.partial.extend_from_slice(rest);
        frames
    }

    /// Flush the unterminated tail at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        let line = std::mem::take(&mut self.partial);
        Self::to_frame(&line)
    }

    /// Bytes currently held back waiting for a newline.
    pub fn buffered(&self) -> usize {
        self.partial.len()
    }

    fn to_frame(line: &[u8]) -> Option<String> {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let text = String::from_utf8_lossy(line);
        if text.trim().is_empty() {
            None
        } else {
            Some(text.into_owned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_complete_line() {
        let mut framer = LineFramer::new();
        assert_eq!(framer.push(b"{\"id\":1}\n"), vec!["{\"id\":1}"]);
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn test_line_split_across_chunks() {
        let mut framer = LineFramer::new();
        assert!(framer.push(b"{\"id\":").is_empty());
        assert!(framer.push(b"1,\"status\"").is_empty());
        assert_eq!(
            framer.push(b":\"SUCCESS\"}\n{\"id\":2"),
            vec!["{\"id\":1,\"status\":\"SUCCESS\"}"]
        );
        assert_eq!(framer.buffered(), "{\"id\":2".len());
        assert_eq!(framer.push(b"}\n"), vec!["{\"id\":2}"]);
    }

    #[test]
    fn test_multiple_lines_in_one_chunk_keep_order() {
        let mut framer = LineFramer::new();
        let frames = framer.push(b"a\nb\nc\n");
        assert_eq!(frames, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_blank_lines_are_dropped() {
        let mut framer = LineFramer::new();
        let frames = framer.push(b"\n   \n\t\r\nx\n\n");
        assert_eq!(frames, vec!["x"]);
    }

    #[test]
    fn test_crlf_is_stripped() {
        let mut framer = LineFramer::new();
        assert_eq!(framer.push(b"hello\r\nworld\r\n"), vec!["hello", "world"]);
    }

    #[test]
    fn test_crlf_split_between_chunks() {
        let mut framer = LineFramer::new();
        assert!(framer.push(b"hello\r").is_empty());
        assert_eq!(framer.push(b"\n"), vec!["hello"]);
    }

    #[test]
    fn test_invalid_utf8_is_lossy() {
        let mut framer = LineFramer::new();
        let frames = framer.push(b"ok\xff\n");
        assert_eq!(frames, vec!["ok\u{fffd}"]);
    }

    #[test]
    fn test_finish_returns_tail() {
        let mut framer = LineFramer::new();
        assert!(framer.push(b"tail").is_empty());
        assert_eq!(framer.finish(), Some("tail".to_string()));
        assert_eq!(framer.finish(), None);
    }
}
