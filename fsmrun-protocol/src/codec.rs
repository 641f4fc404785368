//! Newline-delimited line framing.
//!
//! Each protocol message occupies exactly one `\n`-terminated line of UTF-8.
//! A trailing `\r` is tolerated and stripped; blank lines are skipped.

use crate::error::ProtocolError;
use crate::MAX_LINE_LENGTH;
use bytes::{Buf, Bytes, BytesMut};

/// Appends the line terminator to a serialized document.
pub fn encode_line(xml: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(xml.len() + 1);
    buf.extend_from_slice(xml.as_bytes());
    buf.extend_from_slice(b"\n");
    buf.freeze()
}

/// Incremental line decoder.
///
/// Feed it raw socket bytes with [`extend`](Self::extend) and pull complete
/// lines with [`decode_line`](Self::decode_line). A line exceeding the
/// configured maximum is reported once as [`ProtocolError::LineTooLong`]; the
/// rest of it is skipped up to the next newline.
pub struct LineDecoder {
    buffer: BytesMut,
    max_line_length: usize,
    discarding: bool,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::with_max_line_length(MAX_LINE_LENGTH)
    }

    pub fn with_max_line_length(max_line_length: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            max_line_length,
            discarding: false,
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next complete line.
    pub fn decode_line(&mut self) -> Result<Option<String>, ProtocolError> {
        loop {
            let newline = self.buffer.iter().position(|&b| b == b'\n');

            if self.discarding {
                match newline {
                    Some(pos) => {
                        self.buffer.advance(pos + 1);
                        self.discarding = false;
                        continue;
                    }
                    None => {
                        self.buffer.clear();
                        return Ok(None);
                    }
                }
            }

            let Some(pos) = newline else {
                if self.buffer.len() > self.max_line_length {
                    let len = self.buffer.len();
                    self.buffer.clear();
                    self.discarding = true;
                    return Err(ProtocolError::LineTooLong {
                        len,
                        max: self.max_line_length,
                    });
                }
                return Ok(None);
            };

            let mut line = self.buffer.split_to(pos + 1);
            line.truncate(pos);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }

            if line.len() > self.max_line_length {
                return Err(ProtocolError::LineTooLong {
                    len: line.len(),
                    max: self.max_line_length,
                });
            }

            let text = std::str::from_utf8(&line).map_err(|_| ProtocolError::InvalidUtf8)?;
            if text.trim().is_empty() {
                continue;
            }
            return Ok(Some(text.to_string()));
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.discarding = false;
    }
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Command;
    use proptest::prelude::*;

    #[test]
    fn test_encode_line() {
        let line = encode_line(&Command::Status.to_xml());
        assert_eq!(&line[..], b"<command type=\"status\"/>\n");
    }

    #[test]
    fn test_partial_line_decoding() {
        let mut decoder = LineDecoder::new();

        decoder.extend(b"<command type=\"sta");
        assert!(decoder.decode_line().unwrap().is_none());

        decoder.extend(b"tus\"></command>\n");
        let line = decoder.decode_line().unwrap().unwrap();
        assert_eq!(Command::parse(&line).unwrap(), Command::Status);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_multiple_lines_and_crlf() {
        let mut decoder = LineDecoder::new();
        decoder.extend(b"one\r\n\n  \ntwo\nthree");

        assert_eq!(decoder.decode_line().unwrap().as_deref(), Some("one"));
        assert_eq!(decoder.decode_line().unwrap().as_deref(), Some("two"));
        assert!(decoder.decode_line().unwrap().is_none());
        assert_eq!(decoder.buffered(), 5);
    }

    #[test]
    fn test_invalid_utf8() {
        let mut decoder = LineDecoder::new();
        decoder.extend(&[0xff, 0xfe, b'\n', b'o', b'k', b'\n']);

        assert!(matches!(
            decoder.decode_line(),
            Err(ProtocolError::InvalidUtf8)
        ));
        assert_eq!(decoder.decode_line().unwrap().as_deref(), Some("ok"));
    }

    #[test]
    fn test_line_too_long_is_skipped() {
        let mut decoder = LineDecoder::with_max_line_length(8);

        decoder.extend(b"0123456789abc");
        let err = decoder.decode_line().unwrap_err();
        assert!(matches!(err, ProtocolError::LineTooLong { max: 8, .. }));

        // Remainder of the oversized line is dropped
        decoder.extend(b"def\nshort\n");
        assert_eq!(decoder.decode_line().unwrap().as_deref(), Some("short"));
    }

    #[test]
    fn test_complete_line_too_long() {
        let mut decoder = LineDecoder::with_max_line_length(4);
        decoder.extend(b"123456\nok\n");

        assert!(decoder.decode_line().is_err());
        assert_eq!(decoder.decode_line().unwrap().as_deref(), Some("ok"));
    }

    #[test]
    fn test_decoder_clear() {
        let mut decoder = LineDecoder::default();
        decoder.extend(b"some data");
        assert_eq!(decoder.buffered(), 9);

        decoder.clear();
        assert_eq!(decoder.buffered(), 0);
    }

    proptest! {
        #[test]
        fn prop_chunking_does_not_change_lines(
            lines in proptest::collection::vec("[a-z<>=\" /]{1,40}", 1..8),
            chunk in 1usize..16,
        ) {
            let mut data = Vec::new();
            for line in &lines {
                data.extend_from_slice(&encode_line(line));
            }

            let mut decoder = LineDecoder::new();
            let mut decoded = Vec::new();
            for piece in data.chunks(chunk) {
                decoder.extend(piece);
                while let Some(line) = decoder.decode_line().unwrap() {
                    decoded.push(line);
                }
            }

            let expected: Vec<String> = lines
                .iter()
                .filter(|l| !l.trim().is_empty())
                .cloned()
                .collect();
            prop_assert_eq!(decoded, expected);
        }
    }
}
