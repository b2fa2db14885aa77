// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Reassembly of raw transport chunks into records.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::LinkError;

/// Default ceiling for a single record / the pending accumulator.
pub const DEFAULT_MAX_FRAME: usize = 64 * 1024;

/// Size of the little-endian length prefix in binary mode.
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// How records are delimited in the byte stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelimiterMode {
    /// Newline terminated text lines (`\r\n` accepted).
    #[default]
    Text,
    /// `u16` little-endian length prefix followed by the payload.
    Binary,
}

/// One complete logical unit of device data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    bytes: Vec<u8>,
}

impl Record {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The record as UTF-8 text, if it is valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }

    /// Printable form: the text itself, or hex for binary payloads.
    pub fn display_text(&self) -> String {
        match self.as_text() {
            Some(text) => text.to_string(),
            None => hex::encode(&self.bytes),
        }
    }
}

/// Output of [`FrameReassembler::push`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reassembled {
    Record(Record),
    /// The accumulator went over the ceiling and `discarded` bytes were dropped.
    TooLarge { discarded: usize },
}

/// Stitches partial chunks into complete records.
pub struct FrameReassembler {
    mode: DelimiterMode,
    max_frame: usize,
    buffer: Vec<u8>,
    /// Dropping the tail of an oversized line until the next newline.
    skipping: bool,
}

impl FrameReassembler {
    /// Create a new reassembler with the default ceiling.
    pub fn new(mode: DelimiterMode) -> Self {
        Self::with_limit(mode, DEFAULT_MAX_FRAME)
    }

    pub fn with_limit(mode: DelimiterMode, max_frame: usize) -> Self {
        Self {
            mode,
            max_frame,
            buffer: Vec::with_capacity(1024),
            skipping: false,
        }
    }

    pub fn mode(&self) -> DelimiterMode {
        self.mode
    }

    pub fn max_frame(&self) -> usize {
        self.max_frame
    }

    /// Feed one chunk. Returns every record completed by it, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Reassembled> {
        match self.mode {
            DelimiterMode::Text => self.push_text(chunk),
            DelimiterMode::Binary => self.push_binary(chunk),
        }
    }

    fn push_text(&mut self, chunk: &[u8]) -> Vec<Reassembled> {
        let mut out = Vec::new();
        let mut chunk = chunk;

        if self.skipping {
            match chunk.iter().position(|b| *b == b'\n') {
                Some(pos) => {
                    debug!("Resynchronised after oversized line");
                    self.skipping = false;
                    chunk = &chunk[pos + 1..];
                }
                None => return out,
            }
        }

        // The retained remainder never contains a newline, so only the new bytes are scanned.
        let mut search_from = self.buffer.len();
        self.buffer.extend_from_slice(chunk);

        let max_frame = self.max_frame;
        let mut line_start = 0;
        while let Some(pos) = self.buffer[search_from..].iter().position(|b| *b == b'\n') {
            let end = search_from + pos;
            let mut line = &self.buffer[line_start..end];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }

            if line.len() > max_frame {
                warn!("Line of {} bytes exceeds limit of {}", line.len(), max_frame);
                out.push(Reassembled::TooLarge {
                    discarded: line.len(),
                });
            } else {
                out.push(Reassembled::Record(Record::new(line)));
            }

            line_start = end + 1;
            search_from = line_start;
        }

        self.buffer.drain(..line_start);

        // A trailing '\r' may be the first half of a CRLF and is not part of the line.
        let pending_line = match self.buffer.last() {
            Some(b'\r') => self.buffer.len() - 1,
            _ => self.buffer.len(),
        };
        if pending_line > max_frame {
            warn!(
                "Accumulator overflow: {} bytes without delimiter (limit {})",
                self.buffer.len(),
                max_frame
            );
            out.push(Reassembled::TooLarge {
                discarded: self.buffer.len(),
            });
            self.buffer.clear();
            self.skipping = true;
        }

        out
    }

    fn push_binary(&mut self, chunk: &[u8]) -> Vec<Reassembled> {
        let mut out = Vec::new();
        self.buffer.extend_from_slice(chunk);

        let mut offset = 0;
        while self.buffer.len() - offset >= LENGTH_PREFIX_SIZE {
            let len = u16::from_le_bytes([self.buffer[offset], self.buffer[offset + 1]]) as usize;

            if len > self.max_frame {
                // No way to find the next frame boundary; drop everything.
                let discarded = self.buffer.len() - offset;
                warn!(
                    "Frame header announces {} bytes (limit {}), dropping {} buffered bytes",
                    len, self.max_frame, discarded
                );
                out.push(Reassembled::TooLarge { discarded });
                self.buffer.clear();
                return out;
            }

            let frame_end = offset + LENGTH_PREFIX_SIZE + len;
            if self.buffer.len() < frame_end {
                break;
            }

            out.push(Reassembled::Record(Record::new(
                &self.buffer[offset + LENGTH_PREFIX_SIZE..frame_end],
            )));
            offset = frame_end;
        }

        self.buffer.drain(..offset);
        out
    }

    /// Reset the reassembler state.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.skipping = false;
    }

    /// Get current buffer size.
    pub fn buffer_size(&self) -> usize {
        self.buffer.len()
    }
}

/// Wrap a payload in the binary frame format.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, LinkError> {
    let len = u16::try_from(payload.len()).map_err(|_| {
        LinkError::Write(format!(
            "payload of {} bytes does not fit a binary frame",
            payload.len()
        ))
    })?;

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(out: Vec<Reassembled>) -> Vec<Vec<u8>> {
        out.into_iter()
            .filter_map(|r| match r {
                Reassembled::Record(rec) => Some(rec.into_bytes()),
                Reassembled::TooLarge { .. } => None,
            })
            .collect()
    }

    #[test]
    fn test_single_line() {
        let mut r = FrameReassembler::new(DelimiterMode::Text);
        let out = r.push(b"temp=21.5\n");
        assert_eq!(records(out), vec![b"temp=21.5".to_vec()]);
        assert_eq!(r.buffer_size(), 0);
    }

    #[test]
    fn test_delimiter_split_across_chunks() {
        let mut r = FrameReassembler::new(DelimiterMode::Text);
        assert!(r.push(b"temp=21.5,hum=4").is_empty());
        assert!(r.push(b"0.2\r").is_empty());
        let out = r.push(b"\n");
        assert_eq!(records(out), vec![b"temp=21.5,hum=40.2".to_vec()]);
    }

    #[test]
    fn test_many_lines_in_one_chunk() {
        let mut r = FrameReassembler::new(DelimiterMode::Text);
        let out = r.push(b"a=1\nb=2\r\nc=");
        assert_eq!(records(out), vec![b"a=1".to_vec(), b"b=2".to_vec()]);
        assert_eq!(r.buffer_size(), 2);
        let out = r.push(b"3\n");
        assert_eq!(records(out), vec![b"c=3".to_vec()]);
    }

    #[test]
    fn test_any_chunking_yields_same_records() {
        let stream = b"temp=20.1,hum=30\nhello world\n1,2,3\n{\"t\":22}\n";
        let expected = vec![
            b"temp=20.1,hum=30".to_vec(),
            b"hello world".to_vec(),
            b"1,2,3".to_vec(),
            b"{\"t\":22}".to_vec(),
        ];

        for size in 1..=stream.len() {
            let mut r = FrameReassembler::new(DelimiterMode::Text);
            let mut got = Vec::new();
            for chunk in stream.chunks(size) {
                got.extend(records(r.push(chunk)));
            }
            assert_eq!(got, expected, "chunk size {}", size);
            assert_eq!(r.buffer_size(), 0);
        }
    }

    #[test]
    fn test_oversized_line_raises_one_warning() {
        let mut r = FrameReassembler::with_limit(DelimiterMode::Text, 16);
        let mut out = Vec::new();
        // 40 bytes without newline, delivered in pieces, then a valid line.
        for _ in 0..4 {
            out.extend(r.push(b"xxxxxxxxxx"));
        }
        out.extend(r.push(b"xxxx\nok=1\n"));

        let too_large = out
            .iter()
            .filter(|r| matches!(r, Reassembled::TooLarge { .. }))
            .count();
        assert_eq!(too_large, 1);
        assert_eq!(records(out), vec![b"ok=1".to_vec()]);
    }

    #[test]
    fn test_oversized_complete_line() {
        let mut r = FrameReassembler::with_limit(DelimiterMode::Text, 4);
        let out = r.push(b"toolong\nok\n");
        assert_eq!(out[0], Reassembled::TooLarge { discarded: 7 });
        assert_eq!(out[1], Reassembled::Record(Record::new(b"ok".to_vec())));
    }

    #[test]
    fn test_crlf_line_at_limit_split() {
        let mut whole = FrameReassembler::with_limit(DelimiterMode::Text, 4);
        let expected = whole.push(b"abcd\r\n");
        assert_eq!(expected, vec![Reassembled::Record(Record::new(b"abcd".to_vec()))]);

        let mut split = FrameReassembler::with_limit(DelimiterMode::Text, 4);
        assert!(split.push(b"abcd\r").is_empty());
        assert_eq!(split.push(b"\n"), expected);

        // A '\r' that turns out not to end the line still counts.
        let mut r = FrameReassembler::with_limit(DelimiterMode::Text, 4);
        assert!(r.push(b"abcd\r").is_empty());
        assert_eq!(r.push(b"e"), vec![Reassembled::TooLarge { discarded: 6 }]);
    }

    #[test]
    fn test_binary_frames() {
        let mut r = FrameReassembler::new(DelimiterMode::Binary);
        let mut stream = encode_frame(b"hello").unwrap();
        stream.extend(encode_frame(b"world!").unwrap());

        let mut got = Vec::new();
        for byte in &stream {
            got.extend(records(r.push(std::slice::from_ref(byte))));
        }
        assert_eq!(got, vec![b"hello".to_vec(), b"world!".to_vec()]);
        assert_eq!(r.buffer_size(), 0);
    }

    #[test]
    fn test_binary_oversized_header() {
        let mut r = FrameReassembler::with_limit(DelimiterMode::Binary, 8);
        let out = r.push(&[0x20, 0x00, 1, 2, 3]);
        assert_eq!(out, vec![Reassembled::TooLarge { discarded: 5 }]);
        assert_eq!(r.buffer_size(), 0);

        let out = r.push(&encode_frame(b"ok").unwrap());
        assert_eq!(records(out), vec![b"ok".to_vec()]);
    }

    #[test]
    fn test_reset_discards_partial() {
        let mut r = FrameReassembler::new(DelimiterMode::Text);
        r.push(b"stale=1");
        r.reset();
        let out = r.push(b"fresh=2\n");
        assert_eq!(records(out), vec![b"fresh=2".to_vec()]);
    }

    #[test]
    fn test_encode_frame_limit() {
        let frame = encode_frame(b"abc").unwrap();
        assert_eq!(frame, vec![0x03, 0x00, b'a', b'b', b'c']);
        assert!(encode_frame(&vec![0u8; 70_000]).is_err());
    }

    #[test]
    fn test_record_display() {
        assert_eq!(Record::new(b"hi".to_vec()).display_text(), "hi");
        assert_eq!(Record::new(vec![0xff, 0x01]).display_text(), "ff01");
    }
}
