//! Line framing for the worker's stdout
//!
//! Bytes arrive in arbitrary chunks: a chunk may hold zero, one or many
//! messages and may cut a message (or a multi-byte UTF-8 sequence) in
//! half. The framer buffers raw bytes and only hands out complete lines,
//! so decoding never sees a partial character.

use super::protocol::{decode_line, MalformedMessage, Message};

/// Lines longer than this are dropped instead of buffered without bound
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Splits a byte stream into `\n`/`\r\n` terminated lines
#[derive(Debug)]
pub struct LineFramer {
    buffer: Vec<u8>,
    /// Set while skipping the remainder of an oversized line
    discarding: bool,
    max_line: usize,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

/// One unit produced by the framer
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    Line(Vec<u8>),
    /// A line exceeded the size limit; its bytes were dropped
    Oversized,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buffer: Vec::new(),
            discarding: false,
            max_line,
        }
    }

    /// Bytes held back waiting for a terminator
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Append a chunk and return every line it completed
    ///
    /// Blank lines are skipped. The trailing fragment stays buffered.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            rest = &tail[1..];

            if self.discarding {
                self.discarding = false;
                continue;
            }

            self.buffer.extend_from_slice(head);
            let line = std::mem::take(&mut self.buffer);
            if let Some(frame) = self.finish_line(line) {
                frames.push(frame);
            }
        }

        if self.discarding {
            return frames;
        }
        self.buffer.extend_from_slice(rest);
        if self.buffer.len() > self.max_line {
            self.buffer = Vec::new();
            self.discarding = true;
            frames.push(Frame::Oversized);
        }
        frames
    }

    /// Take whatever is left once the stream has ended
    pub fn finish(&mut self) -> Option<Frame> {
        self.discarding = false;
        let line = std::mem::take(&mut self.buffer);
        self.finish_line(line)
    }

    /// Drop any buffered fragment
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.discarding = false;
    }

    fn finish_line(&self, mut line: Vec<u8>) -> Option<Frame> {
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if line.len() > self.max_line {
            return Some(Frame::Oversized);
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        Some(Frame::Line(line))
    }
}

/// Framer plus decoder: bytes in, classified messages out
#[derive(Debug, Default)]
pub struct MessageDecoder {
    framer: LineFramer,
}

impl MessageDecoder {
    pub fn new() -> Self {
        Self {
            framer: LineFramer::new(),
        }
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            framer: LineFramer::with_max_line(max_line),
        }
    }

    /// Feed a chunk; each complete line yields a message or a diagnostic
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Result<Message, MalformedMessage>> {
        let limit = self.framer.max_line;
        self.framer
            .push(chunk)
            .into_iter()
            .map(|frame| decode_frame(frame, limit))
            .collect()
    }

    /// Decode the unterminated tail left at end of stream, if any
    pub fn finish(&mut self) -> Option<Result<Message, MalformedMessage>> {
        let limit = self.framer.max_line;
        self.framer.finish().map(|frame| decode_frame(frame, limit))
    }

    pub fn buffered(&self) -> usize {
        self.framer.buffered()
    }
}

fn decode_frame(frame: Frame, limit: usize) -> Result<Message, MalformedMessage> {
    match frame {
        Frame::Line(line) => decode_line(&line),
        Frame::Oversized => Err(MalformedMessage::Oversized { limit }),
    }
}
