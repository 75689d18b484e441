// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! JSON-RPC frame codec over a byte stream.
//!
//! The reader accepts two framings transparently: newline-delimited JSON
//! (the line's first non-whitespace byte is `{`) and LSP-style
//! `Content-Length: N` headers followed by a blank line and exactly N body
//! bytes. Partial input is buffered across reads; one decoded frame is
//! yielded per call. Lines that are neither framing are discarded, and a
//! frame that fails to decode is logged and dropped without tearing down
//! the stream. The writer always emits newline-delimited JSON.

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

/// Write one frame as a single JSON line.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Value,
) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    writer.write_all(&line).await
}

pub struct FrameReader<R> {
    reader: R,
    buf: Vec<u8>,
}

enum Extract {
    /// A complete frame body was pulled out of the buffer.
    Frame(Vec<u8>),
    /// More bytes are required before anything can be extracted.
    NeedMore,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
        }
    }

    /// Next decoded frame, or `None` at end of stream.
    pub async fn next_frame(&mut self) -> std::io::Result<Option<Value>> {
        loop {
            match self.try_extract() {
                Extract::Frame(raw) => match serde_json::from_slice::<Value>(&raw) {
                    Ok(v) => return Ok(Some(v)),
                    Err(e) => {
                        warn!("dropping undecodable frame: {e}");
                        continue;
                    }
                },
                Extract::NeedMore => {}
            }

            let mut chunk = [0u8; 8192];
            let n = self.reader.read(&mut chunk).await?;
            if n == 0 {
                // EOF: a trailing unterminated JSON line is still a frame.
                let rest = std::mem::take(&mut self.buf);
                let trimmed = trim_ascii(&rest);
                if trimmed.first() == Some(&b'{') {
                    match serde_json::from_slice::<Value>(trimmed) {
                        Ok(v) => return Ok(Some(v)),
                        Err(e) => warn!("dropping undecodable trailing frame: {e}"),
                    }
                }
                return Ok(None);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Pull one frame body out of the buffer, discarding junk lines along
    /// the way. Never consumes a partial frame.
    fn try_extract(&mut self) -> Extract {
        loop {
            let Some(nl) = self.buf.iter().position(|&b| b == b'\n') else {
                return Extract::NeedMore;
            };
            let line = trim_ascii(&self.buf[..nl]).to_vec();

            if line.first() == Some(&b'{') {
                self.buf.drain(..=nl);
                return Extract::Frame(line);
            }

            if let Some(len) = parse_content_length(&line) {
                match self.try_extract_body(nl + 1, len) {
                    Some((frame, consumed)) => {
                        self.buf.drain(..consumed);
                        return Extract::Frame(frame);
                    }
                    None => return Extract::NeedMore,
                }
            }

            // Neither a JSON opener nor a Content-Length header.
            if !line.is_empty() {
                warn!(
                    "discarding unframed line: {}",
                    String::from_utf8_lossy(&line)
                );
            }
            self.buf.drain(..=nl);
        }
    }

    /// After a `Content-Length` header at `headers_start`, skip any further
    /// header lines up to the blank line, then take `len` body bytes.
    /// Returns the body and the total byte count to consume, or `None` when
    /// the buffer does not yet hold the full frame.
    fn try_extract_body(&self, headers_start: usize, len: usize) -> Option<(Vec<u8>, usize)> {
        let mut pos = headers_start;
        loop {
            let rel = self.buf[pos..].iter().position(|&b| b == b'\n')?;
            let line = &self.buf[pos..pos + rel];
            pos += rel + 1;
            if trim_ascii(line).is_empty() {
                break;
            }
        }
        if self.buf.len() < pos + len {
            return None;
        }
        Some((self.buf[pos..pos + len].to_vec(), pos + len))
    }
}

fn parse_content_length(line: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(line).ok()?;
    let (name, value) = text.split_once(':')?;
    if !name.trim().eq_ignore_ascii_case("content-length") {
        return None;
    }
    value.trim().parse().ok()
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
