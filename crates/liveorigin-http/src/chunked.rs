//! Chunked transfer coding.
//!
//! Encoding is a matter of framing each send block; decoding is incremental
//! because an upload body arrives in arbitrary pieces across ticks.

use liveorigin_common::{Error, Result};

/// Terminating zero-length chunk with an empty trailer.
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Longest chunk-size line we are willing to buffer (size plus extensions).
const MAX_SIZE_LINE: usize = 256;

/// Frame `data` as one chunk appended to `out`. Empty input emits nothing,
/// since an empty chunk would terminate the body.
pub fn encode_chunk(data: &[u8], out: &mut Vec<u8>) {
    if data.is_empty() {
        return;
    }
    out.extend_from_slice(format!("{:X}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    SizeLine,
    Data { remaining: u64 },
    DataEnd,
    Trailer,
    Done,
}

/// Incremental decoder for a chunked request body.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: State,
    line: Vec<u8>,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            state: State::SizeLine,
            line: Vec::new(),
        }
    }

    /// Whether the terminating chunk and trailer have been consumed.
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Decode as much of `input` as possible, appending payload to `out`.
    ///
    /// Returns the number of input bytes consumed. Bytes after the end of the
    /// body (a pipelined request) are left unconsumed.
    pub fn decode(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<usize> {
        let mut pos = 0;
        while pos < input.len() && self.state != State::Done {
            match self.state {
                State::SizeLine => {
                    if let Some(line) = self.take_line(input, &mut pos)? {
                        let size_str = line.split(';').next().unwrap_or("").trim();
                        let size = u64::from_str_radix(size_str, 16).map_err(|_| {
                            Error::protocol(format!("invalid chunk size: {size_str}"))
                        })?;
                        self.state = if size == 0 {
                            State::Trailer
                        } else {
                            State::Data { remaining: size }
                        };
                    }
                }
                State::Data { remaining } => {
                    let avail = (input.len() - pos) as u64;
                    let take = remaining.min(avail) as usize;
                    out.extend_from_slice(&input[pos..pos + take]);
                    pos += take;
                    let remaining = remaining - take as u64;
                    self.state = if remaining == 0 {
                        State::DataEnd
                    } else {
                        State::Data { remaining }
                    };
                }
                State::DataEnd => {
                    if let Some(line) = self.take_line(input, &mut pos)? {
                        if !line.is_empty() {
                            return Err(Error::protocol("missing CRLF after chunk data"));
                        }
                        self.state = State::SizeLine;
                    }
                }
                State::Trailer => {
                    if let Some(line) = self.take_line(input, &mut pos)? {
                        if line.is_empty() {
                            self.state = State::Done;
                        }
                    }
                }
                State::Done => {}
            }
        }
        Ok(pos)
    }

    /// Accumulate bytes up to a CRLF. Returns the line without its
    /// terminator once complete.
    fn take_line(&mut self, input: &[u8], pos: &mut usize) -> Result<Option<String>> {
        while *pos < input.len() {
            let b = input[*pos];
            *pos += 1;
            if b == b'\n' {
                if self.line.last() == Some(&b'\r') {
                    self.line.pop();
                }
                let line = String::from_utf8(std::mem::take(&mut self.line))
                    .map_err(|_| Error::protocol("non-UTF-8 chunk framing"))?;
                return Ok(Some(line));
            }
            self.line.push(b);
            if self.line.len() > MAX_SIZE_LINE {
                return Err(Error::protocol("chunk framing line too long"));
            }
        }
        Ok(None)
    }
}
