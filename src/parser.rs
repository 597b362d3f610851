//! Incremental tokenizer splitting a multipart body into parse events.
//!
//! The parser is fed arbitrarily sized chunks and never needs a boundary to
//! arrive in one piece: whatever could still be the start of a delimiter is
//! kept in the buffer until the next chunk decides it.

use crate::Error;
use bytes::{Buf, Bytes, BytesMut};

const CRLF: &[u8] = b"\r\n";
const BOUNDARY_LAST_PART_SENTINEL: &[u8] = b"--";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    PartStart,
    /// One raw header line, line ending removed.
    HeaderLine(Bytes),
    HeadersEnd,
    BodyChunk(Bytes),
    PartEnd,
    MessageEnd,
}

#[derive(Debug)]
pub enum ParseResult {
    NotReady,
    Ready(Event),
    Err(Error),
}

#[cfg(test)]
impl std::cmp::PartialEq for ParseResult {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ParseResult::NotReady, ParseResult::NotReady) => true,
            (ParseResult::Err(_), ParseResult::Err(_)) => false,
            (ParseResult::Ready(ref ev), ParseResult::Ready(ref other_ev)) => ev == other_ev,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Preamble,
    Delimiter,
    Headers,
    Body,
    Epilogue,
}

enum Step {
    Emit(Event),
    Continue,
    NeedMore,
}

#[derive(Debug)]
pub struct BoundaryParser {
    /// `--boundary`
    dash_boundary: Vec<u8>,
    /// `\r\n--boundary`, the delimiter ending a body.
    delimiter: Vec<u8>,
    buffer: BytesMut,
    state: State,
    line_start: bool,
    eof: bool,
    max_header_bytes: usize,
}

impl BoundaryParser {
    pub fn with_capacity<S: AsRef<str>>(boundary: S, capacity: usize) -> Self {
        Self::new(boundary, capacity, crate::config::DEFAULT_MAX_HEADER_BYTES)
    }

    pub(crate) fn new<S: AsRef<str>>(boundary: S, capacity: usize, max_header_bytes: usize) -> Self {
        let dash_boundary = format!("--{}", boundary.as_ref()).into_bytes();
        let mut delimiter = CRLF.to_vec();
        delimiter.extend_from_slice(&dash_boundary);

        log::debug!("Creating with boundary: {:?}", boundary.as_ref());

        Self {
            dash_boundary,
            delimiter,
            buffer: BytesMut::with_capacity(capacity),
            state: State::Preamble,
            line_start: true,
            eof: false,
            max_header_bytes,
        }
    }

    pub fn feed<T: AsRef<[u8]>>(&mut self, chunk: T) {
        // The epilogue is to be discarded.
        if self.state != State::Epilogue {
            self.buffer.extend_from_slice(chunk.as_ref());
        }
    }

    /// Marks the input as exhausted; from now on a parse that needs more
    /// bytes fails instead of returning `NotReady`.
    pub fn end_of_input(&mut self) {
        self.eof = true;
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Epilogue
    }

    pub fn parse(&mut self) -> ParseResult {
        loop {
            let step = match self.state {
                State::Preamble => self.skip_preamble(),
                State::Delimiter => self.read_delimiter_tail(),
                State::Headers => self.read_header_line(),
                State::Body => self.read_body(),
                State::Epilogue => {
                    self.buffer.clear();
                    Ok(Step::Emit(Event::MessageEnd))
                }
            };

            match step {
                Ok(Step::Emit(event)) => return ParseResult::Ready(event),
                Ok(Step::Continue) => continue,
                Ok(Step::NeedMore) if self.eof => return ParseResult::Err(self.truncated()),
                Ok(Step::NeedMore) => return ParseResult::NotReady,
                Err(e) => return ParseResult::Err(e),
            }
        }
    }

    fn skip_preamble(&mut self) -> Result<Step, Error> {
        match twoway::find_bytes(&self.buffer, &self.dash_boundary) {
            Some(i) if (i == 0 && self.line_start) || self.buffer[..i].ends_with(CRLF) => {
                self.buffer.advance(i + self.dash_boundary.len());
                self.state = State::Delimiter;
                Ok(Step::Continue)
            }

            Some(i) => {
                // Not at the start of a line, part of the preamble.
                self.buffer.advance(i + 1);
                self.line_start = false;
                Ok(Step::Continue)
            }

            None => {
                // Keep what may be a split boundary plus the CRLF in front of it.
                let keep = self.dash_boundary.len() + 1;
                if self.buffer.len() > keep {
                    let n = self.buffer.len() - keep;
                    self.buffer.advance(n);
                    self.line_start = false;
                }
                Ok(Step::NeedMore)
            }
        }
    }

    fn read_delimiter_tail(&mut self) -> Result<Step, Error> {
        // Transport padding may sit between the boundary and the line break.
        while let Some(&b) = self.buffer.first() {
            if b != b' ' && b != b'\t' {
                break;
            }
            self.buffer.advance(1);
        }

        if self.buffer.len() < 2 {
            return Ok(Step::NeedMore);
        }

        match &self.buffer[..2] {
            CRLF => {
                self.buffer.advance(2);
                self.state = State::Headers;
                Ok(Step::Emit(Event::PartStart))
            }

            BOUNDARY_LAST_PART_SENTINEL => {
                log::debug!("Found stop sentinel");
                self.buffer.clear();
                self.state = State::Epilogue;
                Ok(Step::Emit(Event::MessageEnd))
            }

            slice => Err(Error::malformed(format!(
                "Boundary must be followed by `--` or `\\r\\n`, found: {:?}",
                slice
            ))),
        }
    }

    fn read_header_line(&mut self) -> Result<Step, Error> {
        match twoway::find_bytes(&self.buffer, CRLF) {
            Some(0) => {
                self.buffer.advance(2);
                self.state = State::Body;
                Ok(Step::Emit(Event::HeadersEnd))
            }

            Some(i) => {
                let line = self.buffer.split_to(i).freeze();
                self.buffer.advance(2);
                Ok(Step::Emit(Event::HeaderLine(line)))
            }

            None if self.buffer.len() > self.max_header_bytes => {
                Err(Error::HeadersTooLarge(self.max_header_bytes))
            }

            None => Ok(Step::NeedMore),
        }
    }

    fn read_body(&mut self) -> Result<Step, Error> {
        match twoway::find_bytes(&self.buffer, &self.delimiter) {
            Some(0) => {
                self.buffer.advance(self.delimiter.len());
                self.state = State::Delimiter;
                Ok(Step::Emit(Event::PartEnd))
            }

            Some(i) => Ok(Step::Emit(Event::BodyChunk(self.buffer.split_to(i).freeze()))),

            None => {
                // Everything but a possible delimiter prefix is body.
                let keep = self.delimiter.len() - 1;
                if self.buffer.len() > keep {
                    let n = self.buffer.len() - keep;
                    Ok(Step::Emit(Event::BodyChunk(self.buffer.split_to(n).freeze())))
                } else {
                    Ok(Step::NeedMore)
                }
            }
        }
    }

    fn truncated(&self) -> Error {
        let msg = match self.state {
            State::Preamble => "boundary not found before end of body",
            State::Delimiter => "body ended inside a boundary delimiter",
            State::Headers => "body ended inside part headers",
            State::Body | State::Epilogue => "body ended before the closing boundary",
        };
        Error::malformed(msg)
    }
}
