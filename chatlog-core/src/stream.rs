//! Input loader for conversation exports.
//!
//! `conversations.json` is one large JSON array. [`ExportStream`] yields its
//! elements one at a time, so a record is decoded into a `serde_json::Value`
//! without first materializing the whole document as a tree. Newline-delimited
//! exports (one conversation per line) are detected by their first byte and
//! read the same way.
//!
//! Only JSON syntax is checked here. Whether a record looks like a
//! conversation is the pipeline's concern.

use serde_json::{self as sj, Value};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;

use crate::error::{ChatlogError, Result};

/// Conversation records from an export file.
pub enum ExportStream<R: Read = File> {
    /// `[{...}, {...}]`
    Array(JsonArrayStream<R>),
    /// One record per line.
    Ndjson {
        reader: BufReader<R>,
        line: usize,
        failed: bool,
    },
}

/// Walks the top-level array by hand and hands each element to serde.
///
/// `serde_json::StreamDeserializer` would treat the array as a single value,
/// so the brackets and commas between elements are consumed here instead.
pub struct JsonArrayStream<R: Read> {
    reader: BufReader<R>,
    started: bool,
    finished: bool,
    index: usize,
}

impl<R: Read> JsonArrayStream<R> {
    fn new(reader: BufReader<R>) -> Self {
        Self {
            reader,
            started: false,
            finished: false,
            index: 0,
        }
    }

    /// Next element, or `None` after `]`. The stream is fused: once an error
    /// has been returned, every later call yields `None`.
    fn next_element(&mut self) -> Result<Option<Value>> {
        if self.finished {
            return Ok(None);
        }
        let element = self.advance();
        if !matches!(element, Ok(Some(_))) {
            self.finished = true;
        }
        element
    }

    fn advance(&mut self) -> Result<Option<Value>> {
        if !self.started {
            self.skip_whitespace()?;
            if self.peek_byte()? != Some(b'[') {
                return Err(self.syntax("expected '[' at start of export"));
            }
            self.reader.consume(1);
            self.started = true;
            self.skip_whitespace()?;
            if self.peek_byte()? == Some(b']') {
                return Ok(None);
            }
        } else {
            self.skip_whitespace()?;
            match self.peek_byte()? {
                Some(b']') => return Ok(None),
                Some(b',') => {
                    self.reader.consume(1);
                    self.skip_whitespace()?;
                }
                None => return Err(self.syntax("unexpected end of file (missing ']')")),
                Some(other) => {
                    return Err(self.syntax(format!(
                        "unexpected character '{}' (expected ',' or ']')",
                        char::from(other)
                    )))
                }
            }
        }

        let bytes = self.element_bytes()?;
        let context = format!("conversation #{}", self.index + 1);
        let value: Value = sj::from_slice(&bytes).map_err(|e| ChatlogError::json(context, e))?;
        self.index += 1;
        Ok(Some(value))
    }

    /// Bytes of one element, up to (not including) the `,` or `]` that ends it.
    ///
    /// Scanning bytes instead of handing the reader to a deserializer keeps
    /// the delimiter in the buffer even after a bare number or literal.
    fn element_bytes(&mut self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;

        let index = self.index;

        loop {
            let buf = match self.reader.fill_buf() {
                Ok([]) => {
                    return Err(syntax_error(index, "unexpected end of file inside element"))
                }
                Ok(buf) => buf,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };

            let mut end = None;
            for (pos, &byte) in buf.iter().enumerate() {
                if in_string {
                    match (escaped, byte) {
                        (true, _) => escaped = false,
                        (false, b'\\') => escaped = true,
                        (false, b'"') => in_string = false,
                        _ => {}
                    }
                    continue;
                }
                match byte {
                    b'"' => in_string = true,
                    b'{' | b'[' => depth += 1,
                    b'}' | b']' if depth > 0 => depth -= 1,
                    b',' | b']' if depth == 0 => {
                        end = Some(pos);
                        break;
                    }
                    _ => {}
                }
            }

            let take = end.unwrap_or(buf.len());
            bytes.extend_from_slice(&buf[..take]);
            self.reader.consume(take);
            if end.is_some() {
                return Ok(bytes);
            }
        }
    }

    fn syntax(&self, reason: impl Into<String>) -> ChatlogError {
        syntax_error(self.index, reason)
    }

    fn skip_whitespace(&mut self) -> Result<()> {
        loop {
            match self.reader.fill_buf() {
                Ok([]) => break,
                Ok(available) => {
                    if available[0].is_ascii_whitespace() {
                        self.reader.consume(1);
                    } else {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn peek_byte(&mut self) -> Result<Option<u8>> {
        loop {
            match self.reader.fill_buf() {
                Ok([]) => return Ok(None),
                Ok(buf) => return Ok(Some(buf[0])),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn syntax_error(index: usize, reason: impl Into<String>) -> ChatlogError {
    ChatlogError::invalid_input(format!("<array element {}>", index + 1), reason)
}

impl ExportStream<File> {
    /// Opens an export and detects its format from the first non-whitespace byte.
    #[must_use = "this returns a Result that should be handled"]
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            ChatlogError::invalid_input(path, format!("cannot open: {e}"))
        })?;
        Self::from_reader(file).map_err(|err| match err {
            ChatlogError::EmptyFile { .. } => ChatlogError::empty_file(path),
            other => other,
        })
    }
}

impl<R: Read> ExportStream<R> {
    pub fn from_reader(reader: R) -> Result<Self> {
        let mut reader = BufReader::new(reader);
        let first = loop {
            match reader.fill_buf() {
                Ok([]) => return Err(ChatlogError::empty_file("<input>")),
                Ok(buf) => match buf.iter().position(|b| !b.is_ascii_whitespace()) {
                    Some(pos) => {
                        let byte = buf[pos];
                        reader.consume(pos);
                        break byte;
                    }
                    None => {
                        let len = buf.len();
                        reader.consume(len);
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        };

        Ok(if first == b'[' {
            Self::Array(JsonArrayStream::new(reader))
        } else {
            Self::Ndjson {
                reader,
                line: 0,
                failed: false,
            }
        })
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Self::Array(_))
    }
}

impl<R: Read> Iterator for ExportStream<R> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::Array(stream) => stream.next_element().transpose(),
            Self::Ndjson { failed: true, .. } => None,
            Self::Ndjson {
                reader,
                line,
                failed,
            } => {
                let mut buf = String::new();
                loop {
                    buf.clear();
                    match reader.read_line(&mut buf) {
                        Ok(0) => return None,
                        Ok(_) => {
                            *line += 1;
                            let trimmed = buf.trim();
                            if trimmed.is_empty() {
                                continue;
                            }
                            return Some(
                                sj::from_str(trimmed)
                                    .map_err(|e| ChatlogError::json(format!("line {line}"), e)),
                            );
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            *failed = true;
                            return Some(Err(e.into()));
                        }
                    }
                }
            }
        }
    }
}

/// Reads every record of an export into memory, in file order.
pub fn load_export(path: impl AsRef<Path>) -> Result<Vec<Value>> {
    ExportStream::from_path(path)?.collect()
}
