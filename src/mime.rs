//! First text/plain leaf extraction from multipart bodies
//!
//! The multipart body is consumed one part at a time through [`Parts`]; nested
//! multiparts are walked recursively on the slice of their enclosing part, so
//! no tree of the message is ever built. Multiparts nested deeper than
//! [`MAX_NESTING_DEPTH`] are skipped like any other part without plain text.
//!
//! Decoded quoted-printable text uses `\n` line breaks, like the rest of a
//! received body.

use std::borrow::Cow;

use base64::{engine::general_purpose, Engine as _};
use mailparse::{MailHeader, MailHeaderMap};

/// Deepest multipart level that is still searched
pub const MAX_NESTING_DEPTH: usize = 32;

/// Returns the first `text/plain` leaf found depth-first under a multipart
/// body, decoded from its `Content-Transfer-Encoding`.
///
/// Never fails: parts that cannot be understood or decoded are skipped, and an
/// empty string means no plain-text leaf was found.
pub fn extract_plain_text(body: &[u8], boundary: &str) -> String {
    extract_at_depth(body, boundary, 0)
}

fn extract_at_depth(body: &[u8], boundary: &str, depth: usize) -> String {
    for part in Parts::new(body, boundary) {
        // No Content-Type means neither multipart nor text/plain here.
        let content_type = match part.headers.get_first_value("Content-Type") {
            Some(value) => mailparse::parse_content_type(&value),
            None => continue,
        };

        if content_type.mimetype.starts_with("multipart/") {
            if depth >= MAX_NESTING_DEPTH {
                continue;
            }
            let nested = content_type
                .params
                .get("boundary")
                .map(String::as_str)
                .unwrap_or("");

            let text = extract_at_depth(part.body, nested, depth + 1);
            if !text.is_empty() {
                return text;
            }
        } else if content_type.mimetype.starts_with("text/plain") {
            let encoding = part
                .headers
                .get_first_value("Content-Transfer-Encoding")
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase();

            if let Some(decoded) = decode_transfer_encoding(part.body, &encoding) {
                return String::from_utf8_lossy(&decoded).into_owned();
            }
        }
    }

    String::new()
}

/// Decodes `base64` and `quoted-printable`; anything else is passed through.
/// `None` means the declared encoding could not be decoded.
fn decode_transfer_encoding<'a>(body: &'a [u8], encoding: &str) -> Option<Cow<'a, [u8]>> {
    match encoding {
        "base64" => {
            let compact: Vec<u8> = body
                .iter()
                .copied()
                .filter(|b| !b.is_ascii_whitespace())
                .collect();
            general_purpose::STANDARD.decode(compact).ok().map(Cow::Owned)
        }
        "quoted-printable" => {
            quoted_printable::decode(body, quoted_printable::ParseMode::Robust)
                .ok()
                .map(|decoded| Cow::Owned(crlf_to_lf(decoded)))
        }
        _ => Some(Cow::Borrowed(body)),
    }
}

fn crlf_to_lf(bytes: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut bytes = bytes.into_iter().peekable();
    while let Some(b) = bytes.next() {
        if b == b'\r' && bytes.peek() == Some(&b'\n') {
            continue;
        }
        out.push(b);
    }
    out
}

/// One part of a multipart body: its headers and the raw, still encoded body.
pub struct Part<'a> {
    pub headers: Vec<MailHeader<'a>>,
    pub body: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Delimiter {
    Next,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ScanState {
    Preamble,
    InPart,
    Done,
}

/// Lazy iterator over the parts of a multipart body.
///
/// The preamble before the first delimiter is skipped. Iteration stops at the
/// closing delimiter, or at the end of input when the closing delimiter is
/// missing. Parts whose headers cannot be parsed are skipped.
pub struct Parts<'a> {
    rest: &'a [u8],
    boundary: &'a [u8],
    state: ScanState,
}

impl<'a> Parts<'a> {
    pub fn new(body: &'a [u8], boundary: &'a str) -> Self {
        let state = if boundary.is_empty() {
            ScanState::Done
        } else {
            ScanState::Preamble
        };

        Self {
            rest: body,
            boundary: boundary.as_bytes(),
            state,
        }
    }

    fn delimiter(&self, line: &[u8]) -> Option<Delimiter> {
        let rest = line.strip_prefix(b"--")?.strip_prefix(self.boundary)?;
        let (kind, rest) = match rest.strip_prefix(b"--") {
            Some(rest) => (Delimiter::Close, rest),
            None => (Delimiter::Next, rest),
        };

        if rest.iter().all(|b| b.is_ascii_whitespace()) {
            Some(kind)
        } else {
            None
        }
    }

    fn skip_preamble(&mut self) {
        while !self.rest.is_empty() {
            let (line, rest) = split_line(self.rest);
            self.rest = rest;

            match self.delimiter(line) {
                Some(Delimiter::Next) => {
                    self.state = ScanState::InPart;
                    return;
                }
                Some(Delimiter::Close) => break,
                None => {}
            }
        }

        self.state = ScanState::Done;
    }

    /// Raw bytes of the next part, headers included.
    fn next_raw(&mut self) -> Option<&'a [u8]> {
        if self.state == ScanState::Preamble {
            self.skip_preamble();
        }
        if self.state == ScanState::Done {
            return None;
        }

        let content = self.rest;
        let mut cursor = content;

        while !cursor.is_empty() {
            let line_start = content.len() - cursor.len();
            let (line, rest) = split_line(cursor);

            if let Some(kind) = self.delimiter(line) {
                self.rest = rest;
                if kind == Delimiter::Close {
                    self.state = ScanState::Done;
                }
                // The line break before a delimiter belongs to the delimiter.
                return Some(strip_line_ending(&content[..line_start]));
            }

            cursor = rest;
        }

        self.rest = &[];
        self.state = ScanState::Done;
        Some(content)
    }
}

impl<'a> Iterator for Parts<'a> {
    type Item = Part<'a>;

    fn next(&mut self) -> Option<Part<'a>> {
        loop {
            let content = self.next_raw()?;
            if let Ok((headers, offset)) = mailparse::parse_headers(content) {
                return Some(Part {
                    headers,
                    body: &content[offset..],
                });
            }
        }
    }
}

/// Splits off the first line, without its `\n`, and returns the remainder.
fn split_line(buf: &[u8]) -> (&[u8], &[u8]) {
    match buf.iter().position(|&b| b == b'\n') {
        Some(i) => (&buf[..i], &buf[i + 1..]),
        None => (buf, &[]),
    }
}

fn strip_line_ending(buf: &[u8]) -> &[u8] {
    let buf = buf.strip_suffix(b"\n").unwrap_or(buf);
    buf.strip_suffix(b"\r").unwrap_or(buf)
}
