//! Frame encoding and decoding
//!
//! A frame is `tag|field1|field2|...`. Decoding is lossless for any tag and
//! fields that do not contain the separator or a line break.

use crate::error::{ProtoError, Result};
use std::fmt;
use std::str::FromStr;

/// Field separator
pub const SEPARATOR: char = '|';

/// One protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: String,
    pub fields: Vec<String>,
}

impl Frame {
    /// Build a frame, rejecting anything that would not survive a round trip
    pub fn new<T, I, S>(tag: T, fields: I) -> Result<Self>
    where
        T: Into<String>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tag = tag.into();
        if tag.is_empty() {
            return Err(ProtoError::MalformedFrame("empty tag".into()));
        }
        check_part(&tag)?;

        let fields = fields
            .into_iter()
            .map(Into::into)
            .map(|field: String| check_part(&field).map(|_| field))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { tag, fields })
    }

    /// Frame with a tag and no fields
    pub fn bare(tag: impl Into<String>) -> Result<Self> {
        Self::new(tag, std::iter::empty::<String>())
    }

    /// Serialize to the wire text (no terminator)
    pub fn encode(&self) -> String {
        encode(&self.tag, &self.fields)
    }

    /// Field by position
    pub fn field(&self, index: usize) -> Option<&str> {
        self.fields.get(index).map(String::as_str)
    }

    /// Parse a field by position, `None` if missing or unparsable
    pub fn parse_field<T: FromStr>(&self, index: usize) -> Option<T> {
        self.field(index).and_then(|f| f.trim().parse().ok())
    }

    /// True if the tag contains `tag` (empty always matches)
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tag.contains(tag)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

fn check_part(part: &str) -> Result<()> {
    if part.contains(SEPARATOR) {
        return Err(ProtoError::MalformedFrame(format!(
            "separator in '{}'",
            part
        )));
    }
    if part.contains(['\n', '\r']) {
        return Err(ProtoError::MalformedFrame(format!(
            "line break in '{}'",
            part.escape_debug()
        )));
    }
    Ok(())
}

/// Join a tag and fields with the separator. Nothing is escaped.
pub fn encode<S: AsRef<str>>(tag: &str, fields: &[S]) -> String {
    let capacity = tag.len() + fields.iter().map(|f| f.as_ref().len() + 1).sum::<usize>();
    let mut out = String::with_capacity(capacity);
    out.push_str(tag);
    for field in fields {
        out.push(SEPARATOR);
        out.push_str(field.as_ref());
    }
    out
}

/// Split raw text into a frame. One trailing line break is ignored.
///
/// Empty text and an empty tag (`|x`) are malformed; empty fields after the
/// tag are kept.
pub fn decode(raw: &str) -> Result<Frame> {
    let raw = strip_terminator(raw);
    if raw.is_empty() {
        return Err(ProtoError::MalformedFrame("empty frame".into()));
    }

    let mut parts = raw.split(SEPARATOR);
    let tag = parts.next().unwrap_or_default().to_string();
    if tag.is_empty() {
        return Err(ProtoError::MalformedFrame(format!("missing tag in '{}'", raw)));
    }

    Ok(Frame {
        tag,
        fields: parts.map(str::to_string).collect(),
    })
}

/// Tag check without a full decode
pub fn has_tag(raw: &str, tag: &str) -> bool {
    if tag.is_empty() {
        return true;
    }
    let raw = strip_terminator(raw);
    let head = raw.split(SEPARATOR).next().unwrap_or_default();
    head.contains(tag)
}

/// Read a status bit from a frame.
///
/// Handles both shapes the device uses: the bit glued to the tag (`WC1`,
/// `WS0`) and the bit as the first field (`REGISTER|1`).
pub fn status_bit(frame: &Frame, prefix: &str) -> Option<bool> {
    let rest = frame.tag.strip_prefix(prefix)?;
    let bit = if rest.is_empty() {
        frame.field(0)?.trim()
    } else {
        rest
    };
    match bit {
        "1" => Some(true),
        "0" => Some(false),
        _ => None,
    }
}

fn strip_terminator(raw: &str) -> &str {
    raw.strip_suffix("\r\n")
        .or_else(|| raw.strip_suffix('\n'))
        .unwrap_or(raw)
}
