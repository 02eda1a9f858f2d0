//! Stream framing
//!
//! Frames travel over byte streams (TCP, serial). Two framings are supported:
//!
//! | Framing | Writer | Reader |
//! |---------|--------|--------|
//! | `Line` (default) | frame + `\n` | buffers until `\n`, so split and coalesced reads are reassembled |
//! | `Raw` | frame bytes only | one `read` call is one frame |
//!
//! `Raw` matches the existing embedded firmware, which relies on every `recv`
//! returning exactly one message. It breaks when TCP splits or merges
//! segments. `Line` fixes that, but a `Line` peer cannot talk to a `Raw` peer:
//! both ends must be configured with the same framing.

use crate::error::{ProtoError, Result};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read, Write};

/// Largest accepted frame, excluding the terminator
pub const MAX_FRAME_LEN: usize = 4096;

/// Bytes requested per `read` call (the firmware reads 1024 at a time)
const READ_CHUNK: usize = 1024;

/// Supported stream framings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// Newline-terminated frames
    #[default]
    Line,
    /// Legacy: one read is one frame
    Raw,
}

/// Stateful frame reader/writer for one connection
///
/// Keeps the bytes of a partially received line between calls, so a read
/// timeout in the middle of a frame does not lose data.
#[derive(Debug)]
pub struct Framer {
    framing: Framing,
    pending: Vec<u8>,
    chunk: Vec<u8>,
}

impl Framer {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            pending: Vec::new(),
            chunk: vec![0u8; READ_CHUNK],
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Drop any partially received data (call after reconnecting)
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// True if a complete or partial frame is already buffered
    pub fn has_buffered(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Write one frame
    pub fn write_frame<W: Write + ?Sized>(&self, writer: &mut W, text: &str) -> Result<()> {
        match self.framing {
            Framing::Line => {
                let mut bytes = Vec::with_capacity(text.len() + 1);
                bytes.extend_from_slice(text.as_bytes());
                bytes.push(b'\n');
                writer.write_all(&bytes)?;
            }
            Framing::Raw => writer.write_all(text.as_bytes())?,
        }
        writer.flush()?;
        log::trace!("-> {}", text);
        Ok(())
    }

    /// Read one frame.
    ///
    /// Returns `Ok(None)` when the reader's timeout elapses before a full frame
    /// arrived, `Err(Disconnected)` on end of stream.
    pub fn read_frame<R: Read + ?Sized>(&mut self, reader: &mut R) -> Result<Option<String>> {
        match self.framing {
            Framing::Line => self.read_line(reader),
            Framing::Raw => self.read_raw(reader),
        }
    }

    fn read_line<R: Read + ?Sized>(&mut self, reader: &mut R) -> Result<Option<String>> {
        loop {
            if let Some(line) = self.take_line()? {
                return Ok(Some(line));
            }

            let n = match reader.read(&mut self.chunk) {
                Ok(0) => return Err(ProtoError::Disconnected),
                Ok(n) => n,
                Err(e) if is_timeout(&e) => return Ok(None),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(ProtoError::Io(e)),
            };
            self.pending.extend_from_slice(&self.chunk[..n]);

            if self.pending.len() > MAX_FRAME_LEN && !self.pending.contains(&b'\n') {
                let len = self.pending.len();
                self.pending.clear();
                return Err(ProtoError::MalformedFrame(format!(
                    "frame exceeds {} bytes ({} buffered without terminator)",
                    MAX_FRAME_LEN, len
                )));
            }
        }
    }

    /// Pop the next non-empty buffered line
    fn take_line(&mut self) -> Result<Option<String>> {
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.is_empty() {
                continue;
            }
            if line.len() > MAX_FRAME_LEN {
                return Err(ProtoError::MalformedFrame(format!(
                    "frame exceeds {} bytes",
                    MAX_FRAME_LEN
                )));
            }
            return into_text(line).map(Some);
        }
        Ok(None)
    }

    fn read_raw<R: Read + ?Sized>(&mut self, reader: &mut R) -> Result<Option<String>> {
        loop {
            return match reader.read(&mut self.chunk) {
                Ok(0) => Err(ProtoError::Disconnected),
                Ok(n) => {
                    let text = into_text(self.chunk[..n].to_vec())?;
                    let text = text.trim_end_matches(['\r', '\n']);
                    if text.is_empty() {
                        Ok(None)
                    } else {
                        Ok(Some(text.to_string()))
                    }
                }
                Err(e) if is_timeout(&e) => Ok(None),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => Err(ProtoError::Io(e)),
            };
        }
    }
}

fn into_text(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes)
        .map_err(|e| ProtoError::MalformedFrame(format!("invalid UTF-8: {}", e)))
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}
