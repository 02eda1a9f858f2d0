//! Scripted pairing link for unit tests

use super::PairingLink;
use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::sync::{Arc, Mutex};

/// Hands out scripted inbound chunks, records everything written.
/// Once the script runs out, reads time out.
#[derive(Clone, Default)]
pub struct MockLink {
    inner: Arc<Mutex<MockLinkInner>>,
}

#[derive(Default)]
struct MockLinkInner {
    inbound: VecDeque<Vec<u8>>,
    written: Vec<u8>,
}

impl MockLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one inbound line (terminator added)
    pub fn inject_line(&self, line: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.inbound.push_back(format!("{}\n", line).into_bytes());
    }

    /// Lines written so far
    pub fn written_lines(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        String::from_utf8_lossy(&inner.written)
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl Read for MockLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        match inner.inbound.pop_front() {
            Some(chunk) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    inner.inbound.push_front(chunk[n..].to_vec());
                }
                Ok(n)
            }
            None => Err(io::Error::new(ErrorKind::TimedOut, "script exhausted")),
        }
    }
}

impl Write for MockLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        inner.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl PairingLink for MockLink {
    fn describe(&self) -> String {
        "mock".to_string()
    }
}
