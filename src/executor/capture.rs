// Bounded capture of command output streams

use std::io::{self, Read};

use tokio::io::{AsyncRead, AsyncReadExt};

const CHUNK: usize = 8 * 1024;

/// Bytes kept from one output stream
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Captured {
    pub bytes: Vec<u8>,
    /// More bytes arrived than were kept
    pub truncated: bool,
}

impl Captured {
    fn push(&mut self, chunk: &[u8], limit: usize) {
        let room = limit.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    /// Invalid UTF-8 becomes U+FFFD; commands may print anything
    pub fn into_text(self) -> String {
        match String::from_utf8(self.bytes) {
            Ok(text) => text,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        }
    }
}

/// Read to EOF keeping at most `limit` bytes. The rest is drained so the
/// writer never stalls on a full pipe or window.
pub fn read_capped<R: Read>(mut reader: R, limit: usize) -> io::Result<Captured> {
    let mut captured = Captured::default();
    let mut buf = [0u8; CHUNK];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => return Ok(captured),
            Ok(n) => captured.push(&buf[..n], limit),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Async counterpart of [`read_capped`]
pub async fn read_capped_async<R: AsyncRead + Unpin>(
    mut reader: R,
    limit: usize,
) -> io::Result<Captured> {
    let mut captured = Captured::default();
    let mut buf = vec![0u8; CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => return Ok(captured),
            Ok(n) => captured.push(&buf[..n], limit),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}
