use std::collections::VecDeque;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tracing::debug;

const READ_CHUNK_BYTES: usize = 8192;

/// Line ending used by the shell on the far side of the pipe. This is a
/// property of the spawned process, not of the host platform, so it is fixed
/// when a session is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineSeparator {
    Lf,
    Cr,
    CrLf,
}

impl LineSeparator {
    pub const fn as_str(self) -> &'static str {
        match self {
            LineSeparator::Lf => "\n",
            LineSeparator::Cr => "\r",
            LineSeparator::CrLf => "\r\n",
        }
    }

    /// Separator conventionally produced by shells on the host platform.
    pub const fn native() -> Self {
        if cfg!(windows) {
            LineSeparator::CrLf
        } else {
            LineSeparator::Lf
        }
    }
}

impl Default for LineSeparator {
    fn default() -> Self {
        Self::native()
    }
}

/// Incremental byte-to-line decoder.
///
/// A one-byte separator ends a line on exactly that byte; `CrLf` ends a line
/// on `\n` when the pending buffer ends with `\r`, stripping the `\r`. Bytes
/// that merely resemble a separator (a stray `\r` under `Lf`, for example)
/// stay part of the line. Decoded lines are lossy UTF-8.
#[derive(Debug)]
pub struct LineDecoder {
    separator: LineSeparator,
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new(separator: LineSeparator) -> Self {
        Self {
            separator,
            buffer: Vec::new(),
        }
    }

    pub fn feed(&mut self, bytes: &[u8], lines: &mut Vec<String>) {
        for &byte in bytes {
            match self.separator {
                LineSeparator::Lf if byte == b'\n' => lines.push(self.take_line()),
                LineSeparator::Cr if byte == b'\r' => lines.push(self.take_line()),
                LineSeparator::CrLf if byte == b'\n' && self.buffer.last() == Some(&b'\r') => {
                    self.buffer.pop();
                    lines.push(self.take_line());
                }
                _ => self.buffer.push(byte),
            }
        }
    }

    /// Flush the trailing unterminated fragment, if any. Called on stream end.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.take_line())
        }
    }

    fn take_line(&mut self) -> String {
        String::from_utf8_lossy(&std::mem::take(&mut self.buffer)).into_owned()
    }
}

/// Lazy asynchronous line sequence over a raw byte reader.
///
/// Yields `None` once the reader is exhausted; a final unterminated fragment
/// is yielded before that only if non-empty. Cancellation is dropping the
/// reader (closing the far end of the pipe unblocks a pending read).
#[derive(Debug)]
pub struct LineReader<R> {
    reader: R,
    decoder: LineDecoder,
    pending: VecDeque<String>,
    chunk: Vec<u8>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R, separator: LineSeparator) -> Self {
        Self {
            reader,
            decoder: LineDecoder::new(separator),
            pending: VecDeque::new(),
            chunk: vec![0u8; READ_CHUNK_BYTES],
            eof: false,
        }
    }

    pub async fn next_line(&mut self) -> Option<String> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Some(line);
            }
            if self.eof {
                return None;
            }
            match self.reader.read(&mut self.chunk).await {
                Ok(0) => {
                    self.eof = true;
                    return self.decoder.finish();
                }
                Ok(n) => {
                    let mut lines = Vec::new();
                    self.decoder.feed(&self.chunk[..n], &mut lines);
                    self.pending.extend(lines);
                }
                Err(err) => {
                    debug!("line reader terminated by read error: {err}");
                    self.eof = true;
                    return None;
                }
            }
        }
    }
}
