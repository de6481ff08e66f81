use std::pin::Pin;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::Result;

/// One line as read from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    /// Line bytes without the `\n` (and a preceding `\r`).
    pub bytes: Vec<u8>,
    /// False only for a final line that hit end-of-stream before `\n`.
    pub terminated: bool,
}

impl Line {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Line-oriented view over any byte stream returned by a registrar.
///
/// Dropping the reader closes the underlying file or HTTP body.
pub struct LineReader {
    inner: Pin<Box<dyn AsyncBufRead + Send>>,
    buf: Vec<u8>,
}

impl LineReader {
    pub fn new<R>(reader: R) -> Self
    where
        R: AsyncBufRead + Send + 'static,
    {
        Self {
            inner: Box::pin(reader),
            buf: Vec::new(),
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self::new(std::io::Cursor::new(bytes))
    }

    pub async fn next_line(&mut self) -> Result<Option<Line>> {
        self.buf.clear();
        let n = self.inner.read_until(b'\n', &mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }
        let terminated = self.buf.last() == Some(&b'\n');
        if terminated {
            self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
        }
        Ok(Some(Line {
            bytes: self.buf.clone(),
            terminated,
        }))
    }

    /// Drains whatever is left in the stream.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.inner.read_to_end(&mut out).await?;
        Ok(out)
    }
}

impl std::fmt::Debug for LineReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineReader").finish_non_exhaustive()
    }
}
