use std::io;

use bytes::{Bytes, BytesMut};
use itertools::Itertools;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Reads beanstalk replies from a stream: CRLF-terminated lines, and the
/// fixed-size data blocks that follow `RESERVED` and `OK` lines.
pub struct LineReader<T: AsyncRead + Unpin> {
    /// Stores data that's been read in but not yet handed out.
    buf: BytesMut,
    /// Index in buf from which a valid CRLF pair may appear (and before which
    /// a CRLF sequence hasn't been seen).
    maybe_crlf_from: usize,
    /// Data source
    reader: T,
    /// On a reading error, this field is set and its value returned once the
    /// buffer is drained of pending lines.
    pending_error: Option<io::Error>,
}

impl<T: AsyncRead + Unpin> LineReader<T> {
    /// Reads a line from the internal buffer and/or reader. On an end-of-stream
    /// condition, returns a None result, discarding any partly-read line in the
    /// internal buffer.
    ///
    /// On a read error, the error value is returned after processing all
    /// pending lines in the internal buffer.
    pub async fn read_line(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            // Scan from one byte before the newest data, in case a \r arrived
            // at the end of the previous read and its \n in this one.
            if let Some(eoc) = self
                .buf
                .iter()
                .skip(self.maybe_crlf_from)
                .tuple_windows::<(_, _)>()
                .position(|x| x == (&b'\r', &b'\n'))
            {
                let line =
                    self.buf.split_to(self.maybe_crlf_from + eoc + 2).freeze();
                self.maybe_crlf_from = 0;

                // Drop trailing b"\r\n".
                return Ok(Some(line.slice(0..line.len() - 2)));
            }

            let n_bytes_read = self.fill().await;

            // Set maybe_crlf_from to the byte before the first byte returned
            // by this read (and 0 if buf is empty).
            self.maybe_crlf_from =
                self.buf.len().saturating_sub(n_bytes_read + 1);

            if n_bytes_read == 0 {
                return match self.pending_error.take() {
                    Some(e) => Err(e),
                    None => Ok(None),
                };
            }
        }
    }

    /// Reads a data block of exactly `n_bytes`, followed by a CRLF which is
    /// checked and discarded.
    pub async fn read_block(&mut self, n_bytes: usize) -> io::Result<Bytes> {
        while self.buf.len() < n_bytes + 2 {
            if self.fill().await == 0 {
                return Err(self.pending_error.take().unwrap_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream ended inside a data block",
                    )
                }));
            }
        }

        let block = self.buf.split_to(n_bytes + 2).freeze();
        self.maybe_crlf_from = 0;

        if &block[n_bytes..] != b"\r\n" {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "data block not terminated by CRLF",
            ));
        }

        Ok(block.slice(0..n_bytes))
    }

    /// Reads once from the underlying reader into the buffer, returning the
    /// number of bytes read. Zero means end of stream or a stored error.
    async fn fill(&mut self) -> usize {
        match self.reader.read_buf(&mut self.buf).await {
            Ok(n) => n,
            Err(e) => {
                self.pending_error = Some(e);
                0
            },
        }
    }
}

impl<T: AsyncRead + Unpin> From<T> for LineReader<T> {
    fn from(value: T) -> Self {
        Self {
            buf: BytesMut::new(),
            maybe_crlf_from: 0,
            reader: value,
            pending_error: None,
        }
    }
}
