//! Encrypted, tagged streams.
//!
//! Wire format of one stream:
//!
//! ```text
//! +----------------+
//! | tag (16)       |   written on first flush
//! +----------------+
//! | flags (1)      |-+
//! | length (2, BE) | |  header, authenticated as AEAD associated data
//! +----------------+-+
//! | ciphertext     |   length + 16 bytes, XChaCha20-Poly1305
//! +----------------+
//! | ... more frames, the last one with FLAG_FINAL set
//! ```
//!
//! Frames are read exactly, so once a reader has seen the final frame the
//! raw channel is positioned at the start of whatever follows.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::StreamContext;
use crate::core::{
    StreamError, AEAD_TAG_SIZE, MAX_STREAM_FRAME_PAYLOAD, STREAM_FLAG_FINAL, STREAM_FRAME_HEADER_LENGTH,
};
use crate::crypto::{aead, kdf, SecretKey, Tag};

fn frame_header(flags: u8, len: usize) -> [u8; STREAM_FRAME_HEADER_LENGTH] {
    let len = len as u16;
    [flags, (len >> 8) as u8, len as u8]
}

/// Writes an encrypted stream.
pub struct StreamWriter<W> {
    inner: W,
    tag: Option<Tag>,
    stream_key: SecretKey,
    frame_counter: u64,
    buffer: Vec<u8>,
    finished: bool,
}

impl<W: AsyncWrite + Unpin> StreamWriter<W> {
    /// Create a writer, consuming the stream context.
    pub fn new(inner: W, ctx: StreamContext) -> Result<Self, StreamError> {
        let stream_key = kdf::derive_stream_key(ctx.header_key(), ctx.stream_number())?;
        Ok(Self {
            inner,
            tag: Some(*ctx.tag()),
            stream_key,
            frame_counter: 0,
            buffer: Vec::with_capacity(MAX_STREAM_FRAME_PAYLOAD),
            finished: false,
        })
    }

    async fn write_tag(&mut self) -> Result<(), StreamError> {
        if let Some(tag) = self.tag.take() {
            self.inner.write_all(&tag).await?;
        }
        Ok(())
    }

    async fn write_frame(&mut self, flags: u8, len: usize) -> Result<(), StreamError> {
        self.write_tag().await?;
        let header = frame_header(flags, len);
        let payload: Vec<u8> = self.buffer.drain(..len).collect();
        let ciphertext = aead::encrypt(
            &self.stream_key,
            &aead::frame_nonce(self.frame_counter),
            &header,
            &payload,
        )?;
        self.frame_counter += 1;
        self.inner.write_all(&header).await?;
        self.inner.write_all(&ciphertext).await?;
        Ok(())
    }

    /// Buffer `data`, writing full frames as they fill up.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), StreamError> {
        if self.finished {
            return Err(StreamError::Finished);
        }
        self.buffer.extend_from_slice(data);
        while self.buffer.len() >= MAX_STREAM_FRAME_PAYLOAD {
            self.write_frame(0, MAX_STREAM_FRAME_PAYLOAD).await?;
        }
        Ok(())
    }

    /// Write the tag if not yet written, any buffered data as a frame, and
    /// flush the channel.
    pub async fn flush(&mut self) -> Result<(), StreamError> {
        if self.finished {
            return Err(StreamError::Finished);
        }
        self.write_tag().await?;
        if !self.buffer.is_empty() {
            let len = self.buffer.len();
            self.write_frame(0, len).await?;
        }
        self.inner.flush().await?;
        Ok(())
    }

    /// Write the final frame and flush. Further writes fail.
    pub async fn finish(&mut self) -> Result<(), StreamError> {
        if self.finished {
            return Ok(());
        }
        let len = self.buffer.len();
        self.write_frame(STREAM_FLAG_FINAL, len).await?;
        self.inner.flush().await?;
        self.finished = true;
        Ok(())
    }

    /// Whether the final frame has been written.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Give back the raw channel.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Reads an encrypted stream whose tag has already been consumed.
pub struct StreamReader<R> {
    inner: R,
    stream_key: SecretKey,
    frame_counter: u64,
    buffer: Vec<u8>,
    pos: usize,
    finished: bool,
}

impl<R: AsyncRead + Unpin> StreamReader<R> {
    /// Create a reader, consuming the stream context.
    pub fn new(inner: R, ctx: StreamContext) -> Result<Self, StreamError> {
        let stream_key = kdf::derive_stream_key(ctx.header_key(), ctx.stream_number())?;
        Ok(Self {
            inner,
            stream_key,
            frame_counter: 0,
            buffer: Vec::new(),
            pos: 0,
            finished: false,
        })
    }

    async fn read_frame(&mut self) -> Result<(), StreamError> {
        let mut header = [0u8; STREAM_FRAME_HEADER_LENGTH];
        self.inner.read_exact(&mut header).await?;
        let len = u16::from_be_bytes([header[1], header[2]]) as usize;
        if len > MAX_STREAM_FRAME_PAYLOAD {
            return Err(StreamError::InvalidLength(len));
        }

        let mut ciphertext = vec![0u8; len + AEAD_TAG_SIZE];
        self.inner.read_exact(&mut ciphertext).await?;
        self.buffer = aead::decrypt(
            &self.stream_key,
            &aead::frame_nonce(self.frame_counter),
            &header,
            &ciphertext,
        )?;
        self.pos = 0;
        self.frame_counter += 1;
        if header[0] & STREAM_FLAG_FINAL != 0 {
            self.finished = true;
        }
        Ok(())
    }

    /// Read up to `buf.len()` bytes. Returns 0 at the end of the stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        while self.pos == self.buffer.len() {
            if self.finished {
                return Ok(0);
            }
            self.read_frame().await?;
        }
        let n = buf.len().min(self.buffer.len() - self.pos);
        buf[..n].copy_from_slice(&self.buffer[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    /// Fill `buf` completely. Ending the stream first is an error.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), StreamError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(StreamError::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
            filled += n;
        }
        Ok(())
    }

    /// Read and discard the rest of the stream, up to its final frame.
    pub async fn drain(&mut self) -> Result<usize, StreamError> {
        let mut discarded = self.buffer.len() - self.pos;
        self.pos = self.buffer.len();
        while !self.finished {
            self.read_frame().await?;
            discarded += self.buffer.len();
            self.pos = self.buffer.len();
        }
        Ok(discarded)
    }

    /// Whether the final frame has been read.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Give back the raw channel.
    pub fn into_inner(self) -> R {
        self.inner
    }
}
