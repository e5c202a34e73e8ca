//! Length-delimited framing over byte streams.
//!
//! Every frame starts with a 4-byte big-endian length that counts the
//! whole frame, header included, followed by the payload. The writer
//! reserves the header up front and fills it in on [`FrameWriter::seal`].
//! The reader accepts bytes in whatever pieces the transport delivers and
//! only reports a frame once all of it has arrived. While a frame is
//! current, [`std::io::Read`] on the reader yields its payload and then
//! end-of-stream; bytes of the following frame stay buffered until the
//! next [`FrameReader::read_frame`] call discards the current one.

use std::io::{self, Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use concord_proto::constants::{FRAME_HEADER_SIZE, FRAME_INITIAL_CAPACITY};
use concord_proto::defaults::{DEFAULT_MAX_FRAME_SIZE, DEFAULT_READ_CHUNK_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt};

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Accumulates writes for one frame at a time.
#[derive(Debug)]
pub struct FrameWriter {
    buf: BytesMut,
}

impl FrameWriter {
    pub fn new() -> Self {
        let mut buf = BytesMut::with_capacity(FRAME_INITIAL_CAPACITY);
        buf.put_bytes(0, FRAME_HEADER_SIZE);
        Self { buf }
    }

    /// Payload bytes written since the last seal or reset.
    pub fn len(&self) -> usize {
        self.buf.len() - FRAME_HEADER_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.put_i32(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.put_u64(v);
    }

    pub fn put_slice(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    /// Finish the current frame and return it, header included.
    ///
    /// The writer starts a fresh frame afterwards. The returned bytes do
    /// not share state with the writer, so later writes or resets cannot
    /// disturb a frame that is still queued for sending.
    pub fn seal(&mut self) -> Bytes {
        let total = length_header(self.buf.len());
        self.buf[..FRAME_HEADER_SIZE].copy_from_slice(&total.to_be_bytes());
        let frame = self.buf.split().freeze();
        self.buf.put_bytes(0, FRAME_HEADER_SIZE);
        frame
    }

    /// Drop whatever has been written since the last seal.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.buf.put_bytes(0, FRAME_HEADER_SIZE);
    }
}

/// Header value for a frame of `len` bytes. A frame too long for the
/// header is stamped `u32::MAX`, which every reader rejects as oversized.
fn length_header(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

impl Default for FrameWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for FrameWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Reassembles frames from an arbitrarily fragmented byte stream.
#[derive(Debug)]
pub struct FrameReader {
    /// Current frame (header first) followed by any bytes already read
    /// from the frames after it.
    buf: BytesMut,
    /// Declared length of the current frame, 0 until its header is in.
    length: usize,
    /// Whether `buf` holds all of the current frame.
    complete: bool,
    /// Read cursor into the current frame.
    pos: usize,
    max_frame: usize,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::with_max_frame(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame(max_frame: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(FRAME_INITIAL_CAPACITY),
            length: 0,
            complete: false,
            pos: FRAME_HEADER_SIZE,
            max_frame,
        }
    }

    /// Try to complete the next frame with at most one read from `source`.
    ///
    /// Returns `Ok(true)` once a whole frame is buffered, `Ok(false)` if
    /// more bytes are needed (including when a non-blocking source has
    /// nothing to offer). A previously completed frame is discarded first,
    /// whether or not its payload was read.
    pub fn read_frame<R: Read>(&mut self, source: &mut R) -> io::Result<bool> {
        self.discard_current();
        if self.check_complete()? {
            return Ok(true);
        }

        let want = self.read_size();
        let start = self.buf.len();
        self.buf.resize(start + want, 0);
        match source.read(&mut self.buf[start..]) {
            Ok(0) => {
                self.buf.truncate(start);
                Err(self.eof_error())
            }
            Ok(n) => {
                self.buf.truncate(start + n);
                self.check_complete()
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                self.buf.truncate(start);
                Ok(false)
            }
            Err(e) => {
                self.buf.truncate(start);
                Err(e)
            }
        }
    }

    /// Async counterpart of [`FrameReader::read_frame`].
    pub async fn read_frame_from<R: AsyncRead + Unpin>(
        &mut self,
        source: &mut R,
    ) -> io::Result<bool> {
        self.discard_current();
        if self.check_complete()? {
            return Ok(true);
        }

        self.buf.reserve(self.read_size());
        let n = source.read_buf(&mut self.buf).await?;
        if n == 0 {
            return Err(self.eof_error());
        }
        self.check_complete()
    }

    /// Read from `source` until a whole frame is buffered.
    pub async fn next_frame<R: AsyncRead + Unpin>(&mut self, source: &mut R) -> io::Result<()> {
        while !self.read_frame_from(source).await? {}
        Ok(())
    }

    /// Whether a complete frame is current.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Unread payload of the current frame.
    pub fn remaining(&self) -> &[u8] {
        if self.complete {
            &self.buf[self.pos..self.length]
        } else {
            &[]
        }
    }

    /// Whether bytes of an unfinished frame are buffered.
    pub fn has_partial(&self) -> bool {
        !self.complete && !self.buf.is_empty()
    }

    /// Forget everything buffered. Used when the connection is abandoned.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.length = 0;
        self.complete = false;
        self.pos = FRAME_HEADER_SIZE;
    }

    fn discard_current(&mut self) {
        if self.complete {
            self.buf.advance(self.length);
            self.length = 0;
            self.complete = false;
            self.pos = FRAME_HEADER_SIZE;
        }
    }

    fn check_complete(&mut self) -> io::Result<bool> {
        if self.length == 0 {
            if self.buf.len() < FRAME_HEADER_SIZE {
                return Ok(false);
            }
            let mut header = [0u8; FRAME_HEADER_SIZE];
            header.copy_from_slice(&self.buf[..FRAME_HEADER_SIZE]);
            let declared = u32::from_be_bytes(header) as usize;
            if declared < FRAME_HEADER_SIZE || declared > self.max_frame {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("malformed frame header: length {}", declared),
                ));
            }
            self.length = declared;
        }
        if self.buf.len() >= self.length {
            self.complete = true;
            self.pos = FRAME_HEADER_SIZE;
        }
        Ok(self.complete)
    }

    fn read_size(&self) -> usize {
        let needed = if self.length == 0 {
            FRAME_HEADER_SIZE - self.buf.len()
        } else {
            self.length - self.buf.len()
        };
        needed.max(DEFAULT_READ_CHUNK_SIZE)
    }

    fn eof_error(&self) -> io::Error {
        if self.buf.is_empty() {
            io::Error::new(io::ErrorKind::UnexpectedEof, "end of stream")
        } else {
            io::Error::new(io::ErrorKind::UnexpectedEof, "stream ended inside a frame")
        }
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl Read for FrameReader {
    /// Reads the current frame's payload; returns 0 at its end.
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let remaining = self.remaining();
        let n = out.len().min(remaining.len());
        out[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }
}
