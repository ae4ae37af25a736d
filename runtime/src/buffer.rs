//! Zero-copy byte views and write sinks.
//!
//! [`DataBuffer`] is a cursor over an immutable byte region: decoders consume
//! from the front without copying, and whatever remains can be handed off to a
//! block encoder for later delivery. [`DataOutBuffer`] is the write-side
//! contract: a fixed-capacity sink over externally owned memory for the fast
//! path, and a growable builder used as overflow when a frame does not fit.

use crate::Error;
use bytes::{Bytes, BytesMut};

/// An owned, cheaply cloneable view over a contiguous byte region.
///
/// Advancing the cursor never copies: the underlying region is reference
/// counted and [`DataBuffer::take`] splits it in place.
#[derive(Clone, Debug, Default)]
pub struct DataBuffer {
    inner: Bytes,
}

impl DataBuffer {
    /// Returns a view over `bytes`.
    pub fn new(bytes: Bytes) -> Self {
        Self { inner: bytes }
    }

    /// Number of unconsumed bytes.
    pub fn remaining(&self) -> usize {
        self.inner.len()
    }

    /// Returns whether all bytes have been consumed.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// The unconsumed bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.inner
    }

    /// Consume `n` bytes without inspecting them.
    ///
    /// Panics if `n` exceeds [`DataBuffer::remaining`]; consuming bytes that
    /// were never received is a programming error in the caller.
    pub fn advance(&mut self, n: usize) {
        let _ = self.inner.split_to(n);
    }

    /// Consume and return the next `n` bytes without copying.
    ///
    /// Panics if `n` exceeds [`DataBuffer::remaining`].
    pub fn take(&mut self, n: usize) -> Bytes {
        self.inner.split_to(n)
    }

    /// Consume and return everything that remains.
    pub fn take_all(&mut self) -> Bytes {
        self.inner.split_to(self.inner.len())
    }

    /// Unwraps the remaining bytes.
    pub fn into_bytes(self) -> Bytes {
        self.inner
    }
}

impl From<Bytes> for DataBuffer {
    fn from(bytes: Bytes) -> Self {
        Self::new(bytes)
    }
}

impl From<Vec<u8>> for DataBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(Bytes::from(bytes))
    }
}

impl From<&'static [u8]> for DataBuffer {
    fn from(bytes: &'static [u8]) -> Self {
        Self::new(Bytes::from_static(bytes))
    }
}

impl From<&'static str> for DataBuffer {
    fn from(s: &'static str) -> Self {
        Self::new(Bytes::from_static(s.as_bytes()))
    }
}

/// A write sink for [`crate::Encoder`]s.
///
/// Implementations either bound `available` by a fixed capacity (the
/// socket-backed scratch region) or grow on demand (the overflow builder).
pub trait DataOutBuffer {
    /// Number of bytes that can still be written. Growable sinks report
    /// [`usize::MAX`].
    fn available(&self) -> usize;

    /// Copies `min(src.remaining(), self.available())` bytes from `src`,
    /// advancing both sides. Returns the number of bytes copied.
    fn copy(&mut self, src: &mut DataBuffer) -> usize;

    /// Writes the whole slice or fails with [`Error::BufferOverflow`].
    ///
    /// Callers that sized their frame correctly never see the error; it
    /// indicates a producer that lied about its length.
    fn write(&mut self, bytes: &[u8]) -> Result<(), Error>;
}

/// Fixed-capacity sink over externally owned memory.
///
/// The worker points this at its per-loop write scratch so encoders stream
/// straight into the buffer that is handed to the socket.
pub struct FixedOutBuffer<'a> {
    buf: &'a mut [u8],
    written: usize,
}

impl<'a> FixedOutBuffer<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, written: 0 }
    }

    /// Bytes written so far.
    pub fn written(&self) -> usize {
        self.written
    }

    /// The filled prefix.
    pub fn filled(&self) -> &[u8] {
        &self.buf[..self.written]
    }
}

impl DataOutBuffer for FixedOutBuffer<'_> {
    fn available(&self) -> usize {
        self.buf.len() - self.written
    }

    fn copy(&mut self, src: &mut DataBuffer) -> usize {
        let n = src.remaining().min(self.available());
        self.buf[self.written..self.written + n].copy_from_slice(&src.as_slice()[..n]);
        self.written += n;
        src.advance(n);
        n
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if bytes.len() > self.available() {
            return Err(Error::BufferOverflow);
        }
        self.buf[self.written..self.written + bytes.len()].copy_from_slice(bytes);
        self.written += bytes.len();
        Ok(())
    }
}

/// Growable overflow sink.
///
/// Used when a sized frame does not fit the fixed scratch: the producer writes
/// here once, and the captured bytes drain through the normal block path.
#[derive(Default)]
pub struct DynamicOutBuffer {
    buf: BytesMut,
}

impl DynamicOutBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Freezes the accumulated bytes.
    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

impl DataOutBuffer for DynamicOutBuffer {
    fn available(&self) -> usize {
        usize::MAX
    }

    fn copy(&mut self, src: &mut DataBuffer) -> usize {
        let n = src.remaining();
        self.buf.extend_from_slice(src.as_slice());
        src.advance(n);
        n
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.buf.extend_from_slice(bytes);
        Ok(())
    }
}
