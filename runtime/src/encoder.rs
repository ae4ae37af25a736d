//! Composable output writers.
//!
//! An [`Encoder`] streams bytes into a [`DataOutBuffer`] and reports whether
//! anything remains. Most protocol frames know their serialized length
//! cheaply, so the sized variant writes directly into the socket-backed
//! scratch with zero allocation; frames larger than the scratch spill to a
//! heap buffer exactly once and drain from there.

use crate::{
    buffer::{DataBuffer, DataOutBuffer, DynamicOutBuffer},
    Error,
};
use std::collections::VecDeque;

/// Result of a single [`Encoder::write_into`] pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncodeStatus {
    /// No bytes remain to emit.
    Complete,
    /// The sink filled up before the encoder finished; call again with a
    /// fresh sink.
    Incomplete,
}

/// A producer that knows its frame size up front.
///
/// Invoked exactly once, either against the socket scratch (fast path) or
/// against a heap overflow buffer.
pub type SizedWrite = Box<dyn FnOnce(&mut dyn DataOutBuffer) -> Result<(), Error> + 'static>;

enum Kind {
    Block(DataBuffer),
    Sized { size: usize, write: SizedWrite },
    Multi(VecDeque<Encoder>),
    Done,
}

/// A streamable output frame.
pub struct Encoder {
    kind: Kind,
}

impl Encoder {
    /// An encoder over bytes that already exist.
    pub fn block(buf: impl Into<DataBuffer>) -> Self {
        Self {
            kind: Kind::Block(buf.into()),
        }
    }

    /// An encoder for a producer that will emit exactly `size` bytes.
    ///
    /// If the sink has room for the whole frame the producer runs against it
    /// directly; otherwise the producer runs once against a heap buffer and
    /// the captured bytes drain on subsequent calls.
    pub fn sized(
        size: usize,
        write: impl FnOnce(&mut dyn DataOutBuffer) -> Result<(), Error> + 'static,
    ) -> Self {
        Self {
            kind: Kind::Sized {
                size,
                write: Box::new(write),
            },
        }
    }

    /// An encoder over a sequence of encoders, emitted in order.
    pub fn multi(parts: impl IntoIterator<Item = Encoder>) -> Self {
        Self {
            kind: Kind::Multi(parts.into_iter().collect()),
        }
    }

    /// Total bytes remaining, when cheaply knowable.
    ///
    /// Sized producers report their declared size until they run.
    pub fn remaining_hint(&self) -> usize {
        match &self.kind {
            Kind::Block(buf) => buf.remaining(),
            Kind::Sized { size, .. } => *size,
            Kind::Multi(parts) => parts.iter().map(Encoder::remaining_hint).sum(),
            Kind::Done => 0,
        }
    }

    /// Streams as many bytes as fit into `out`.
    ///
    /// Once `Complete` has been returned, further calls are a programming
    /// error and fail with [`Error::EncoderComplete`].
    pub fn write_into(&mut self, out: &mut dyn DataOutBuffer) -> Result<EncodeStatus, Error> {
        match &mut self.kind {
            Kind::Block(buf) => {
                out.copy(buf);
                if buf.is_empty() {
                    self.kind = Kind::Done;
                    Ok(EncodeStatus::Complete)
                } else {
                    Ok(EncodeStatus::Incomplete)
                }
            }
            Kind::Sized { size, write } => {
                if out.available() >= *size {
                    let before = out.available();
                    let write = std::mem::replace(write, Box::new(|_| Ok(())));
                    write(out)?;
                    debug_assert_eq!(
                        before - out.available(),
                        *size,
                        "sized producer wrote a different length than declared"
                    );
                    self.kind = Kind::Done;
                    Ok(EncodeStatus::Complete)
                } else {
                    // Materialize the frame on the heap; it drains through the
                    // block path from here on.
                    let mut overflow = DynamicOutBuffer::with_capacity(*size);
                    let write = std::mem::replace(write, Box::new(|_| Ok(())));
                    write(&mut overflow)?;
                    self.kind = Kind::Block(DataBuffer::new(overflow.freeze()));
                    Ok(EncodeStatus::Incomplete)
                }
            }
            Kind::Multi(parts) => {
                while let Some(head) = parts.front_mut() {
                    match head.write_into(out)? {
                        EncodeStatus::Complete => {
                            parts.pop_front();
                        }
                        EncodeStatus::Incomplete => return Ok(EncodeStatus::Incomplete),
                    }
                }
                self.kind = Kind::Done;
                Ok(EncodeStatus::Complete)
            }
            Kind::Done => {
                debug_assert!(false, "write_into called on a complete encoder");
                Err(Error::EncoderComplete)
            }
        }
    }
}

impl std::fmt::Debug for Encoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            Kind::Block(buf) => f.debug_tuple("Block").field(&buf.remaining()).finish(),
            Kind::Sized { size, .. } => f.debug_tuple("Sized").field(size).finish(),
            Kind::Multi(parts) => f.debug_tuple("Multi").field(&parts.len()).finish(),
            Kind::Done => f.write_str("Done"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::FixedOutBuffer;
    use std::{cell::Cell, rc::Rc};

    fn drain(encoder: &mut Encoder, scratch_size: usize) -> Vec<u8> {
        let mut collected = Vec::new();
        loop {
            let mut scratch = vec![0u8; scratch_size];
            let mut out = FixedOutBuffer::new(&mut scratch);
            let status = encoder.write_into(&mut out).unwrap();
            collected.extend_from_slice(out.filled());
            if status == EncodeStatus::Complete {
                return collected;
            }
        }
    }

    #[test]
    fn test_block_spans_multiple_sinks() {
        let mut encoder = Encoder::block(&b"abcdefghij"[..]);
        assert_eq!(drain(&mut encoder, 4), b"abcdefghij");
    }

    #[test]
    fn test_sized_fast_path_single_call() {
        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        let mut encoder = Encoder::sized(5, move |out| {
            counter.set(counter.get() + 1);
            out.write(b"hello")
        });

        let mut scratch = [0u8; 16];
        let mut out = FixedOutBuffer::new(&mut scratch);
        assert_eq!(encoder.write_into(&mut out).unwrap(), EncodeStatus::Complete);
        assert_eq!(out.filled(), b"hello");
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_sized_overflow_invokes_producer_once() {
        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        let frame: Vec<u8> = (0..64u32 * 1024).map(|i| (i % 251) as u8).collect();
        let expected = frame.clone();
        let mut encoder = Encoder::sized(frame.len(), move |out| {
            counter.set(counter.get() + 1);
            out.write(&frame)
        });

        // First pass against an undersized sink materializes the overflow
        // without copying anything yet.
        let mut scratch = vec![0u8; 8 * 1024];
        let mut out = FixedOutBuffer::new(&mut scratch);
        assert_eq!(
            encoder.write_into(&mut out).unwrap(),
            EncodeStatus::Incomplete
        );
        assert_eq!(out.written(), 0);
        assert_eq!(calls.get(), 1);

        // Subsequent passes drain the captured frame without re-invoking the
        // producer.
        assert_eq!(drain(&mut encoder, 8 * 1024), expected);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_multi_preserves_cursor() {
        let mut encoder = Encoder::multi([
            Encoder::block(&b"one"[..]),
            Encoder::sized(3, |out| out.write(b"two")),
            Encoder::block(&b"three"[..]),
        ]);
        assert_eq!(drain(&mut encoder, 4), b"onetwothree");
    }

    #[test]
    fn test_write_after_complete_fails() {
        let mut encoder = Encoder::block(&b"x"[..]);
        let mut scratch = [0u8; 4];
        let mut out = FixedOutBuffer::new(&mut scratch);
        assert_eq!(encoder.write_into(&mut out).unwrap(), EncodeStatus::Complete);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut scratch = [0u8; 4];
            let mut out = FixedOutBuffer::new(&mut scratch);
            encoder.write_into(&mut out)
        }));
        // Release builds report the error; debug builds trip the assertion.
        if let Ok(result) = result {
            assert!(matches!(result, Err(Error::EncoderComplete)));
        }
    }
}
