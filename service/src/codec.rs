//! The codec contract: bytes to messages and back.

use colossus_runtime::{DataBuffer, Encoder, Error};

/// Result of a single decode pass over the visible bytes.
#[derive(Debug)]
pub enum Decoded<T> {
    /// Not enough bytes for a whole frame; try again after the next read.
    More,
    /// One frame, consumed from the front of the buffer.
    Frame(T),
}

/// A wire protocol: how frames become typed messages and back.
///
/// `decode` must be pure over the visible buffer: consume exactly the bytes
/// of the frame it returns and retain no references to buffer memory. On the
/// server, `Input` is the request and `Output` the response; a client uses
/// the symmetric codec (`Output` requests out, `Input` responses in).
///
/// Decode errors are unrecoverable at the transport level: the connection
/// closes. Handler failures, by contrast, pass through [`Codec::error_response`]
/// first, which may map them to an in-band output.
pub trait Codec: 'static {
    type Input: 'static;
    type Output: 'static;

    /// Decodes one frame from the front of `buf`, or reports `More`.
    fn decode(&mut self, buf: &mut DataBuffer) -> Result<Decoded<Self::Input>, Error>;

    /// Encodes one output into a streamable frame.
    fn encode(&mut self, output: Self::Output) -> Encoder;

    /// Maps a failed request to an in-band response. `None` closes the
    /// connection once every earlier response has been written.
    fn error_response(
        &mut self,
        _input: Option<&Self::Input>,
        _cause: &Error,
    ) -> Option<Self::Output> {
        None
    }
}
