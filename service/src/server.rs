//! The server-side service pipeline.
//!
//! Every decoded input is dispatched to the handler immediately, so many
//! callbacks can be outstanding on one connection. Each input carries its
//! arrival sequence number; completed callbacks land in a reorder buffer and
//! responses are written strictly in arrival order, stalling on gaps. The
//! wire never observes callback completion order.

use crate::codec::{Codec, Decoded};
use colossus_runtime::{
    Callback, ConnectionHandler, Context, DataBuffer, Encoder, Error, Initializer, WriteHandle,
};
use std::{
    cell::RefCell,
    collections::{BTreeMap, HashMap},
    marker::PhantomData,
    rc::Rc,
};
use tracing::debug;

/// The application half of a service: one entry point per decoded request.
pub trait RequestHandler<C: Codec>: 'static {
    /// Handles one request; the returned callback may complete inline or
    /// later (including through the async bridge).
    fn receive(&mut self, ctx: &Context, request: C::Input) -> Callback<C::Output>;

    /// The connection is gone; any outstanding callbacks resolve without
    /// observable effect.
    fn on_disconnect(&mut self, _reason: &Error) {}
}

impl<C, F> RequestHandler<C> for F
where
    C: Codec,
    F: FnMut(&Context, C::Input) -> Callback<C::Output> + 'static,
{
    fn receive(&mut self, ctx: &Context, request: C::Input) -> Callback<C::Output> {
        (self)(ctx, request)
    }
}

enum Outcome {
    Respond(Encoder),
    Close,
}

struct Shared<C: Codec> {
    codec: C,
    /// Next sequence number the wire is waiting for.
    next_write: u64,
    /// Completed callbacks not yet eligible to write.
    ready: BTreeMap<u64, Outcome>,
    /// Requests retained until completion for error mapping.
    inputs: HashMap<u64, C::Input>,
}

impl<C: Codec> Shared<C> {
    /// Records a completion and emits every response that is now in order.
    fn complete(&mut self, seq: u64, result: Result<C::Output, Error>, write: &WriteHandle) {
        let input = self.inputs.remove(&seq);
        let outcome = match result {
            Ok(output) => Outcome::Respond(self.codec.encode(output)),
            Err(cause) => match self.codec.error_response(input.as_ref(), &cause) {
                Some(output) => Outcome::Respond(self.codec.encode(output)),
                None => {
                    debug!(seq, error = %cause, "closing connection for unmapped failure");
                    Outcome::Close
                }
            },
        };
        self.ready.insert(seq, outcome);

        while let Some(outcome) = self.ready.remove(&self.next_write) {
            self.next_write += 1;
            match outcome {
                Outcome::Respond(encoder) => {
                    if write.write(encoder).is_err() {
                        return;
                    }
                }
                Outcome::Close => {
                    write.close();
                    return;
                }
            }
        }
    }
}

/// A [`ConnectionHandler`] that runs a codec/handler pair with pipelining.
pub struct Service<C: Codec, H: RequestHandler<C>> {
    shared: Rc<RefCell<Shared<C>>>,
    handler: H,
    next_seq: u64,
}

impl<C, H> Service<C, H>
where
    C: Codec,
    C::Input: Clone,
    H: RequestHandler<C>,
{
    pub fn new(codec: C, handler: H) -> Self {
        Self {
            shared: Rc::new(RefCell::new(Shared {
                codec,
                next_write: 0,
                ready: BTreeMap::new(),
                inputs: HashMap::new(),
            })),
            handler,
            next_seq: 0,
        }
    }
}

impl<C, H> ConnectionHandler for Service<C, H>
where
    C: Codec,
    C::Input: Clone,
    H: RequestHandler<C>,
{
    fn on_data(
        &mut self,
        ctx: &Context,
        buf: &mut DataBuffer,
        write: &WriteHandle,
    ) -> Result<(), Error> {
        loop {
            let decoded = self.shared.borrow_mut().codec.decode(buf)?;
            match decoded {
                Decoded::More => return Ok(()),
                Decoded::Frame(input) => {
                    let seq = self.next_seq;
                    self.next_seq += 1;
                    self.shared.borrow_mut().inputs.insert(seq, input.clone());

                    let callback = self.handler.receive(ctx, input);
                    let shared = self.shared.clone();
                    let write = write.clone();
                    callback.execute(move |result| {
                        shared.borrow_mut().complete(seq, result, &write);
                    });
                }
            }
        }
    }

    fn on_disconnect(&mut self, _ctx: &Context, reason: &Error) {
        self.handler.on_disconnect(reason);
    }
}

struct ServiceInitializer<C, H, MC, MH> {
    make_codec: MC,
    make_handler: MH,
    _marker: PhantomData<fn() -> (C, H)>,
}

impl<C, H, MC, MH> Initializer for ServiceInitializer<C, H, MC, MH>
where
    C: Codec,
    C::Input: Clone,
    H: RequestHandler<C>,
    MC: Fn() -> C + 'static,
    MH: Fn(&Context) -> H + 'static,
{
    fn on_connect(&mut self, ctx: &Context) -> Result<Box<dyn ConnectionHandler>, Error> {
        Ok(Box::new(Service::new(
            (self.make_codec)(),
            (self.make_handler)(ctx),
        )))
    }
}

/// Builds an [`colossus_runtime::InitializerFactory`] from a codec
/// constructor and a per-connection handler constructor.
pub fn factory<C, H, MC, MH>(
    make_codec: MC,
    make_handler: MH,
) -> impl colossus_runtime::InitializerFactory
where
    C: Codec,
    C::Input: Clone,
    H: RequestHandler<C>,
    MC: Fn() -> C + Send + Sync + Clone + 'static,
    MH: Fn(&Context) -> H + Send + Sync + Clone + 'static,
{
    move |_worker: &Context| -> Box<dyn Initializer> {
        Box::new(ServiceInitializer {
            make_codec: make_codec.clone(),
            make_handler: make_handler.clone(),
            _marker: PhantomData,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NumberCodec;

    impl Codec for NumberCodec {
        type Input = u8;
        type Output = u8;

        fn decode(&mut self, buf: &mut DataBuffer) -> Result<Decoded<u8>, Error> {
            if buf.is_empty() {
                return Ok(Decoded::More);
            }
            let byte = buf.take(1);
            Ok(Decoded::Frame(byte[0]))
        }

        fn encode(&mut self, output: u8) -> Encoder {
            Encoder::block(vec![output])
        }
    }

    #[test]
    fn test_reorder_buffer_emits_in_arrival_order() {
        let shared = Rc::new(RefCell::new(Shared {
            codec: NumberCodec,
            next_write: 0,
            ready: BTreeMap::new(),
            inputs: HashMap::new(),
        }));
        // A detached write handle observed through its depth: each in-order
        // completion appends one encoder.
        let write = colossus_runtime::mocks::write_handle();

        // Completion order 2, 0, 1: nothing may emit until 0 arrives.
        shared.borrow_mut().complete(2, Ok(2), &write);
        assert_eq!(write.depth(), 0);

        shared.borrow_mut().complete(0, Ok(0), &write);
        assert_eq!(write.depth(), 1);

        shared.borrow_mut().complete(1, Ok(1), &write);
        assert_eq!(write.depth(), 3);
        assert_eq!(shared.borrow().next_write, 3);
    }
}
