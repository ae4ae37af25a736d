//! Worker-affine deferred values.
//!
//! A [`Callback`] is a one-shot deferred result that composes like a future
//! but never migrates threads: it is `!Send` by construction, and every
//! continuation runs synchronously on the worker that created it, in the
//! order the combinators were applied. This is what keeps per-connection
//! state lock-free: a callback chain can never observe its connection from
//! two threads.
//!
//! Results computed off the worker re-enter through the bridge
//! ([`crate::Context::bridge`]). The off-worker side holds a [`Completer`]
//! (which is `Send`) and never touches framework state: completion stores
//! the payload and enqueues a worker command, and the owning worker resumes
//! the chain on its next turn if the owning item is still bound.

use crate::{actors::worker::Command, context::WorkerHandle, Error};
use std::{
    cell::RefCell,
    mem,
    rc::Rc,
    sync::{Arc, Mutex},
};
use tracing::warn;

/// Terminal continuation invoked with the callback's single result.
type Terminal<T> = Box<dyn FnOnce(Result<T, Error>)>;

enum Kind<T> {
    Ready(Result<T, Error>),
    Deferred(Box<dyn FnOnce(Terminal<T>)>),
}

/// A one-shot, worker-affine deferred value.
pub struct Callback<T> {
    kind: Kind<T>,
}

impl<T: 'static> Callback<T> {
    /// A callback that is already complete with `value`.
    pub fn successful(value: T) -> Self {
        Self {
            kind: Kind::Ready(Ok(value)),
        }
    }

    /// A callback that is already failed with `error`.
    pub fn failed(error: Error) -> Self {
        Self {
            kind: Kind::Ready(Err(error)),
        }
    }

    /// A callback completed by a result imported from off the worker.
    pub fn from_async(handle: AsyncHandle<T>) -> Self {
        handle.callback
    }

    /// A callback plus the worker-local [`Resolver`] that completes it.
    ///
    /// The resolver delivers exactly one result: resolving after the callback
    /// was executed fires the continuation inline, resolving first stores the
    /// value until execution, and dropping the resolver fails the callback
    /// with [`Error::Closed`].
    pub fn promise() -> (Self, Resolver<T>) {
        let slot = Rc::new(RefCell::new(Promise::Empty));
        let install = slot.clone();
        let callback = Self {
            kind: Kind::Deferred(Box::new(move |k: Terminal<T>| {
                let state = mem::replace(&mut *install.borrow_mut(), Promise::Done);
                match state {
                    Promise::Empty => *install.borrow_mut() = Promise::Waiting(k),
                    Promise::Value(result) => k(result),
                    Promise::Waiting(_) | Promise::Done => {
                        debug_assert!(false, "callback executed twice")
                    }
                }
            })),
        };
        (callback, Resolver { slot: Some(slot) })
    }

    /// Transforms the success value.
    pub fn map<U: 'static>(self, f: impl FnOnce(T) -> U + 'static) -> Callback<U> {
        match self.kind {
            Kind::Ready(result) => Callback {
                kind: Kind::Ready(result.map(f)),
            },
            Kind::Deferred(run) => Callback {
                kind: Kind::Deferred(Box::new(move |k: Terminal<U>| {
                    run(Box::new(move |result| k(result.map(f))))
                })),
            },
        }
    }

    /// Transforms the success value with a fallible function.
    pub fn try_map<U: 'static>(
        self,
        f: impl FnOnce(T) -> Result<U, Error> + 'static,
    ) -> Callback<U> {
        match self.kind {
            Kind::Ready(result) => Callback {
                kind: Kind::Ready(result.and_then(f)),
            },
            Kind::Deferred(run) => Callback {
                kind: Kind::Deferred(Box::new(move |k: Terminal<U>| {
                    run(Box::new(move |result| k(result.and_then(f))))
                })),
            },
        }
    }

    /// Chains a dependent callback; the inner callback inherits the worker.
    pub fn and_then<U: 'static>(
        self,
        f: impl FnOnce(T) -> Callback<U> + 'static,
    ) -> Callback<U> {
        match self.kind {
            Kind::Ready(Ok(value)) => f(value),
            Kind::Ready(Err(error)) => Callback::failed(error),
            Kind::Deferred(run) => Callback {
                kind: Kind::Deferred(Box::new(move |k: Terminal<U>| {
                    run(Box::new(move |result| match result {
                        Ok(value) => f(value).run(k),
                        Err(error) => k(Err(error)),
                    }))
                })),
            },
        }
    }

    /// Transforms the failure value.
    pub fn map_err(self, f: impl FnOnce(Error) -> Error + 'static) -> Self {
        match self.kind {
            Kind::Ready(result) => Self {
                kind: Kind::Ready(result.map_err(f)),
            },
            Kind::Deferred(run) => Self {
                kind: Kind::Deferred(Box::new(move |k: Terminal<T>| {
                    run(Box::new(move |result| k(result.map_err(f))))
                })),
            },
        }
    }

    /// Salvages a failure into a success value.
    pub fn recover(self, f: impl FnOnce(Error) -> T + 'static) -> Self {
        match self.kind {
            Kind::Ready(result) => Self {
                kind: Kind::Ready(Ok(result.unwrap_or_else(f))),
            },
            Kind::Deferred(run) => Self {
                kind: Kind::Deferred(Box::new(move |k: Terminal<T>| {
                    run(Box::new(move |result| k(Ok(result.unwrap_or_else(f)))))
                })),
            },
        }
    }

    /// Attaches the terminal continuation.
    ///
    /// The continuation receives exactly one result, immediately for
    /// completed callbacks or whenever the deferred side resolves.
    pub fn execute(self, k: impl FnOnce(Result<T, Error>) + 'static) {
        self.run(Box::new(k));
    }

    fn run(self, k: Terminal<T>) {
        match self.kind {
            Kind::Ready(result) => k(result),
            Kind::Deferred(run) => run(k),
        }
    }
}

enum Promise<T> {
    Empty,
    Value(Result<T, Error>),
    Waiting(Terminal<T>),
    Done,
}

/// Worker-local completion side of [`Callback::promise`].
pub struct Resolver<T> {
    slot: Option<Rc<RefCell<Promise<T>>>>,
}

impl<T: 'static> Resolver<T> {
    /// Delivers the result, firing the continuation inline if the callback
    /// has already been executed.
    pub fn resolve(mut self, result: Result<T, Error>) {
        if let Some(slot) = self.slot.take() {
            Self::deliver(&slot, result);
        }
    }

    fn deliver(slot: &Rc<RefCell<Promise<T>>>, result: Result<T, Error>) {
        let state = mem::replace(&mut *slot.borrow_mut(), Promise::Done);
        match state {
            Promise::Empty => *slot.borrow_mut() = Promise::Value(result),
            Promise::Waiting(k) => k(result),
            Promise::Value(_) | Promise::Done => {
                debug_assert!(false, "promise resolved twice")
            }
        }
    }
}

impl<T> Drop for Resolver<T> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            let state = mem::replace(&mut *slot.borrow_mut(), Promise::Done);
            match state {
                Promise::Empty => *slot.borrow_mut() = Promise::Value(Err(Error::Closed)),
                Promise::Waiting(k) => k(Err(Error::Closed)),
                Promise::Value(_) | Promise::Done => {}
            }
        }
    }
}

/// Worker-side half of the async bridge; consume with [`Callback::from_async`].
pub struct AsyncHandle<T> {
    callback: Callback<T>,
}

/// Off-worker half of the async bridge.
///
/// `Send`: hand it to a thread, a pool, or any external completion source.
/// The completer never touches framework state; it stores the payload and
/// enqueues a command, and the owning worker imports the result on its next
/// turn.
/// Dropping an incomplete completer fails the callback with
/// [`Error::BridgeDropped`].
pub struct Completer<T> {
    payload: Arc<Mutex<Option<Result<T, Error>>>>,
    handle: WorkerHandle,
    owner: u64,
    bridge: u64,
    completed: bool,
}

impl<T: Send + 'static> Completer<T> {
    /// Delivers the off-worker result.
    pub fn complete(mut self, result: Result<T, Error>) {
        *self.payload.lock().unwrap() = Some(result);
        self.completed = true;
        self.notify();
    }

    fn notify(&self) {
        // The inbox is bounded; spin briefly rather than lose a resumption.
        // The worker drains continuously, so contention here is transient
        // unless the whole system is already gone.
        let mut command = Command::AsyncResult {
            owner: self.owner,
            bridge: self.bridge,
        };
        for _ in 0..1024 {
            match self.handle.try_send(command) {
                Ok(()) => return,
                Err(returned) => {
                    command = returned;
                    std::thread::yield_now();
                }
            }
        }
        warn!(owner = self.owner, "worker inbox saturated, dropping async result");
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if !self.completed {
            // Payload stays empty; the worker-side resume maps that to
            // BridgeDropped.
            self.completed = true;
            let command = Command::AsyncResult {
                owner: self.owner,
                bridge: self.bridge,
            };
            let _ = self.handle.try_send(command);
        }
    }
}

/// Builds the linked bridge triple: the worker-side handle, the `Send`
/// completer, and the resume closure the worker stores until delivery.
pub(crate) fn bridge_parts<T: Send + 'static>(
    handle: WorkerHandle,
    owner: u64,
    bridge: u64,
) -> (AsyncHandle<T>, Completer<T>, Box<dyn FnOnce()>) {
    let payload: Arc<Mutex<Option<Result<T, Error>>>> = Arc::new(Mutex::new(None));
    let (callback, resolver) = Callback::promise();
    let resume_payload = payload.clone();
    let resume = Box::new(move || {
        let result = resume_payload
            .lock()
            .unwrap()
            .take()
            .unwrap_or(Err(Error::BridgeDropped));
        resolver.resolve(result);
    });
    (
        AsyncHandle { callback },
        Completer {
            payload,
            handle,
            owner,
            bridge,
            completed: false,
        },
        resume,
    )
}
