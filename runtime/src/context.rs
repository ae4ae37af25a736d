//! Worker identities and worker-bound items.
//!
//! A [`Context`] binds a 64-bit id (unique for the life of the I/O system,
//! never reused) to its owning worker. Everything a worker owns (a
//! connection, a client, a task) is a [`WorkerItem`] addressed by that id.
//!
//! A `Context` is `!Send`: it carries worker-local state and is only ever
//! handed to code already running on its worker. The [`WorkerHandle`] inside
//! it is the `Send` half, a bounded command inbox plus a poll waker, and is
//! the only way other threads talk to the worker.

use crate::{
    actors::worker::Command,
    callback::{self, AsyncHandle, Completer},
    connection::ConnectionHandler,
    Error,
};
use crossbeam_queue::ArrayQueue;
use mio::Waker;
use std::{
    any::Any,
    cell::RefCell,
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    rc::Rc,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

/// Anything bound to a worker that receives worker events.
///
/// All hooks run on the owning worker's thread. Default implementations are
/// no-ops so items only handle the events they care about.
pub trait WorkerItem: 'static {
    /// Runs once when the item is registered with its worker.
    fn on_bind(&mut self, _ctx: &Context) {}

    /// Delivery of a message or an expired timer payload.
    fn on_message(&mut self, _ctx: &Context, _message: Box<dyn Any + Send>) {}

    /// Runs once when the item is removed from its worker.
    fn on_unbind(&mut self, _ctx: &Context) {}

    /// Graceful-shutdown notification; the item is unbound afterwards.
    fn on_shutdown(&mut self, _ctx: &Context) {}
}

/// `Send` handle to a worker: a bounded command inbox and a poll waker.
#[derive(Clone)]
pub struct WorkerHandle {
    index: usize,
    inbox: Arc<ArrayQueue<Command>>,
    waker: Arc<Waker>,
    ids: Arc<AtomicU64>,
}

impl WorkerHandle {
    pub(crate) fn new(
        index: usize,
        inbox: Arc<ArrayQueue<Command>>,
        waker: Arc<Waker>,
        ids: Arc<AtomicU64>,
    ) -> Self {
        Self {
            index,
            inbox,
            waker,
            ids,
        }
    }

    /// The worker's index within its system.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Enqueues a command and wakes the worker's poll loop.
    ///
    /// Fails with [`Error::MailboxFull`] when the bounded inbox is saturated.
    pub fn send(&self, command: Command) -> Result<(), Error> {
        self.try_send(command).map_err(|_| Error::MailboxFull)?;
        Ok(())
    }

    /// Like [`WorkerHandle::send`] but returns the command on a full inbox.
    pub fn try_send(&self, command: Command) -> Result<(), Command> {
        self.inbox.push(command)?;
        let _ = self.waker.wake();
        Ok(())
    }

    /// Reserves a fresh context id, unique within the I/O system.
    pub fn allocate_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn wake(&self) {
        let _ = self.waker.wake();
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

/// Identity of a [`WorkerItem`]: its id plus its owning worker.
#[derive(Clone)]
pub struct Context {
    id: u64,
    handle: WorkerHandle,
    local: Rc<WorkerLocal>,
}

impl Context {
    pub(crate) fn new(id: u64, handle: WorkerHandle, local: Rc<WorkerLocal>) -> Self {
        Self { id, handle, local }
    }

    /// The item's id, unique within the I/O system and never reused.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The `Send` handle to the owning worker.
    pub fn worker(&self) -> &WorkerHandle {
        &self.handle
    }

    /// Schedules `message` for delivery to this item's `on_message` hook
    /// after `delay`.
    pub fn schedule(&self, delay: Duration, message: Box<dyn Any + Send>) {
        self.local.defer(LocalAction::Schedule {
            target: self.id,
            delay,
            message,
        });
    }

    /// Schedules `message` for another item on the same worker.
    pub fn schedule_for(&self, target: u64, delay: Duration, message: Box<dyn Any + Send>) {
        self.local.defer(LocalAction::Schedule {
            target,
            delay,
            message,
        });
    }

    /// Delivers `message` to another item on the same worker on the next
    /// loop turn.
    pub fn send_to(&self, target: u64, message: Box<dyn Any + Send>) -> Result<(), Error> {
        self.handle.send(Command::Message {
            target,
            payload: message,
        })
    }

    /// Binds a new [`WorkerItem`] on this worker. Returns the new item's id;
    /// the bind itself happens later in the current loop turn.
    pub fn bind(
        &self,
        factory: impl FnOnce(Context) -> Box<dyn WorkerItem> + 'static,
    ) -> u64 {
        let id = self.handle.allocate_id();
        self.local.defer(LocalAction::Bind {
            id,
            kind: Box::new(move |ctx| BindKind::Item(factory(ctx))),
        });
        id
    }

    /// Binds a client connection on this worker and begins an outgoing
    /// connect. Returns the connection's id.
    pub fn connect(
        &self,
        addr: SocketAddr,
        factory: impl FnOnce(Context) -> Box<dyn ConnectionHandler> + 'static,
    ) -> u64 {
        let id = self.handle.allocate_id();
        self.local.defer(LocalAction::Bind {
            id,
            kind: Box::new(move |ctx| BindKind::Connect {
                addr,
                handler: factory(ctx),
            }),
        });
        id
    }

    /// Unbinds an item on this worker; connections are closed abruptly.
    pub fn unbind(&self, target: u64) {
        self.local.defer(LocalAction::Unbind { target });
    }

    /// Creates an async bridge owned by this item.
    ///
    /// The [`Completer`] may be handed to any thread; the returned
    /// [`AsyncHandle`] is consumed by [`crate::Callback::from_async`]. If
    /// this item unbinds before completion the resumption is discarded: a
    /// callback never executes after its owner is gone.
    pub fn bridge<T: Send + 'static>(&self) -> (AsyncHandle<T>, Completer<T>) {
        let bridge = self.local.bridges.borrow_mut().next_key();
        let (handle, completer, resume) =
            callback::bridge_parts(self.handle.clone(), self.id, bridge);
        self.local
            .bridges
            .borrow_mut()
            .insert(bridge, self.id, resume);
        (handle, completer)
    }

    pub(crate) fn local(&self) -> &Rc<WorkerLocal> {
        &self.local
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("worker", &self.handle.index())
            .finish()
    }
}

/// What a deferred local bind produces.
pub(crate) enum BindKind {
    Item(Box<dyn WorkerItem>),
    Connect {
        addr: SocketAddr,
        handler: Box<dyn ConnectionHandler>,
    },
}

/// Work queued by handler code for the worker to apply after the current
/// dispatch completes.
///
/// Handler code runs while the worker is inside its item table, so mutations
/// of that table (binds, unbinds) and anything needing the poll registry
/// (flushes) are staged here and drained at safe points in the loop turn.
pub(crate) enum LocalAction {
    Flush(u64),
    Bind {
        id: u64,
        kind: Box<dyn FnOnce(Context) -> BindKind>,
    },
    Unbind {
        target: u64,
    },
    Schedule {
        target: u64,
        delay: Duration,
        message: Box<dyn Any + Send>,
    },
}

/// Worker-local state shared between the loop and the contexts it hands out.
pub(crate) struct WorkerLocal {
    pub(crate) actions: RefCell<VecDeque<LocalAction>>,
    pub(crate) bridges: RefCell<BridgeRegistry>,
}

impl WorkerLocal {
    pub(crate) fn new() -> Rc<Self> {
        Rc::new(Self {
            actions: RefCell::new(VecDeque::new()),
            bridges: RefCell::new(BridgeRegistry::default()),
        })
    }

    pub(crate) fn defer(&self, action: LocalAction) {
        self.actions.borrow_mut().push_back(action);
    }
}

/// Pending async-bridge resumptions, keyed by bridge id.
///
/// Entries are owned by an item id; unbinding the owner drops its entries,
/// which fails their callbacks with [`Error::Closed`] without ever running
/// them against the departed item.
#[derive(Default)]
pub(crate) struct BridgeRegistry {
    next: u64,
    entries: HashMap<u64, BridgeEntry>,
}

struct BridgeEntry {
    owner: u64,
    resume: Box<dyn FnOnce()>,
}

impl BridgeRegistry {
    pub(crate) fn next_key(&mut self) -> u64 {
        self.next += 1;
        self.next
    }

    pub(crate) fn insert(&mut self, bridge: u64, owner: u64, resume: Box<dyn FnOnce()>) {
        self.entries.insert(bridge, BridgeEntry { owner, resume });
    }

    /// Removes and returns the resume closure if the entry is still live.
    pub(crate) fn take(&mut self, bridge: u64) -> Option<(u64, Box<dyn FnOnce()>)> {
        self.entries
            .remove(&bridge)
            .map(|entry| (entry.owner, entry.resume))
    }

    /// Drops every entry owned by `owner`.
    pub(crate) fn purge_owner(&mut self, owner: u64) {
        self.entries.retain(|_, entry| entry.owner != owner);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Callback;

    fn test_context() -> (Context, Arc<ArrayQueue<Command>>, mio::Poll) {
        let poll = mio::Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), mio::Token(0)).unwrap());
        let inbox = Arc::new(ArrayQueue::new(16));
        let handle = WorkerHandle::new(0, inbox.clone(), waker, Arc::new(AtomicU64::new(1)));
        let id = handle.allocate_id();
        (Context::new(id, handle, WorkerLocal::new()), inbox, poll)
    }

    #[test]
    fn test_bridge_completion_enqueues_command_and_resumes() {
        let (ctx, inbox, _poll) = test_context();
        let (handle, completer) = ctx.bridge::<u32>();
        assert_eq!(ctx.local().bridges.borrow().len(), 1);

        let seen = Rc::new(RefCell::new(None));
        let sink = seen.clone();
        Callback::from_async(handle).execute(move |result| *sink.borrow_mut() = Some(result));
        assert!(seen.borrow().is_none());

        completer.complete(Ok(7));
        let Some(Command::AsyncResult { owner, bridge }) = inbox.pop() else {
            panic!("expected an async result command");
        };
        assert_eq!(owner, ctx.id());

        // What the worker does on delivery: look up the entry and run it.
        let (entry_owner, resume) = ctx.local().bridges.borrow_mut().take(bridge).unwrap();
        assert_eq!(entry_owner, owner);
        resume();
        assert_eq!(*seen.borrow(), Some(Ok(7)));
    }

    #[test]
    fn test_purged_bridge_fails_without_running() {
        let (ctx, _inbox, _poll) = test_context();
        let (handle, completer) = ctx.bridge::<u32>();

        let seen = Rc::new(RefCell::new(None));
        let sink = seen.clone();
        Callback::from_async(handle).execute(move |result| *sink.borrow_mut() = Some(result));

        // Owner goes away before the result arrives: the pending resumption
        // is dropped and the chain fails without touching anything.
        ctx.local().bridges.borrow_mut().purge_owner(ctx.id());
        assert_eq!(ctx.local().bridges.borrow().len(), 0);
        assert!(matches!(*seen.borrow(), Some(Err(Error::Closed))));

        // A late completion only enqueues a command for a dead entry.
        completer.complete(Ok(1));
    }
}
