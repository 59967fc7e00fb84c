//! Owner-thread event queues.
//!
//! Handlers behind reflected channels are not `Send`; they live in a
//! thread-local table on the thread that created them. Driver calls made on
//! any other thread are packaged as a [`Message::Forward`], pushed onto the
//! owner's crossbeam queue, and answered through a oneshot once the owner
//! services its queue.
//!
//! ```text
//!   caller thread                 crossbeam              owner thread
//!   ┌──────────────────┐   Forward { op, reply }   ┌───────────────────────┐
//!   │ ReflectedChannel │ ───────────────────────▶  │ EventQueue::service() │
//!   │  .read()/.write()│                           │  handler.read(..)     │
//!   │                  │ ◀───────────────────────  │                       │
//!   └──────────────────┘        oneshot            └───────────────────────┘
//! ```
//!
//! Losing the owner is reported rather than hanging: requests still pending
//! when its queue is torn down, and any sent afterwards, fail with
//! `{Owner lost}`. A reply nobody waits for any more is discarded.
//! `{Channel thread lost}` is kept for the calling side, when a thread asks
//! for a queue it no longer has.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::rc::Rc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tokio::sync::oneshot;

use super::error::{ChanError, ChanResult};
use super::reflect::{self, Slot};
use super::EventMask;

/// A driver operation in flight.
#[derive(Debug)]
pub(crate) enum Op {
    Close,
    Read(usize),
    Write(Vec<u8>),
    Seek(SeekFrom),
    Watch(EventMask),
    Blocking(bool),
    Configure(String, String),
    Cget(String),
    CgetAll,
}

/// What an operation produced.
#[derive(Debug)]
pub(crate) enum Reply {
    Done,
    Data(Vec<u8>),
    Count(usize),
    Offset(u64),
    Options(Vec<(String, String)>),
}

pub(crate) enum Message {
    Forward {
        name: String,
        op: Op,
        reply: oneshot::Sender<ChanResult<Reply>>,
    },
    Event {
        name: String,
        events: EventMask,
    },
}

struct OwnerState {
    tx: Sender<Message>,
    rx: Receiver<Message>,
    slots: HashMap<String, Rc<Slot>>,
}

impl Drop for OwnerState {
    fn drop(&mut self) {
        let mut pending = 0;
        while let Ok(msg) = self.rx.try_recv() {
            if let Message::Forward { reply, .. } = msg {
                let _ = reply.send(Err(ChanError::OwnerLost));
                pending += 1;
            }
        }
        if pending > 0 {
            tracing::warn!("event queue torn down with {} pending requests", pending);
        }
    }
}

thread_local! {
    static OWNER: RefCell<Option<OwnerState>> = const { RefCell::new(None) };
}

/// Handle to one thread's queue. Cheap to clone and `Send`; only the owner
/// thread may service it.
#[derive(Clone)]
pub struct EventQueue {
    owner: ThreadId,
    tx: Sender<Message>,
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue")
            .field("owner", &self.owner)
            .field("pending", &self.tx.len())
            .finish()
    }
}

impl EventQueue {
    /// The calling thread's queue, created on first use.
    pub fn current() -> EventQueue {
        OWNER.with(|cell| {
            let mut cell = cell.borrow_mut();
            let state = cell.get_or_insert_with(|| {
                let (tx, rx) = crossbeam_channel::unbounded();
                OwnerState {
                    tx,
                    rx,
                    slots: HashMap::new(),
                }
            });
            EventQueue {
                owner: thread::current().id(),
                tx: state.tx.clone(),
            }
        })
    }

    /// The thread that services this queue.
    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    /// Whether the caller is the owner thread.
    pub fn is_owner_thread(&self) -> bool {
        thread::current().id() == self.owner
    }

    /// Number of queued messages.
    pub fn pending(&self) -> usize {
        self.tx.len()
    }

    pub(crate) fn sender(&self) -> Sender<Message> {
        self.tx.clone()
    }

    /// Queue read/write events for a channel owned by this queue. They are
    /// delivered the next time the owner services its queue.
    pub fn post(&self, name: &str, events: EventMask) -> ChanResult<()> {
        self.tx
            .send(Message::Event {
                name: name.to_string(),
                events,
            })
            .map_err(|_| ChanError::OwnerLost)
    }

    /// Run every queued message without blocking. Returns how many ran.
    pub fn service(&self) -> ChanResult<usize> {
        let rx = self.local_receiver()?;
        let mut count = 0;
        while let Ok(msg) = rx.try_recv() {
            handle(msg);
            count += 1;
        }
        Ok(count)
    }

    /// Service the queue until `done` returns true.
    pub fn run_until(&self, mut done: impl FnMut() -> bool) -> ChanResult<()> {
        let rx = self.local_receiver()?;
        while !done() {
            match rx.recv_timeout(Duration::from_millis(5)) {
                Ok(msg) => handle(msg),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Err(ChanError::ThreadLost),
            }
        }
        Ok(())
    }

    /// Tear down the owner's queue. Pending and later forwarded calls fail
    /// with `{Owner lost}`; every handler still registered here is dropped
    /// without finalize.
    pub fn shutdown(&self) -> ChanResult<()> {
        if !self.is_owner_thread() {
            return Err(ChanError::handler(
                "event queue can only be shut down by its owner thread",
            ));
        }
        let state = OWNER.with(|cell| cell.borrow_mut().take());
        if let Some(state) = &state {
            tracing::debug!("shutting down event queue with {} channels", state.slots.len());
        }
        drop(state);
        Ok(())
    }

    fn local_receiver(&self) -> ChanResult<Receiver<Message>> {
        if !self.is_owner_thread() {
            return Err(ChanError::handler(
                "event queue serviced outside its owner thread",
            ));
        }
        OWNER
            .with(|cell| cell.borrow().as_ref().map(|s| s.rx.clone()))
            .ok_or(ChanError::ThreadLost)
    }
}

fn handle(msg: Message) {
    match msg {
        Message::Forward { name, op, reply } => {
            tracing::trace!("forwarded {:?} for {}", op, name);
            let result = invoke_local(&name, op);
            if reply.send(result).is_err() {
                tracing::debug!("caller for {} went away, result discarded", name);
            }
        }
        Message::Event { name, events } => {
            if let Err(e) = reflect::post_event(&name, events) {
                tracing::warn!("dropping posted event for {}: {}", name, e);
            }
        }
    }
}

/// Run `op` against the handler registered on this thread under `name`.
pub(crate) fn invoke_local(name: &str, op: Op) -> ChanResult<Reply> {
    let slot = find_slot(name).ok_or(ChanError::OwnerLost)?;
    let closing = matches!(op, Op::Close);
    let result = reflect::perform(&slot, op);
    if closing {
        remove_slot(name);
    }
    result
}

pub(crate) fn install_slot(slot: Slot) -> ChanResult<()> {
    OWNER
        .try_with(|cell| {
            let mut cell = cell.borrow_mut();
            let state = cell.as_mut().ok_or(ChanError::ThreadLost)?;
            state.slots.insert(slot.name().to_string(), Rc::new(slot));
            Ok(())
        })
        .unwrap_or(Err(ChanError::ThreadLost))
}

pub(crate) fn find_slot(name: &str) -> Option<Rc<Slot>> {
    OWNER
        .try_with(|cell| {
            cell.borrow()
                .as_ref()
                .and_then(|state| state.slots.get(name).cloned())
        })
        .ok()
        .flatten()
}

fn remove_slot(name: &str) {
    let removed = OWNER
        .try_with(|cell| {
            cell.borrow_mut()
                .as_mut()
                .and_then(|state| state.slots.remove(name))
        })
        .ok()
        .flatten();
    drop(removed);
}
