//! The reactor: one cooperative scheduling thread
//!
//! A `Reactor` is a cheap handle. Tasks, continuations and port listeners all
//! receive `&Reactor` and run one at a time; nothing here is `Send`.

use manifold_core::{ByteKey, ManifoldClass, ManifoldResult, NodeHandle, ReactorConfig};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::codec::Codec;
use crate::fabric::{Delivery, Envelope, Fabric, FabricEndpoint, IncomingMessage, OutgoingMessage};
use crate::queue::TaskQueue;
use crate::task::{TaskError, TaskHandle, TaskId, TaskListener, TaskState};

/// Type-erased port listener
trait NetListener {
    fn on_message(&mut self, envelope: Envelope, reactor: &Reactor);
}

struct TypedListener<T, L, C> {
    responder: L,
    codec: C,
    _marker: PhantomData<fn() -> T>,
}

impl<T, L, C> NetListener for TypedListener<T, L, C>
where
    L: TaskListener<IncomingMessage<T>>,
    C: Codec<T>,
{
    fn on_message(&mut self, envelope: Envelope, reactor: &Reactor) {
        match self.codec.decode(&envelope.payload) {
            Ok(payload) => self.responder.task_finished(
                IncomingMessage {
                    payload,
                    sender: envelope.sender,
                },
                reactor,
            ),
            Err(err) => self.responder.task_error(err, reactor),
        }
    }
}

struct ListenerSlot {
    id: u64,
    /// Taken out while the listener handles a message
    listener: Option<Box<dyn NetListener>>,
}

struct ReactorInner {
    node: NodeHandle,
    class: ManifoldClass,
    queue: RefCell<TaskQueue>,
    listeners: RefCell<HashMap<ByteKey, ListenerSlot>>,
    next_listener: Cell<u64>,
    fabric: Fabric,
    inbox: RefCell<mpsc::UnboundedReceiver<Delivery>>,
    shut_down: Cell<bool>,
    max_tasks_per_turn: usize,
}

impl Drop for ReactorInner {
    fn drop(&mut self) {
        self.fabric.leave(self.node);
    }
}

/// Handle to a single-threaded cooperative scheduler attached to a fabric.
#[derive(Clone)]
pub struct Reactor {
    inner: Rc<ReactorInner>,
}

impl Reactor {
    pub fn new(endpoint: FabricEndpoint) -> Self {
        Self::with_config(endpoint, &ReactorConfig::default())
    }

    pub fn with_config(endpoint: FabricEndpoint, config: &ReactorConfig) -> Self {
        let (node, fabric, inbox) = endpoint.into_parts();
        info!("Reactor started for {}", node);
        Self {
            inner: Rc::new(ReactorInner {
                node,
                class: ManifoldClass::Thread,
                queue: RefCell::new(TaskQueue::new()),
                listeners: RefCell::new(HashMap::new()),
                next_listener: Cell::new(0),
                fabric,
                inbox: RefCell::new(inbox),
                shut_down: Cell::new(false),
                max_tasks_per_turn: config.max_tasks_per_turn.max(1),
            }),
        }
    }

    /// Reactor on a fabric of its own.
    pub fn standalone(node: NodeHandle) -> ManifoldResult<Self> {
        let fabric = Fabric::new();
        Ok(Self::new(fabric.join(node)?))
    }

    pub fn node(&self) -> NodeHandle {
        self.inner.node
    }

    pub fn class(&self) -> ManifoldClass {
        self.inner.class
    }

    pub fn fabric(&self) -> &Fabric {
        &self.inner.fabric
    }

    // ---- Scheduling ----

    /// Queue a new task; it runs after every task already ready.
    pub fn enqueue<F>(&self, f: F) -> TaskId
    where
        F: FnOnce(&Reactor) + 'static,
    {
        self.inner.queue.borrow_mut().enqueue(Box::new(f))
    }

    /// Suspend the running task; `continuation` later receives `value`.
    pub fn yield_value<T, L>(&self, value: T, continuation: L)
    where
        T: 'static,
        L: TaskListener<T> + 'static,
    {
        self.inner.queue.borrow_mut().push_continuation(Box::new(move |reactor| {
            let mut continuation = continuation;
            continuation.task_finished(value, reactor)
        }));
    }

    /// Suspend the running task; `continuation` later receives `err` on its
    /// error path.
    pub fn yield_error<T, L>(&self, err: TaskError, continuation: L)
    where
        L: TaskListener<T> + 'static,
    {
        self.inner.queue.borrow_mut().push_continuation(Box::new(move |reactor| {
            let mut continuation = continuation;
            continuation.task_error(err, reactor)
        }));
    }

    pub fn defer<T, L>(&self, listener: L) -> TaskHandle<T>
    where
        T: 'static,
        L: TaskListener<T> + 'static,
    {
        self.inner.queue.borrow_mut().defer(listener)
    }

    /// Resume the continuation under `handle`. It runs after the current task
    /// returns, never from inside this call.
    pub fn complete<T: 'static>(&self, handle: TaskHandle<T>, value: T) -> ManifoldResult<()> {
        self.inner.queue.borrow_mut().complete(handle, value)
    }

    pub fn complete_raw(&self, id: u64, value: Result<Box<dyn Any>, TaskError>) -> ManifoldResult<()> {
        self.inner.queue.borrow_mut().complete_raw(id, value)
    }

    pub fn fail<T>(&self, handle: TaskHandle<T>, err: TaskError) -> ManifoldResult<()> {
        self.inner.queue.borrow_mut().fail(handle, err)
    }

    /// Keep the running task suspended until `handle` completes.
    pub fn suspend_on<T>(&self, handle: TaskHandle<T>) -> ManifoldResult<()> {
        self.inner.queue.borrow_mut().suspend_on(handle)
    }

    pub fn task_state(&self, task: TaskId) -> Option<TaskState> {
        self.inner.queue.borrow().task_state(task)
    }

    pub fn current_task(&self) -> Option<TaskId> {
        self.inner.queue.borrow().current()
    }

    pub fn pending_handles(&self) -> usize {
        self.inner.queue.borrow().pending_handles()
    }

    // ---- Network ----

    /// Encode `message` and hand it to the fabric. Undeliverable messages are
    /// logged and dropped.
    pub fn net_send<T, C>(&self, port: &ByteKey, message: OutgoingMessage<T>, codec: &C) -> ManifoldResult<()>
    where
        C: Codec<T>,
    {
        let payload = codec.encode(&message.payload)?;
        let envelope = Envelope {
            port: port.clone(),
            sender: self.inner.node,
            receiver: message.receiver,
            payload,
        };
        trace!("{} -> {} on port {}", self.inner.node, message.receiver, port);
        self.inner.fabric.send(envelope);
        Ok(())
    }

    /// Register `responder` for messages on `port`, replacing any listener
    /// already there.
    pub fn add_net_listener<T, L, C>(&self, port: ByteKey, responder: L, codec: C)
    where
        T: 'static,
        L: TaskListener<IncomingMessage<T>> + 'static,
        C: Codec<T> + 'static,
    {
        let id = self.inner.next_listener.get();
        self.inner.next_listener.set(id + 1);
        let listener: Box<dyn NetListener> = Box::new(TypedListener {
            responder,
            codec,
            _marker: PhantomData,
        });
        let previous = self.inner.listeners.borrow_mut().insert(
            port.clone(),
            ListenerSlot {
                id,
                listener: Some(listener),
            },
        );
        if previous.is_some() {
            debug!("Replaced listener on port {} of {}", port, self.inner.node);
        } else {
            debug!("Listening on port {} of {}", port, self.inner.node);
        }
    }

    pub fn remove_net_listener(&self, port: &ByteKey) -> bool {
        self.inner.listeners.borrow_mut().remove(port).is_some()
    }

    pub fn has_net_listener(&self, port: &ByteKey) -> bool {
        self.inner.listeners.borrow().contains_key(port)
    }

    fn dispatch(&self, envelope: Envelope) {
        let port = envelope.port.clone();
        let taken = {
            let mut listeners = self.inner.listeners.borrow_mut();
            listeners
                .get_mut(&port)
                .and_then(|slot| slot.listener.take().map(|l| (slot.id, l)))
        };
        let Some((id, mut listener)) = taken else {
            debug!("No listener on port {} of {}, dropping message from {}", port, self.inner.node, envelope.sender);
            return;
        };

        listener.on_message(envelope, self);

        // put it back unless it was removed or replaced meanwhile
        let mut listeners = self.inner.listeners.borrow_mut();
        if let Some(slot) = listeners.get_mut(&port) {
            if slot.id == id && slot.listener.is_none() {
                slot.listener = Some(listener);
            }
        }
    }

    // ---- Running ----

    /// Turn a delivery into work. Returns false once the node is told to stop.
    pub fn accept(&self, delivery: Delivery) -> bool {
        match delivery {
            Delivery::Message(envelope) => {
                self.enqueue(move |reactor| reactor.dispatch(envelope));
                true
            }
            Delivery::Shutdown => {
                info!("Reactor {} shutting down", self.inner.node);
                self.inner.shut_down.set(true);
                false
            }
        }
    }

    fn drain_inbox(&self) {
        loop {
            let next = self.inner.inbox.borrow_mut().try_recv();
            match next {
                Ok(delivery) => {
                    if !self.accept(delivery) {
                        break;
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.inner.shut_down.set(true);
                    break;
                }
            }
        }
    }

    /// Pull pending deliveries, then run one ready task. Returns false if
    /// nothing was ready.
    pub fn run_once(&self) -> bool {
        self.drain_inbox();
        let entry = self.inner.queue.borrow_mut().next_ready();
        let Some(entry) = entry else {
            return false;
        };
        (entry.job)(self);
        self.inner.queue.borrow_mut().finish_current();
        true
    }

    /// Run at most one turn's worth of tasks. Returns the number run.
    pub fn run_turn(&self) -> usize {
        let mut ran = 0;
        while ran < self.inner.max_tasks_per_turn && self.run_once() {
            ran += 1;
        }
        ran
    }

    /// Run until no task is ready and the inbox is empty.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while self.run_once() {
            ran += 1;
        }
        ran
    }

    /// Poll the inbox for the next delivery.
    pub fn poll_delivery(&self, cx: &mut Context<'_>) -> Poll<Option<Delivery>> {
        self.inner.inbox.borrow_mut().poll_recv(cx)
    }

    pub fn mark_shut_down(&self) {
        self.inner.shut_down.set(true);
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.get()
    }

    pub fn is_idle(&self) -> bool {
        self.inner.queue.borrow().is_idle()
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("node", &self.inner.node)
            .field("class", &self.inner.class)
            .finish()
    }
}
