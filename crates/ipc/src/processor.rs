//! Data and event processing core shared by [`Service`](crate::Service) and
//! [`Client`](crate::Client).
//!
//! One worker thread (the one behind the dispatcher driving the poll) owns
//! all framing, parsing and handler invocation. Any thread may register
//! handlers, start calls or emit signals; those operations briefly take the
//! state mutex, enqueue a request and arm the queue's eventfd, which the
//! worker observes through the poll.

use std::any::Any;
use std::collections::HashMap;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use crate::epoll::{EventPoll, Events};
use crate::error::IpcError;
use crate::latch::ValueLatch;
use crate::lock;
use crate::method_result::{MethodResult, MethodResultInner};
use crate::queue::RequestQueue;
use crate::socket::Socket;
use crate::types::{
    is_reserved, HandlerExitCode, MessageId, MethodId, PeerCallback, PeerId, ERROR_METHOD_ID,
    REGISTER_SIGNAL_METHOD_ID, RETURN_METHOD_ID,
};
use crate::wire::{self, WireRead, WireWrite};

/// Error-reply code reserved for protocol violations; everything else is a
/// handler-supplied user code.
pub(crate) const NAUGHTY_PEER_CODE: i32 = -1;
const INTERNAL_ERROR_CODE: i32 = -2;

#[derive(Serialize, Deserialize)]
struct MessageHeader {
    method_id: MethodId,
    message_id: MessageId,
}

#[derive(Serialize, Deserialize)]
struct RegisterSignals {
    ids: Vec<MethodId>,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct ErrorMessage {
    pub message_id: MessageId,
    pub code: i32,
    pub message: String,
}

pub(crate) type SerializeFn =
    Arc<dyn Fn(&mut dyn WireWrite, &dyn Any) -> Result<(), wire::Error> + Send + Sync>;
pub(crate) type ParseFn =
    Arc<dyn Fn(&mut dyn WireRead) -> Result<Box<dyn Any + Send>, wire::Error> + Send + Sync>;
pub(crate) type CompletionFn = Box<dyn FnOnce(ResultBuilder) + Send>;

pub(crate) fn make_serializer<T: Serialize + 'static>() -> SerializeFn {
    Arc::new(|out, data| {
        let Some(value) = data.downcast_ref::<T>() else {
            return Err(wire::Error::Message("payload type mismatch".to_string()));
        };
        wire::save(out, value)
    })
}

pub(crate) fn make_parser<T: DeserializeOwned + Send + 'static>() -> ParseFn {
    Arc::new(|input| {
        let data: Box<dyn Any + Send> = Box::new(wire::load::<T>(input)?);
        Ok(data)
    })
}

/// Outcome of a finished exchange, not yet narrowed to its concrete type.
pub(crate) struct ResultBuilder {
    outcome: Result<Box<dyn Any + Send>, IpcError>,
}

impl ResultBuilder {
    pub(crate) fn from_data(data: Box<dyn Any + Send>) -> Self {
        ResultBuilder { outcome: Ok(data) }
    }

    pub(crate) fn from_error(error: IpcError) -> Self {
        ResultBuilder {
            outcome: Err(error),
        }
    }

    pub(crate) fn build<T: 'static>(self) -> Result<T, IpcError> {
        match self.outcome {
            Ok(data) => data
                .downcast::<T>()
                .map(|boxed| *boxed)
                .map_err(|_| IpcError::Parse("unexpected payload type".to_string())),
            Err(error) => Err(error),
        }
    }
}

type MethodDispatchFn = Arc<
    dyn Fn(PeerId, Box<dyn Any + Send>, Arc<MethodResultInner>) -> Result<HandlerExitCode, IpcError>
        + Send
        + Sync,
>;
type SignalDispatchFn =
    Arc<dyn Fn(PeerId, Box<dyn Any + Send>) -> Result<HandlerExitCode, IpcError> + Send + Sync>;

struct MethodHandlers {
    parse: ParseFn,
    dispatch: MethodDispatchFn,
}

struct SignalHandlers {
    parse: ParseFn,
    dispatch: SignalDispatchFn,
}

struct PendingCall {
    peer_id: PeerId,
    parse: ParseFn,
    process: CompletionFn,
}

pub(crate) struct MethodCall {
    pub method_id: MethodId,
    pub peer_id: PeerId,
    pub message_id: MessageId,
    pub data: Box<dyn Any + Send>,
    pub serialize: SerializeFn,
    pub parse: ParseFn,
    pub process: CompletionFn,
}

pub(crate) struct SignalCall {
    pub method_id: MethodId,
    pub peer_id: PeerId,
    pub message_id: MessageId,
    pub data: Arc<dyn Any + Send + Sync>,
    pub serialize: SerializeFn,
}

pub(crate) enum Request {
    Finish,
    Method(MethodCall),
    Signal(SignalCall),
    AddPeer { peer_id: PeerId, socket: Arc<Socket> },
    RemovePeer { peer_id: PeerId },
    SendResult {
        method_id: MethodId,
        peer_id: PeerId,
        message_id: MessageId,
        data: Box<dyn Any + Send>,
        serialize: SerializeFn,
    },
    RemoveMethod { method_id: MethodId },
}

struct PeerSlot {
    peer_id: PeerId,
    socket: Arc<Socket>,
}

struct State {
    is_running: bool,
    peers: Vec<PeerSlot>,
    methods: HashMap<MethodId, Arc<MethodHandlers>>,
    signals: HashMap<MethodId, Arc<SignalHandlers>>,
    signal_peers: HashMap<MethodId, Vec<PeerId>>,
    pending: HashMap<MessageId, PendingCall>,
    new_peer_callback: Option<Arc<PeerCallback>>,
    removed_peer_callback: Option<Arc<PeerCallback>>,
}

pub(crate) struct Core {
    log_name: &'static str,
    poll: EventPoll,
    queue: Arc<RequestQueue<Request>>,
    state: Mutex<State>,
    state_changed: Condvar,
    max_peers: usize,
}

/// Cheap handle to the processing core; all clones drive the same state.
#[derive(Clone)]
pub(crate) struct Processor {
    core: Arc<Core>,
}

/// Non-owning handle for poll callbacks, so the poll's callback table never
/// keeps the core alive.
#[derive(Clone)]
pub(crate) struct WeakProcessor {
    core: Weak<Core>,
}

impl WeakProcessor {
    pub fn upgrade(&self) -> Option<Processor> {
        self.core.upgrade().map(|core| Processor { core })
    }
}

impl Processor {
    pub fn new(
        poll: &EventPoll,
        log_name: &'static str,
        max_peers: usize,
    ) -> Result<Self, IpcError> {
        Ok(Processor {
            core: Arc::new(Core {
                log_name,
                poll: poll.clone(),
                queue: Arc::new(RequestQueue::new()?),
                state: Mutex::new(State {
                    is_running: false,
                    peers: Vec::new(),
                    methods: HashMap::new(),
                    signals: HashMap::new(),
                    signal_peers: HashMap::new(),
                    pending: HashMap::new(),
                    new_peer_callback: None,
                    removed_peer_callback: None,
                }),
                state_changed: Condvar::new(),
                max_peers,
            }),
        })
    }

    pub fn downgrade(&self) -> WeakProcessor {
        WeakProcessor {
            core: Arc::downgrade(&self.core),
        }
    }

    pub fn is_started(&self) -> bool {
        lock(&self.core.state).is_running
    }

    /// Registers the queue's eventfd with the poll and starts accepting work.
    /// Repeated starts are no-ops.
    pub fn start(&self) -> Result<(), IpcError> {
        let mut state = lock(&self.core.state);
        if state.is_running {
            return Ok(());
        }
        let weak = self.downgrade();
        self.core
            .poll
            .add_fd(self.core.queue.event_fd(), Events::EPOLLIN, move |_, _| {
                if let Some(processor) = weak.upgrade() {
                    processor.core.handle_event();
                }
            })?;
        state.is_running = true;
        debug!(name = self.core.log_name, "processor started");
        Ok(())
    }

    /// Injects a `Finish` request. With `wait` the call blocks until the
    /// worker has dropped every peer and deregistered itself. Repeated stops
    /// are no-ops.
    pub fn stop(&self, wait: bool) {
        {
            let state = lock(&self.core.state);
            if !state.is_running {
                return;
            }
        }
        debug!(name = self.core.log_name, wait, "processor stopping");
        self.core.queue.push_back(Request::Finish);
        if wait {
            let mut state = lock(&self.core.state);
            while state.is_running {
                state = self
                    .core
                    .state_changed
                    .wait(state)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
            }
        }
    }

    pub fn set_new_peer_callback(&self, callback: Option<Arc<PeerCallback>>) {
        lock(&self.core.state).new_peer_callback = callback;
    }

    pub fn set_removed_peer_callback(&self, callback: Option<Arc<PeerCallback>>) {
        lock(&self.core.state).removed_peer_callback = callback;
    }

    /// Takes ownership of the socket and schedules the peer's admission. The
    /// returned id refers to the peer from now on, even though the worker has
    /// not met it yet.
    pub fn add_peer(&self, socket: Socket) -> Result<PeerId, IpcError> {
        let peer_id = PeerId::generate();
        debug!(name = self.core.log_name, %peer_id, fd = socket.as_raw_fd(), "adding peer");
        self.core.queue.push_back(Request::AddPeer {
            peer_id,
            socket: Arc::new(socket),
        });
        Ok(peer_id)
    }

    pub fn set_method_handler<In, Out, F>(
        &self,
        method_id: MethodId,
        handler: F,
    ) -> Result<(), IpcError>
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(PeerId, In, MethodResult<Out>) -> Result<HandlerExitCode, IpcError>
            + Send
            + Sync
            + 'static,
    {
        if is_reserved(method_id) {
            return Err(IpcError::Configuration(format!(
                "method id {method_id} is reserved"
            )));
        }
        let mut state = lock(&self.core.state);
        if state.signals.contains_key(&method_id) {
            return Err(IpcError::Configuration(format!(
                "method id {method_id} is used by a signal handler"
            )));
        }
        let dispatch: MethodDispatchFn = Arc::new(move |peer_id, data, inner| {
            let data = data
                .downcast::<In>()
                .map_err(|_| IpcError::Parse("unexpected payload type".to_string()))?;
            handler(peer_id, *data, MethodResult::from_inner(inner))
        });
        state.methods.insert(
            method_id,
            Arc::new(MethodHandlers {
                parse: make_parser::<In>(),
                dispatch,
            }),
        );
        Ok(())
    }

    /// Installs a signal handler and announces the subscription to every
    /// connected peer.
    pub fn set_signal_handler<In, F>(&self, method_id: MethodId, handler: F) -> Result<(), IpcError>
    where
        In: DeserializeOwned + Send + 'static,
        F: Fn(PeerId, In) -> Result<HandlerExitCode, IpcError> + Send + Sync + 'static,
    {
        if is_reserved(method_id) {
            return Err(IpcError::Configuration(format!(
                "method id {method_id} is reserved"
            )));
        }
        let mut state = lock(&self.core.state);
        if state.methods.contains_key(&method_id) {
            return Err(IpcError::Configuration(format!(
                "method id {method_id} is used by a method handler"
            )));
        }
        let dispatch: SignalDispatchFn = Arc::new(move |peer_id, data| {
            let data = data
                .downcast::<In>()
                .map_err(|_| IpcError::Parse("unexpected payload type".to_string()))?;
            handler(peer_id, *data)
        });
        state.signals.insert(
            method_id,
            Arc::new(SignalHandlers {
                parse: make_parser::<In>(),
                dispatch,
            }),
        );

        let announcement: Arc<dyn Any + Send + Sync> = Arc::new(RegisterSignals {
            ids: vec![method_id],
        });
        for peer in &state.peers {
            self.core.queue.push_front(Request::Signal(SignalCall {
                method_id: REGISTER_SIGNAL_METHOD_ID,
                peer_id: peer.peer_id,
                message_id: MessageId::generate(),
                data: Arc::clone(&announcement),
                serialize: make_serializer::<RegisterSignals>(),
            }));
        }
        Ok(())
    }

    /// Schedules removal of whatever handler occupies `method_id`. A second
    /// removal of the same id is a no-op.
    pub fn remove_method(&self, method_id: MethodId) {
        // TODO: emit an unregister message so peers can drop their stale
        // subscription entries instead of discovering the gap on next use.
        self.core.queue.push_back(Request::RemoveMethod { method_id });
    }

    pub fn is_handled(&self, method_id: MethodId) -> bool {
        let state = lock(&self.core.state);
        state.methods.contains_key(&method_id) || state.signals.contains_key(&method_id)
    }

    pub fn call_async<In, Out, F>(
        &self,
        method_id: MethodId,
        peer_id: PeerId,
        data: In,
        process: F,
    ) -> Result<MessageId, IpcError>
    where
        In: Serialize + Send + 'static,
        Out: DeserializeOwned + Send + 'static,
        F: FnOnce(Result<Out, IpcError>) + Send + 'static,
    {
        let state = lock(&self.core.state);
        if !state.is_running {
            return Err(IpcError::Closing);
        }
        self.enqueue_call(method_id, peer_id, data, process)
    }

    /// Same as [`Processor::call_async`] but safe to use from completion
    /// callbacks and handlers running on the worker.
    pub fn call_async_from_callback<In, Out, F>(
        &self,
        method_id: MethodId,
        peer_id: PeerId,
        data: In,
        process: F,
    ) -> Result<MessageId, IpcError>
    where
        In: Serialize + Send + 'static,
        Out: DeserializeOwned + Send + 'static,
        F: FnOnce(Result<Out, IpcError>) + Send + 'static,
    {
        if !self.is_started() {
            return Err(IpcError::Closing);
        }
        self.enqueue_call(method_id, peer_id, data, process)
    }

    fn enqueue_call<In, Out, F>(
        &self,
        method_id: MethodId,
        peer_id: PeerId,
        data: In,
        process: F,
    ) -> Result<MessageId, IpcError>
    where
        In: Serialize + Send + 'static,
        Out: DeserializeOwned + Send + 'static,
        F: FnOnce(Result<Out, IpcError>) + Send + 'static,
    {
        let message_id = MessageId::generate();
        let completion: CompletionFn = Box::new(move |builder| process(builder.build::<Out>()));
        self.core.queue.push_back(Request::Method(MethodCall {
            method_id,
            peer_id,
            message_id,
            data: Box::new(data),
            serialize: make_serializer::<In>(),
            parse: make_parser::<Out>(),
            process: completion,
        }));
        Ok(message_id)
    }

    /// Synchronous call: an asynchronous call plus a latch wait.
    ///
    /// When the deadline passes the request is cancelled, from the queue if
    /// it was never sent, else from the pending table. A successful cancel
    /// removes the unresponsive peer and reports a timeout; if the reply is
    /// already being processed the wait is repeated once before giving up.
    pub fn call_sync<In, Out>(
        &self,
        method_id: MethodId,
        peer_id: PeerId,
        data: In,
        timeout: Duration,
    ) -> Result<Out, IpcError>
    where
        In: Serialize + Send + 'static,
        Out: DeserializeOwned + Send + 'static,
    {
        if !self.is_started() {
            return Err(IpcError::Closing);
        }

        let latch: Arc<ValueLatch<Result<Out, IpcError>>> = Arc::new(ValueLatch::new());
        let fulfil = Arc::clone(&latch);
        let message_id = self.call_async_from_callback::<In, Out, _>(
            method_id,
            peer_id,
            data,
            move |outcome| fulfil.set(outcome),
        )?;

        trace!(name = self.core.log_name, %message_id, "waiting for the response");
        if let Some(outcome) = latch.get_timeout(timeout) {
            return outcome;
        }

        warn!(
            name = self.core.log_name,
            method_id, "no response in time, attempting to cancel"
        );
        let cancelled = {
            let mut state = lock(&self.core.state);
            let still_queued = self
                .core
                .queue
                .remove_if(|request| {
                    matches!(request, Request::Method(call) if call.message_id == message_id)
                })
                .is_some();
            still_queued || state.pending.remove(&message_id).is_some()
        };

        if cancelled {
            error!(name = self.core.log_name, method_id, "function call timeout");
            self.remove_peer_sync(peer_id);
            return Err(IpcError::Timeout { method: method_id });
        }

        // The reply raced the deadline and is being processed right now;
        // grant it one more full timeout to land.
        warn!(
            name = self.core.log_name,
            method_id, "timeout hit during reply processing, waiting again"
        );
        match latch.get_timeout(timeout) {
            Some(outcome) => outcome,
            None => {
                error!(name = self.core.log_name, method_id, "function call timeout");
                Err(IpcError::Timeout { method: method_id })
            }
        }
    }

    /// Emits a signal to every peer subscribed to `method_id`. Without
    /// subscribers this is a logged no-op.
    pub fn signal<In>(&self, method_id: MethodId, data: In) -> Result<(), IpcError>
    where
        In: Serialize + Send + Sync + 'static,
    {
        let state = lock(&self.core.state);
        let Some(subscribers) = state.signal_peers.get(&method_id) else {
            warn!(
                name = self.core.log_name,
                method_id, "no peer is handling the signal"
            );
            return Ok(());
        };
        let data: Arc<dyn Any + Send + Sync> = Arc::new(data);
        let serialize = make_serializer::<In>();
        for peer_id in subscribers {
            self.core.queue.push_back(Request::Signal(SignalCall {
                method_id,
                peer_id: *peer_id,
                message_id: MessageId::generate(),
                data: Arc::clone(&data),
                serialize: Arc::clone(&serialize),
            }));
        }
        Ok(())
    }

    /// Poll callback entry point for a peer descriptor.
    pub fn handle(&self, fd: RawFd, events: Events) {
        if !self.is_started() {
            warn!(name = self.core.log_name, fd, "input while stopped");
            return;
        }
        if events.contains(Events::EPOLLIN) {
            self.core.handle_input(fd);
            return; // input handling notices RDHUP by itself
        }
        if events.intersects(Events::EPOLLHUP | Events::EPOLLRDHUP) {
            self.core.handle_lost_connection(fd);
        }
    }

    fn remove_peer_sync(&self, peer_id: PeerId) {
        self.core.queue.push_back(Request::RemovePeer { peer_id });
        let mut state = lock(&self.core.state);
        while state.is_running && state.peers.iter().any(|peer| peer.peer_id == peer_id) {
            state = self
                .core
                .state_changed
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

}

impl Core {
    fn handle_event(&self) {
        self.queue.acknowledge();
        let Some(request) = self.queue.try_pop() else {
            // A cancelled entry left its wakeup behind.
            return;
        };
        match request {
            Request::Finish => self.on_finish(),
            Request::Method(call) => self.on_method_request(call),
            Request::Signal(call) => self.on_signal_request(call),
            Request::AddPeer { peer_id, socket } => self.on_add_peer(peer_id, socket),
            Request::RemovePeer { peer_id } => {
                self.remove_peer_internal(peer_id, &|| IpcError::PeerDisconnected);
            }
            Request::SendResult {
                method_id,
                peer_id,
                message_id,
                data,
                serialize,
            } => self.on_send_result(method_id, peer_id, message_id, data, serialize),
            Request::RemoveMethod { method_id } => self.on_remove_method(method_id),
        }
    }

    fn on_add_peer(&self, peer_id: PeerId, socket: Arc<Socket>) {
        let fd = socket.as_raw_fd();
        let callback = {
            let mut state = lock(&self.state);
            if state.peers.len() >= self.max_peers {
                warn!(
                    name = self.log_name,
                    %peer_id,
                    limit = self.max_peers,
                    "rejecting connection, peer limit reached"
                );
                return; // dropping the last reference closes the socket
            }
            state.peers.push(PeerSlot {
                peer_id,
                socket: Arc::clone(&socket),
            });

            // Replay the locally registered signal set so the newcomer knows
            // what we are interested in.
            let ids: Vec<MethodId> = state.signals.keys().copied().collect();
            if !ids.is_empty() {
                self.queue.push_front(Request::Signal(SignalCall {
                    method_id: REGISTER_SIGNAL_METHOD_ID,
                    peer_id,
                    message_id: MessageId::generate(),
                    data: Arc::new(RegisterSignals { ids }),
                    serialize: make_serializer::<RegisterSignals>(),
                }));
            }
            state.new_peer_callback.clone()
        };

        debug!(name = self.log_name, %peer_id, fd, "peer joined");
        if let Some(callback) = callback {
            callback(peer_id, fd);
        }
        self.state_changed.notify_all();
    }

    fn remove_peer_internal(&self, peer_id: PeerId, make_error: &dyn Fn() -> IpcError) {
        let (socket, callback, cancelled) = {
            let mut state = lock(&self.state);
            let Some(index) = state.peers.iter().position(|peer| peer.peer_id == peer_id) else {
                self.state_changed.notify_all();
                return;
            };
            let slot = state.peers.remove(index);

            for subscribers in state.signal_peers.values_mut() {
                subscribers.retain(|subscriber| *subscriber != peer_id);
            }
            state.signal_peers.retain(|_, subscribers| !subscribers.is_empty());

            let stale: Vec<MessageId> = state
                .pending
                .iter()
                .filter(|(_, call)| call.peer_id == peer_id)
                .map(|(message_id, _)| *message_id)
                .collect();
            let cancelled: Vec<PendingCall> = stale
                .into_iter()
                .filter_map(|message_id| state.pending.remove(&message_id))
                .collect();

            (slot.socket, state.removed_peer_callback.clone(), cancelled)
        };

        let fd = socket.as_raw_fd();
        debug!(name = self.log_name, %peer_id, fd, "peer removed");
        if let Some(callback) = callback {
            callback(peer_id, fd);
        }
        drop(socket);

        for call in cancelled {
            (call.process)(ResultBuilder::from_error(make_error()));
        }
        self.state_changed.notify_all();
    }

    fn peer_by_fd(&self, fd: RawFd) -> Option<(PeerId, Arc<Socket>)> {
        let state = lock(&self.state);
        state
            .peers
            .iter()
            .find(|peer| peer.socket.as_raw_fd() == fd)
            .map(|peer| (peer.peer_id, Arc::clone(&peer.socket)))
    }

    fn socket_for(&self, peer_id: PeerId) -> Option<Arc<Socket>> {
        let state = lock(&self.state);
        state
            .peers
            .iter()
            .find(|peer| peer.peer_id == peer_id)
            .map(|peer| Arc::clone(&peer.socket))
    }

    fn handle_lost_connection(&self, fd: RawFd) {
        let Some((peer_id, _socket)) = self.peer_by_fd(fd) else {
            trace!(name = self.log_name, fd, "hangup from an unknown descriptor");
            return;
        };
        self.remove_peer_internal(peer_id, &|| IpcError::PeerDisconnected);
    }

    fn handle_input(&self, fd: RawFd) {
        let Some((peer_id, socket)) = self.peer_by_fd(fd) else {
            trace!(name = self.log_name, fd, "input from an unknown descriptor");
            return;
        };

        let mut io = socket.lock();
        let header: MessageHeader = match wire::load(&mut io) {
            Ok(header) => header,
            Err(error) => {
                if !error.is_disconnection() {
                    warn!(name = self.log_name, %peer_id, %error, "broken frame header");
                }
                drop(io);
                self.remove_peer_internal(peer_id, &|| IpcError::PeerDisconnected);
                return;
            }
        };
        trace!(
            name = self.log_name,
            %peer_id,
            method_id = header.method_id,
            message_id = %header.message_id,
            "frame received"
        );

        match header.method_id {
            RETURN_METHOD_ID => self.on_return_value(io, peer_id, header.message_id),
            ERROR_METHOD_ID => self.on_error_message(io, peer_id),
            REGISTER_SIGNAL_METHOD_ID => self.on_register_signals(io, peer_id),
            method_id => {
                let (method, signal) = {
                    let state = lock(&self.state);
                    (
                        state.methods.get(&method_id).cloned(),
                        state.signals.get(&method_id).cloned(),
                    )
                };
                if let Some(handler) = method {
                    self.on_remote_method(io, peer_id, method_id, header.message_id, handler);
                } else if let Some(handler) = signal {
                    self.on_remote_signal(io, peer_id, method_id, handler);
                } else {
                    drop(io);
                    warn!(
                        name = self.log_name,
                        %peer_id,
                        method_id,
                        "frame for an unregistered selector"
                    );
                    self.answer_naughty_peer(&socket, peer_id, header.message_id);
                }
            }
        }
    }

    fn on_return_value(
        &self,
        mut io: crate::socket::SocketIo<'_>,
        peer_id: PeerId,
        message_id: MessageId,
    ) {
        let pending = lock(&self.state).pending.remove(&message_id);
        let Some(pending) = pending else {
            drop(io);
            warn!(
                name = self.log_name,
                %peer_id,
                %message_id,
                "return value for an unknown call"
            );
            self.remove_peer_internal(peer_id, &|| IpcError::NaughtyPeer);
            return;
        };

        let parsed = (pending.parse)(&mut io);
        drop(io);
        match parsed {
            Ok(data) => (pending.process)(ResultBuilder::from_data(data)),
            Err(error) => {
                warn!(name = self.log_name, %peer_id, %error, "broken return payload");
                let message = error.to_string();
                (pending.process)(ResultBuilder::from_error(IpcError::Parse(message.clone())));
                self.remove_peer_internal(peer_id, &|| IpcError::Parse(message.clone()));
            }
        }
    }

    fn on_error_message(&self, mut io: crate::socket::SocketIo<'_>, peer_id: PeerId) {
        let parsed: Result<ErrorMessage, _> = wire::load(&mut io);
        drop(io);
        match parsed {
            Ok(reply) => {
                let pending = lock(&self.state).pending.remove(&reply.message_id);
                let error = if reply.code == NAUGHTY_PEER_CODE {
                    IpcError::NaughtyPeer
                } else {
                    IpcError::User {
                        code: reply.code,
                        message: reply.message,
                    }
                };
                match pending {
                    Some(call) => (call.process)(ResultBuilder::from_error(error)),
                    None => warn!(
                        name = self.log_name,
                        %peer_id,
                        message_id = %reply.message_id,
                        "error reply for an unknown call"
                    ),
                }
            }
            Err(error) => {
                warn!(name = self.log_name, %peer_id, %error, "broken error payload");
                let message = error.to_string();
                self.remove_peer_internal(peer_id, &|| IpcError::Parse(message.clone()));
            }
        }
    }

    fn on_register_signals(&self, mut io: crate::socket::SocketIo<'_>, peer_id: PeerId) {
        let parsed: Result<RegisterSignals, _> = wire::load(&mut io);
        drop(io);
        match parsed {
            Ok(announcement) => {
                let mut state = lock(&self.state);
                for method_id in announcement.ids {
                    debug!(
                        name = self.log_name,
                        %peer_id,
                        method_id,
                        "peer subscribed to a signal"
                    );
                    state.signal_peers.entry(method_id).or_default().push(peer_id);
                }
            }
            Err(error) => {
                warn!(name = self.log_name, %peer_id, %error, "broken signal registration");
                let message = error.to_string();
                self.remove_peer_internal(peer_id, &|| IpcError::Parse(message.clone()));
            }
        }
    }

    fn on_remote_method(
        &self,
        mut io: crate::socket::SocketIo<'_>,
        peer_id: PeerId,
        method_id: MethodId,
        message_id: MessageId,
        handler: Arc<MethodHandlers>,
    ) {
        let parsed = (handler.parse)(&mut io);
        drop(io);
        let data = match parsed {
            Ok(data) => data,
            Err(error) => {
                warn!(name = self.log_name, %peer_id, method_id, %error, "broken method payload");
                let message = error.to_string();
                self.remove_peer_internal(peer_id, &|| IpcError::Parse(message.clone()));
                return;
            }
        };

        let inner = Arc::new(MethodResultInner::new(
            Arc::downgrade(&self.queue),
            method_id,
            peer_id,
            message_id,
        ));
        let watched = Arc::clone(&inner);
        match (handler.dispatch)(peer_id, data, inner) {
            Ok(HandlerExitCode::Success) => {}
            Ok(HandlerExitCode::RemoveHandler) => {
                debug!(name = self.log_name, method_id, "one-shot method removed");
                lock(&self.state).methods.remove(&method_id);
            }
            Err(IpcError::User { code, message }) => {
                watched.dismiss();
                self.push_error_result(peer_id, message_id, code, message);
            }
            Err(error) => {
                error!(name = self.log_name, method_id, %error, "method handler failed");
                watched.dismiss();
                self.push_error_result(peer_id, message_id, INTERNAL_ERROR_CODE, error.to_string());
            }
        }
    }

    fn on_remote_signal(
        &self,
        mut io: crate::socket::SocketIo<'_>,
        peer_id: PeerId,
        method_id: MethodId,
        handler: Arc<SignalHandlers>,
    ) {
        let parsed = (handler.parse)(&mut io);
        drop(io);
        match parsed {
            Ok(data) => match (handler.dispatch)(peer_id, data) {
                Ok(HandlerExitCode::Success) => {}
                Ok(HandlerExitCode::RemoveHandler) => {
                    debug!(name = self.log_name, method_id, "one-shot signal removed");
                    lock(&self.state).signals.remove(&method_id);
                }
                Err(error) => {
                    error!(name = self.log_name, method_id, %error, "signal handler failed");
                }
            },
            Err(error) => {
                warn!(name = self.log_name, %peer_id, method_id, %error, "broken signal payload");
                let message = error.to_string();
                self.remove_peer_internal(peer_id, &|| IpcError::Parse(message.clone()));
            }
        }
    }

    /// Sends the reserved error reply for a protocol violation, then drops
    /// the offender: its unread payload has corrupted the stream.
    fn answer_naughty_peer(&self, socket: &Socket, peer_id: PeerId, message_id: MessageId) {
        if let Err(error) =
            self.write_error_frame(socket, message_id, NAUGHTY_PEER_CODE, "forbidden action")
        {
            debug!(name = self.log_name, %peer_id, %error, "could not answer the naughty peer");
        }
        self.remove_peer_internal(peer_id, &|| IpcError::NaughtyPeer);
    }

    fn write_error_frame(
        &self,
        socket: &Socket,
        reply_to: MessageId,
        code: i32,
        message: &str,
    ) -> Result<(), wire::Error> {
        let mut io = socket.lock();
        let header = MessageHeader {
            method_id: ERROR_METHOD_ID,
            message_id: MessageId::generate(),
        };
        wire::save(&mut io, &header)?;
        wire::save(
            &mut io,
            &ErrorMessage {
                message_id: reply_to,
                code,
                message: message.to_string(),
            },
        )
    }

    fn push_error_result(&self, peer_id: PeerId, message_id: MessageId, code: i32, message: String) {
        self.queue.push_back(Request::SendResult {
            method_id: ERROR_METHOD_ID,
            peer_id,
            message_id,
            data: Box::new(ErrorMessage {
                message_id,
                code,
                message,
            }),
            serialize: make_serializer::<ErrorMessage>(),
        });
    }

    fn on_method_request(&self, call: MethodCall) {
        let Some(socket) = self.socket_for(call.peer_id) else {
            debug!(name = self.log_name, peer_id = %call.peer_id, "call to a missing peer");
            (call.process)(ResultBuilder::from_error(IpcError::PeerDisconnected));
            return;
        };

        let written = {
            let mut io = socket.lock();
            let header = MessageHeader {
                method_id: call.method_id,
                message_id: call.message_id,
            };
            wire::save(&mut io, &header)
                .and_then(|()| (call.serialize)(&mut io, call.data.as_ref()))
        };

        match written {
            Ok(()) => {
                lock(&self.state).pending.insert(
                    call.message_id,
                    PendingCall {
                        peer_id: call.peer_id,
                        parse: call.parse,
                        process: call.process,
                    },
                );
            }
            Err(error) => {
                warn!(
                    name = self.log_name,
                    peer_id = %call.peer_id,
                    method_id = call.method_id,
                    %error,
                    "failed to send the call"
                );
                let message = error.to_string();
                (call.process)(ResultBuilder::from_error(IpcError::Serialization(
                    message.clone(),
                )));
                self.remove_peer_internal(call.peer_id, &|| IpcError::Serialization(message.clone()));
            }
        }
    }

    fn on_signal_request(&self, call: SignalCall) {
        let Some(socket) = self.socket_for(call.peer_id) else {
            debug!(name = self.log_name, peer_id = %call.peer_id, "signal to a missing peer");
            return;
        };

        let written = {
            let mut io = socket.lock();
            let header = MessageHeader {
                method_id: call.method_id,
                message_id: call.message_id,
            };
            wire::save(&mut io, &header)
                .and_then(|()| (call.serialize)(&mut io, call.data.as_ref()))
        };

        if let Err(error) = written {
            warn!(
                name = self.log_name,
                peer_id = %call.peer_id,
                method_id = call.method_id,
                %error,
                "failed to send the signal"
            );
            let message = error.to_string();
            self.remove_peer_internal(call.peer_id, &|| IpcError::Serialization(message.clone()));
        }
    }

    fn on_send_result(
        &self,
        method_id: MethodId,
        peer_id: PeerId,
        message_id: MessageId,
        data: Box<dyn Any + Send>,
        serialize: SerializeFn,
    ) {
        let Some(socket) = self.socket_for(peer_id) else {
            debug!(name = self.log_name, %peer_id, "result for a missing peer");
            return;
        };

        let written = {
            let mut io = socket.lock();
            let header = MessageHeader {
                method_id,
                message_id,
            };
            wire::save(&mut io, &header).and_then(|()| serialize(&mut io, data.as_ref()))
        };

        if let Err(error) = written {
            warn!(
                name = self.log_name,
                %peer_id,
                %message_id,
                %error,
                "failed to send the result"
            );
            let message = error.to_string();
            self.remove_peer_internal(peer_id, &|| IpcError::Serialization(message.clone()));
        }
    }

    fn on_remove_method(&self, method_id: MethodId) {
        let mut state = lock(&self.state);
        state.methods.remove(&method_id);
        state.signals.remove(&method_id);
    }

    fn on_finish(&self) {
        debug!(name = self.log_name, "finishing");
        let peer_ids: Vec<PeerId> = lock(&self.state)
            .peers
            .iter()
            .map(|peer| peer.peer_id)
            .collect();
        for peer_id in peer_ids {
            self.remove_peer_internal(peer_id, &|| IpcError::Closing);
        }

        // Drain whatever work is still queued; callers are told we are gone.
        while let Some(request) = self.queue.try_pop() {
            self.queue.acknowledge();
            if let Request::Method(call) = request {
                (call.process)(ResultBuilder::from_error(IpcError::Closing));
            }
        }

        if let Err(error) = self.poll.remove_fd(self.queue.event_fd()) {
            warn!(name = self.log_name, %error, "failed to detach the queue eventfd");
        }
        lock(&self.state).is_running = false;
        self.state_changed.notify_all();
    }
}
