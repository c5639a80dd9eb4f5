//! Accepting side of the IPC surface.

use std::os::fd::RawFd;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::acceptor::Acceptor;
use crate::config::DEFAULT_MAX_NUMBER_OF_PEERS;
use crate::epoll::{EventPoll, Events};
use crate::error::IpcError;
use crate::method_result::MethodResult;
use crate::processor::{Processor, WeakProcessor};
use crate::types::{HandlerExitCode, MessageId, MethodId, PeerId};

/// Serves method calls and signals on a Unix socket path.
///
/// The socket is bound on construction; [`Service::start`] begins processing,
/// and each accepted connection becomes a peer of the embedded processor.
/// All registration and call operations may be used from any thread.
///
/// ```no_run
/// use zones_ipc::{HandlerExitCode, Service, ThreadDispatcher};
///
/// # fn main() -> Result<(), zones_ipc::IpcError> {
/// let dispatcher = ThreadDispatcher::new()?;
/// let service = Service::new(dispatcher.poll(), "/run/zones/host.socket".as_ref())?;
/// service.set_method_handler::<u32, u32, _>(1, |_peer, value, result| {
///     result.set(value);
///     Ok(HandlerExitCode::Success)
/// })?;
/// service.start()?;
/// # Ok(()) }
/// ```
pub struct Service {
    poll: EventPoll,
    processor: Processor,
    _acceptor: Acceptor,
}

impl Service {
    /// Binds `path` (or adopts a service-manager socket for it) and prepares
    /// the service. Nothing is processed until [`Service::start`].
    pub fn new(poll: &EventPoll, path: &Path) -> Result<Self, IpcError> {
        let processor = Processor::new(poll, "service", DEFAULT_MAX_NUMBER_OF_PEERS)?;
        install_peer_hooks(&processor, poll, None, None);

        let acceptor_processor = processor.downgrade();
        let acceptor = Acceptor::new(poll, path, move |socket| {
            let Some(processor) = acceptor_processor.upgrade() else {
                return;
            };
            if let Err(error) = processor.add_peer(socket) {
                warn!(%error, "failed to admit a connection");
            }
        })?;

        Ok(Service {
            poll: poll.clone(),
            processor,
            _acceptor: acceptor,
        })
    }

    /// Starts processing. A running service quits immediately without error.
    pub fn start(&self) -> Result<(), IpcError> {
        debug!("service start");
        self.processor.start()
    }

    pub fn is_started(&self) -> bool {
        self.processor.is_started()
    }

    /// Stops processing, with `wait` blocking until the worker wound down.
    pub fn stop(&self, wait: bool) {
        debug!("service stop");
        self.processor.stop(wait);
    }

    /// Replaces the connection callback. Fires once per accepted peer.
    pub fn set_new_peer_callback(
        &self,
        callback: Option<impl Fn(PeerId, RawFd) + Send + Sync + 'static>,
    ) {
        install_new_peer_hook(&self.processor, &self.poll, callback.map(arc_peer_callback));
    }

    /// Replaces the disconnection callback.
    pub fn set_removed_peer_callback(
        &self,
        callback: Option<impl Fn(PeerId, RawFd) + Send + Sync + 'static>,
    ) {
        install_removed_peer_hook(&self.processor, &self.poll, callback.map(arc_peer_callback));
    }

    /// Registers the handler answering `method_id`, replacing any previous
    /// one. Fails on reserved selectors and on selectors held by a signal
    /// handler.
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
        debug!(method_id, "service set_method_handler");
        self.processor.set_method_handler::<In, Out, F>(method_id, handler)
    }

    /// Registers a signal handler and announces the interest to every
    /// connected peer.
    pub fn set_signal_handler<In, F>(&self, method_id: MethodId, handler: F) -> Result<(), IpcError>
    where
        In: DeserializeOwned + Send + 'static,
        F: Fn(PeerId, In) -> Result<HandlerExitCode, IpcError> + Send + Sync + 'static,
    {
        debug!(method_id, "service set_signal_handler");
        self.processor.set_signal_handler::<In, F>(method_id, handler)
    }

    /// Drops whatever handler occupies `method_id`; repeating it is a no-op.
    pub fn remove_method(&self, method_id: MethodId) {
        debug!(method_id, "service remove_method");
        self.processor.remove_method(method_id);
    }

    pub fn is_handled(&self, method_id: MethodId) -> bool {
        self.processor.is_handled(method_id)
    }

    /// Calls `method_id` on `peer_id` and waits up to `timeout` for the
    /// reply.
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
        debug!(method_id, %peer_id, ?timeout, "service call_sync");
        self.processor.call_sync::<In, Out>(method_id, peer_id, data, timeout)
    }

    /// Calls `method_id` on `peer_id`; `process` runs on the processor
    /// thread when the reply (or failure) arrives.
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
        debug!(method_id, %peer_id, "service call_async");
        self.processor.call_async::<In, Out, F>(method_id, peer_id, data, process)
    }

    /// [`Service::call_async`] variant safe to use from handlers and
    /// completion callbacks running on the processor thread.
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
        self.processor
            .call_async_from_callback::<In, Out, F>(method_id, peer_id, data, process)
    }

    /// Delivers `data` to every peer subscribed to `method_id`.
    pub fn signal<In>(&self, method_id: MethodId, data: In) -> Result<(), IpcError>
    where
        In: Serialize + Send + Sync + 'static,
    {
        debug!(method_id, "service signal");
        self.processor.signal::<In>(method_id, data)
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.processor.stop(true);
    }
}

pub(crate) fn arc_peer_callback(
    callback: impl Fn(PeerId, RawFd) + Send + Sync + 'static,
) -> Arc<crate::types::PeerCallback> {
    Arc::new(callback)
}

/// Wires the processor's peer lifecycle into the poll: a joining peer's
/// descriptor starts feeding the processor, a leaving peer's descriptor is
/// detached. User callbacks run after the plumbing.
pub(crate) fn install_peer_hooks(
    processor: &Processor,
    poll: &EventPoll,
    on_new: Option<Arc<crate::types::PeerCallback>>,
    on_removed: Option<Arc<crate::types::PeerCallback>>,
) {
    install_new_peer_hook(processor, poll, on_new);
    install_removed_peer_hook(processor, poll, on_removed);
}

pub(crate) fn install_new_peer_hook(
    processor: &Processor,
    poll: &EventPoll,
    user: Option<Arc<crate::types::PeerCallback>>,
) {
    let poll = poll.clone();
    let weak: WeakProcessor = processor.downgrade();
    processor.set_new_peer_callback(Some(Arc::new(move |peer_id, fd| {
        let dispatch = weak.clone();
        let added = poll.add_fd(
            fd,
            Events::EPOLLIN | Events::EPOLLHUP | Events::EPOLLRDHUP,
            move |fd, events| {
                if let Some(processor) = dispatch.upgrade() {
                    processor.handle(fd, events);
                }
            },
        );
        if let Err(error) = added {
            error!(%peer_id, fd, %error, "failed to watch the new peer");
        }
        if let Some(user) = &user {
            user(peer_id, fd);
        }
    })));
}

pub(crate) fn install_removed_peer_hook(
    processor: &Processor,
    poll: &EventPoll,
    user: Option<Arc<crate::types::PeerCallback>>,
) {
    let poll = poll.clone();
    processor.set_removed_peer_callback(Some(Arc::new(move |peer_id, fd| {
        if let Err(error) = poll.remove_fd(fd) {
            warn!(%peer_id, fd, %error, "failed to detach the removed peer");
        }
        if let Some(user) = &user {
            user(peer_id, fd);
        }
    })));
}
