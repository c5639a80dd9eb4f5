//! Connecting side of the IPC surface.

use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::config::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_NUMBER_OF_PEERS};
use crate::epoll::EventPoll;
use crate::error::IpcError;
use crate::lock;
use crate::method_result::MethodResult;
use crate::processor::Processor;
use crate::service::{
    arc_peer_callback, install_new_peer_hook, install_peer_hooks, install_removed_peer_hook,
};
use crate::socket::Socket;
use crate::types::{HandlerExitCode, MessageId, MethodId, PeerId};

/// Maintains one outbound connection to a [`Service`](crate::Service).
///
/// The client remembers the service's peer id, so call and signal variants
/// omit the peer argument. Handlers can be registered before
/// [`Client::start`]; signal subscriptions registered early are announced as
/// part of the connection handshake.
///
/// ```no_run
/// use std::time::Duration;
/// use zones_ipc::{Client, ThreadDispatcher};
///
/// # fn main() -> Result<(), zones_ipc::IpcError> {
/// let dispatcher = ThreadDispatcher::new()?;
/// let client = Client::new(dispatcher.poll(), "/run/zones/host.socket".as_ref())?;
/// client.start()?;
/// let echoed: u32 = client.call_sync(1, 42u32, Duration::from_secs(1))?;
/// # Ok(()) }
/// ```
pub struct Client {
    poll: EventPoll,
    processor: Processor,
    socket_path: PathBuf,
    service_id: Mutex<Option<PeerId>>,
}

impl Client {
    /// Prepares a client for `path` without connecting yet.
    pub fn new(poll: &EventPoll, path: &Path) -> Result<Self, IpcError> {
        let processor = Processor::new(poll, "client", DEFAULT_MAX_NUMBER_OF_PEERS)?;
        install_peer_hooks(&processor, poll, None, None);
        Ok(Client {
            poll: poll.clone(),
            processor,
            socket_path: path.to_path_buf(),
            service_id: Mutex::new(None),
        })
    }

    /// Connects and starts processing. A running client quits immediately
    /// without error.
    pub fn start(&self) -> Result<(), IpcError> {
        if self.processor.is_started() {
            return Ok(());
        }
        debug!(path = ?self.socket_path, "client connecting");
        let socket = Socket::connect_unix(&self.socket_path, DEFAULT_CONNECT_TIMEOUT)?;
        self.processor.start()?;
        let peer_id = self.processor.add_peer(socket)?;
        *lock(&self.service_id) = Some(peer_id);
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.processor.is_started()
    }

    /// Disconnects and stops processing; with `wait` the call blocks until
    /// the worker wound down.
    pub fn stop(&self, wait: bool) {
        debug!("client stop");
        self.processor.stop(wait);
        *lock(&self.service_id) = None;
    }

    /// Replaces the connection callback.
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

    /// Registers the handler answering `method_id` on this side.
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
        debug!(method_id, "client set_method_handler");
        self.processor.set_method_handler::<In, Out, F>(method_id, handler)
    }

    /// Registers a signal handler; the subscription is announced to the
    /// service when connected.
    pub fn set_signal_handler<In, F>(&self, method_id: MethodId, handler: F) -> Result<(), IpcError>
    where
        In: DeserializeOwned + Send + 'static,
        F: Fn(PeerId, In) -> Result<HandlerExitCode, IpcError> + Send + Sync + 'static,
    {
        debug!(method_id, "client set_signal_handler");
        self.processor.set_signal_handler::<In, F>(method_id, handler)
    }

    /// Drops whatever handler occupies `method_id`; repeating it is a no-op.
    pub fn remove_method(&self, method_id: MethodId) {
        debug!(method_id, "client remove_method");
        self.processor.remove_method(method_id);
    }

    pub fn is_handled(&self, method_id: MethodId) -> bool {
        self.processor.is_handled(method_id)
    }

    /// Calls the service and waits up to `timeout` for the reply.
    pub fn call_sync<In, Out>(
        &self,
        method_id: MethodId,
        data: In,
        timeout: Duration,
    ) -> Result<Out, IpcError>
    where
        In: Serialize + Send + 'static,
        Out: DeserializeOwned + Send + 'static,
    {
        debug!(method_id, ?timeout, "client call_sync");
        let peer_id = self.service_peer()?;
        self.processor.call_sync::<In, Out>(method_id, peer_id, data, timeout)
    }

    /// Calls the service; `process` runs on the processor thread when the
    /// reply (or failure) arrives.
    pub fn call_async<In, Out, F>(
        &self,
        method_id: MethodId,
        data: In,
        process: F,
    ) -> Result<MessageId, IpcError>
    where
        In: Serialize + Send + 'static,
        Out: DeserializeOwned + Send + 'static,
        F: FnOnce(Result<Out, IpcError>) + Send + 'static,
    {
        debug!(method_id, "client call_async");
        let peer_id = self.service_peer()?;
        self.processor.call_async::<In, Out, F>(method_id, peer_id, data, process)
    }

    /// [`Client::call_async`] variant safe to use from handlers and
    /// completion callbacks running on the processor thread.
    pub fn call_async_from_callback<In, Out, F>(
        &self,
        method_id: MethodId,
        data: In,
        process: F,
    ) -> Result<MessageId, IpcError>
    where
        In: Serialize + Send + 'static,
        Out: DeserializeOwned + Send + 'static,
        F: FnOnce(Result<Out, IpcError>) + Send + 'static,
    {
        let peer_id = self.service_peer()?;
        self.processor
            .call_async_from_callback::<In, Out, F>(method_id, peer_id, data, process)
    }

    /// Emits a signal towards the service, delivered only if it subscribed.
    pub fn signal<In>(&self, method_id: MethodId, data: In) -> Result<(), IpcError>
    where
        In: Serialize + Send + Sync + 'static,
    {
        debug!(method_id, "client signal");
        self.processor.signal::<In>(method_id, data)
    }

    fn service_peer(&self) -> Result<PeerId, IpcError> {
        lock(&self.service_id).ok_or(IpcError::PeerDisconnected)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.processor.stop(true);
    }
}
