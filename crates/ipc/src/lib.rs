//! Asynchronous IPC runtime over Unix-domain stream sockets, the control
//! transport between the zones daemon and its local clients.
//!
//! A [`Service`] listens on a socket path and a [`Client`] connects to it;
//! both sit on the same processing core, so either side can register
//! **methods** (request/reply exchanges correlated by message id) and
//! **signals** (fire-and-forget messages delivered only to peers that
//! announced interest). Payloads are plain `serde` records streamed through
//! the [`wire`] binary codec straight to the socket, including open file
//! descriptors passed as [`wire::FileDescriptor`] fields.
//!
//! Processing is single-threaded and cooperative per processor: one worker —
//! the thread behind the [`ThreadDispatcher`] (or the host's own loop via
//! [`ExternalDispatcher`]) — owns all framing, parsing and handler
//! invocation, while any thread may issue calls, emit signals or register
//! handlers.
//!
//! ```no_run
//! use std::time::Duration;
//! use zones_ipc::{Client, HandlerExitCode, Service, ThreadDispatcher};
//!
//! # fn main() -> Result<(), zones_ipc::IpcError> {
//! let dispatcher = ThreadDispatcher::new()?;
//!
//! let service = Service::new(dispatcher.poll(), "/tmp/zones.socket".as_ref())?;
//! service.set_method_handler::<u32, u32, _>(1, |_peer, value, result| {
//!     result.set(value + 1);
//!     Ok(HandlerExitCode::Success)
//! })?;
//! service.start()?;
//!
//! let client = Client::new(dispatcher.poll(), "/tmp/zones.socket".as_ref())?;
//! client.start()?;
//! let answer: u32 = client.call_sync(1, 41u32, Duration::from_secs(1))?;
//! assert_eq!(answer, 42);
//! # Ok(()) }
//! ```

mod acceptor;
mod client;
pub mod config;
mod epoll;
mod error;
mod eventfd;
mod fdutil;
mod inotify;
mod latch;
mod method_result;
mod processor;
mod queue;
mod service;
mod socket;
mod types;
pub mod wire;

pub use client::Client;
pub use epoll::{EventPoll, Events, ExternalDispatcher, ThreadDispatcher};
pub use error::IpcError;
pub use eventfd::EventFd;
pub use fdutil::{max_fd_count, set_max_fd_count};
pub use inotify::Inotify;
pub use latch::ValueLatch;
pub use method_result::MethodResult;
pub use service::Service;
pub use socket::{Socket, SocketIo};
pub use types::{
    HandlerExitCode, MessageId, MethodId, PeerId, ERROR_METHOD_ID, REGISTER_SIGNAL_METHOD_ID,
    RETURN_METHOD_ID,
};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks ignoring poisoning; a panicking lock holder is already reported by
/// the panic itself.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests;
