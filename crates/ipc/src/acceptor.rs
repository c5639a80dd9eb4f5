//! Listening-socket half of a service.

use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::Arc;

use tracing::warn;

use crate::epoll::{EventPoll, Events};
use crate::error::IpcError;
use crate::socket::Socket;

/// Owns the bound socket and hands every accepted connection to the
/// processor. Lives as long as its service; dropping it detaches the
/// listener from the poll.
pub(crate) struct Acceptor {
    poll: EventPoll,
    socket: Arc<Socket>,
}

impl Acceptor {
    pub fn new(
        poll: &EventPoll,
        path: &Path,
        on_connection: impl Fn(Socket) + Send + Sync + 'static,
    ) -> Result<Self, IpcError> {
        let socket = Arc::new(Socket::create_unix(path)?);
        let listener = Arc::clone(&socket);
        poll.add_fd(socket.as_raw_fd(), Events::EPOLLIN, move |_, _| {
            match listener.accept() {
                Ok(connection) => on_connection(connection),
                // Resource pressure (EMFILE and friends) must not take the
                // service down; connected peers keep working.
                Err(error) => warn!(%error, "failed to accept a connection"),
            }
        })?;
        Ok(Acceptor {
            poll: poll.clone(),
            socket,
        })
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        if let Err(error) = self.poll.remove_fd(self.socket.as_raw_fd()) {
            warn!(%error, "failed to detach the listening socket");
        }
    }
}
