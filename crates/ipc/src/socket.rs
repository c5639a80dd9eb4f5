//! Stream-socket wrapper used for all control traffic.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use nix::errno::Errno;
use nix::sys::socket::{
    accept4, bind, connect, getsockname, getsockopt, listen, socket, sockopt, AddressFamily,
    SockFlag, SockType, UnixAddr,
};
use tracing::{debug, warn};

use crate::config::{ACCEPT_BACKLOG, CONNECT_RETRY_STEP};
use crate::error::IpcError;
use crate::fdutil;
use crate::lock;
use crate::wire::{self, FdIo, WireRead, WireWrite};

/// A connected or listening Unix stream socket.
///
/// Framed traffic must not interleave, so all reads and writes go through the
/// guard returned by [`Socket::lock`]: one lock acquisition spans one whole
/// frame.
#[derive(Debug)]
pub struct Socket {
    fd: OwnedFd,
    frame_lock: Mutex<()>,
}

impl Socket {
    fn from_owned(fd: OwnedFd) -> Self {
        Socket {
            fd,
            frame_lock: Mutex::new(()),
        }
    }

    /// Binds and listens on `path`.
    ///
    /// A matching socket inherited from the service manager is used when one
    /// exists; otherwise any stale inode at `path` is unlinked and a fresh
    /// socket is bound in its place.
    pub fn create_unix(path: &Path) -> Result<Self, IpcError> {
        if let Some(fd) = activated_socket(path)? {
            debug!(?path, "adopting a service-manager socket");
            return Ok(Self::from_owned(fd));
        }

        let address = UnixAddr::new(path).map_err(|errno| IpcError::Socket { errno })?;
        let raw = socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(|errno| IpcError::Socket { errno })?;
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let _ = std::fs::remove_file(path);
        bind(raw, &address).map_err(|errno| IpcError::Socket { errno })?;
        listen(raw, ACCEPT_BACKLOG).map_err(|errno| IpcError::Socket { errno })?;

        debug!(?path, "listening");
        Ok(Self::from_owned(fd))
    }

    /// Connects to the service at `path`, retrying while nobody is listening
    /// yet, until `timeout` runs out. The connected descriptor is switched to
    /// non-blocking mode.
    pub fn connect_unix(path: &Path, timeout: std::time::Duration) -> Result<Self, IpcError> {
        let address = UnixAddr::new(path).map_err(|errno| IpcError::Socket { errno })?;
        let deadline = Instant::now() + timeout;

        let raw = socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(|errno| IpcError::Socket { errno })?;
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        loop {
            match connect(raw, &address) {
                Ok(()) => break,
                Err(Errno::ECONNREFUSED | Errno::EAGAIN | Errno::EINTR | Errno::ENOENT) => {
                    if Instant::now() >= deadline {
                        return Err(IpcError::Socket {
                            errno: Errno::ETIMEDOUT,
                        });
                    }
                    debug!(?path, "nobody listening yet, retrying");
                    std::thread::sleep(CONNECT_RETRY_STEP);
                }
                Err(errno) => return Err(IpcError::Socket { errno }),
            }
        }

        fdutil::set_nonblocking(raw)?;
        Ok(Self::from_owned(fd))
    }

    /// Binds and listens on a TCP address. Frames crossing hosts should use
    /// the codec's big-endian variant.
    pub fn create_inet(address: impl std::net::ToSocketAddrs) -> Result<Self, IpcError> {
        let listener = std::net::TcpListener::bind(address)?;
        fdutil::set_cloexec(listener.as_raw_fd())?;
        Ok(Self::from_owned(listener.into()))
    }

    /// Connects to a TCP endpoint within `timeout`. The connected descriptor
    /// is switched to non-blocking mode.
    pub fn connect_inet(
        address: impl std::net::ToSocketAddrs,
        timeout: std::time::Duration,
    ) -> Result<Self, IpcError> {
        let mut candidates = address.to_socket_addrs()?;
        let Some(target) = candidates.next() else {
            return Err(IpcError::Configuration(
                "address resolved to nothing".to_string(),
            ));
        };
        let stream = std::net::TcpStream::connect_timeout(&target, timeout)?;
        fdutil::set_cloexec(stream.as_raw_fd())?;
        fdutil::set_nonblocking(stream.as_raw_fd())?;
        Ok(Self::from_owned(stream.into()))
    }

    /// Accepts one pending connection.
    ///
    /// Resource exhaustion (`EMFILE` and friends) comes back as
    /// [`IpcError::Socket`] so the acceptor can report back-pressure without
    /// tearing the service down.
    pub fn accept(&self) -> Result<Socket, IpcError> {
        let raw = accept4(self.fd.as_raw_fd(), SockFlag::SOCK_CLOEXEC)
            .map_err(|errno| IpcError::Socket { errno })?;
        Ok(Self::from_owned(unsafe { OwnedFd::from_raw_fd(raw) }))
    }

    /// Serializes this socket for one frame's worth of I/O.
    pub fn lock(&self) -> SocketIo<'_> {
        SocketIo {
            _frame: lock(&self.frame_lock),
            io: FdIo::new(self.fd.as_raw_fd()),
        }
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Exclusive I/O access to a [`Socket`] for the duration of one frame.
pub struct SocketIo<'a> {
    _frame: MutexGuard<'a, ()>,
    io: FdIo,
}

impl WireWrite for SocketIo<'_> {
    fn write_all(&mut self, buf: &[u8]) -> Result<(), wire::Error> {
        self.io.write_all(buf)
    }

    fn send_fd(&mut self, fd: RawFd) -> Result<(), wire::Error> {
        self.io.send_fd(fd)
    }
}

impl WireRead for SocketIo<'_> {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), wire::Error> {
        self.io.read_exact(buf)
    }

    fn recv_fd(&mut self) -> Result<OwnedFd, wire::Error> {
        self.io.recv_fd()
    }
}

/// Looks for an already-bound listening socket handed over by the service
/// manager (`LISTEN_PID`/`LISTEN_FDS` protocol) whose address matches `path`.
fn activated_socket(path: &Path) -> Result<Option<OwnedFd>, IpcError> {
    const LISTEN_FDS_START: RawFd = 3;

    let pid_matches = std::env::var("LISTEN_PID")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .map(|pid| pid == std::process::id())
        .unwrap_or(false);
    if !pid_matches {
        return Ok(None);
    }
    let Some(count) = std::env::var("LISTEN_FDS")
        .ok()
        .and_then(|value| value.parse::<RawFd>().ok())
    else {
        return Ok(None);
    };

    for fd in LISTEN_FDS_START..LISTEN_FDS_START.saturating_add(count) {
        if matches_listening_unix(fd, path) {
            fdutil::set_cloexec(fd)?;
            return Ok(Some(unsafe { OwnedFd::from_raw_fd(fd) }));
        }
    }
    warn!(?path, "no usable sockets were passed by the service manager");
    Ok(None)
}

fn matches_listening_unix(fd: RawFd, path: &Path) -> bool {
    let Ok(address) = getsockname::<UnixAddr>(fd) else {
        return false;
    };
    if address.path() != Some(path) {
        return false;
    }
    let is_stream = getsockopt(fd, sockopt::SockType)
        .map(|kind| kind == SockType::Stream)
        .unwrap_or(false);
    let is_listening = getsockopt(fd, sockopt::AcceptConn).unwrap_or(false);
    is_stream && is_listening
}
