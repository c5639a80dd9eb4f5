//! Cross-thread wakeup primitive for the reactor.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::eventfd::{eventfd, EfdFlags};

use crate::fdutil;

/// A counting eventfd in semaphore mode: every [`EventFd::send`] adds one,
/// every [`EventFd::receive`] takes one, and the descriptor polls readable
/// exactly while the count is non-zero.
#[derive(Debug)]
pub struct EventFd {
    fd: OwnedFd,
}

impl EventFd {
    pub fn new() -> io::Result<Self> {
        let raw = eventfd(
            0,
            EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_SEMAPHORE,
        )
        .map_err(io::Error::from)?;
        Ok(EventFd {
            fd: unsafe { OwnedFd::from_raw_fd(raw) },
        })
    }

    /// Adds one wakeup. Callable from any thread.
    pub fn send(&self) -> io::Result<()> {
        fdutil::write_all(self.fd.as_raw_fd(), &1u64.to_ne_bytes())
    }

    /// Consumes one wakeup. A race with another consumer leaves the counter
    /// empty; that is reported as `Ok` so spurious polls stay harmless.
    pub fn receive(&self) -> io::Result<()> {
        let mut buf = [0u8; 8];
        match nix::unistd::read(self.fd.as_raw_fd(), &mut buf) {
            Ok(_) => Ok(()),
            Err(nix::errno::Errno::EAGAIN) => Ok(()),
            Err(errno) => Err(errno.into()),
        }
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
