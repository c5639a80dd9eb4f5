use std::io;
use std::os::fd::{OwnedFd, RawFd};

use crate::fdutil;

use super::error::{Error, Result};

/// Byte sink the serializer streams into. `send_fd` must deliver the
/// descriptor attached to a one-byte carrier so the receiving side can pick
/// it up at the matching point of the stream.
pub trait WireWrite {
    fn write_all(&mut self, buf: &[u8]) -> Result<()>;
    fn send_fd(&mut self, fd: RawFd) -> Result<()>;
}

/// Byte source the deserializer streams from.
pub trait WireRead {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()>;
    fn recv_fd(&mut self) -> Result<OwnedFd>;
}

/// Direct, unbuffered view of a raw descriptor.
#[derive(Debug)]
pub struct FdIo {
    fd: RawFd,
}

impl FdIo {
    pub fn new(fd: RawFd) -> Self {
        FdIo { fd }
    }
}

fn map_fd_error(error: io::Error) -> Error {
    if error.raw_os_error() == Some(nix::errno::Errno::ENOTSOCK as i32) {
        Error::FdUnsupported
    } else {
        Error::Io(error)
    }
}

impl WireWrite for FdIo {
    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        fdutil::write_all(self.fd, buf).map_err(Error::Io)
    }

    fn send_fd(&mut self, fd: RawFd) -> Result<()> {
        fdutil::send_with_fd(self.fd, &[0u8], fd).map_err(map_fd_error)
    }
}

impl WireRead for FdIo {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        fdutil::read_exact(self.fd, buf).map_err(Error::Io)
    }

    fn recv_fd(&mut self) -> Result<OwnedFd> {
        let mut carrier = [0u8; 1];
        let received = fdutil::recv_with_fd(self.fd, &mut carrier).map_err(map_fd_error)?;
        received.ok_or(Error::FdExpected)
    }
}
