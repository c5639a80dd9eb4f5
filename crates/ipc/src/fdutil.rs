//! Whole-buffer I/O over raw file descriptors.
//!
//! The wire format is framed, so every read and write here transfers the full
//! requested byte count or fails: short transfers are retried, `EINTR` is
//! swallowed, and `EAGAIN` on a non-blocking descriptor parks the caller in
//! `poll(2)` until the descriptor is ready again. EOF in the middle of a read
//! is an error.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use nix::cmsg_space;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use nix::sys::socket::{
    recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr,
};
use nix::unistd;

/// Prevents the descriptor from leaking into spawned zone processes.
pub fn set_cloexec(fd: RawFd) -> io::Result<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(io::Error::from)?;
    Ok(())
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let bits = fcntl(fd, FcntlArg::F_GETFL).map_err(io::Error::from)?;
    let flags = OFlag::from_bits_truncate(bits) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;
    Ok(())
}

/// Current soft limit on open descriptors for this process.
pub fn max_fd_count() -> io::Result<u64> {
    let (soft, _hard) = getrlimit(Resource::RLIMIT_NOFILE).map_err(io::Error::from)?;
    Ok(soft)
}

/// Lower or restore the soft descriptor limit.
pub fn set_max_fd_count(limit: u64) -> io::Result<()> {
    let (_soft, hard) = getrlimit(Resource::RLIMIT_NOFILE).map_err(io::Error::from)?;
    setrlimit(Resource::RLIMIT_NOFILE, limit.min(hard), hard).map_err(io::Error::from)?;
    Ok(())
}

fn wait_for(fd: RawFd, events: PollFlags) -> io::Result<()> {
    loop {
        let mut fds = [PollFd::new(fd, events)];
        match poll(&mut fds, -1) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(errno.into()),
        }
    }
}

pub fn write_all(fd: RawFd, buf: &[u8]) -> io::Result<()> {
    let mut written = 0;
    while written < buf.len() {
        match unistd::write(fd, &buf[written..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "descriptor refused to accept data",
                ))
            }
            Ok(count) => written += count,
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => wait_for(fd, PollFlags::POLLOUT)?,
            Err(errno) => return Err(errno.into()),
        }
    }
    Ok(())
}

pub fn read_exact(fd: RawFd, buf: &mut [u8]) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match unistd::read(fd, &mut buf[filled..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed the descriptor mid-read",
                ))
            }
            Ok(count) => filled += count,
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => wait_for(fd, PollFlags::POLLIN)?,
            Err(errno) => return Err(errno.into()),
        }
    }
    Ok(())
}

/// Sends `data` (the one-byte carrier of the wire format) together with a
/// descriptor in the `SCM_RIGHTS` ancillary block.
pub(crate) fn send_with_fd(fd: RawFd, data: &[u8], payload_fd: RawFd) -> io::Result<()> {
    let fds = [payload_fd];
    let control = [ControlMessage::ScmRights(&fds)];
    let iov = [IoSlice::new(data)];
    loop {
        match sendmsg::<UnixAddr>(fd, &iov, &control, MsgFlags::empty(), None) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => wait_for(fd, PollFlags::POLLOUT)?,
            Err(errno) => return Err(errno.into()),
        }
    }
}

/// Reads exactly `buf.len()` bytes, collecting a descriptor if the sender
/// attached one to this range of the stream.
pub(crate) fn recv_with_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<Option<OwnedFd>> {
    let mut received = None;
    let mut filled = 0;
    while filled < buf.len() {
        let mut control = cmsg_space!([RawFd; 1]);
        let mut iov = [IoSliceMut::new(&mut buf[filled..])];
        match recvmsg::<UnixAddr>(fd, &mut iov, Some(&mut control), MsgFlags::MSG_CMSG_CLOEXEC) {
            Ok(message) => {
                let count = message.bytes;
                for cmsg in message.cmsgs() {
                    if let ControlMessageOwned::ScmRights(fds) = cmsg {
                        for raw in fds {
                            // Last one wins; duplicates are closed right away.
                            received = Some(unsafe { OwnedFd::from_raw_fd(raw) });
                        }
                    }
                }
                if count == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed the descriptor mid-read",
                    ));
                }
                filled += count;
            }
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => wait_for(fd, PollFlags::POLLIN)?,
            Err(errno) => return Err(errno.into()),
        }
    }
    Ok(received)
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;

    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use nix::unistd::pipe;

    use super::*;

    #[test]
    fn read_exact_reassembles_partial_writes() {
        let (read_end, write_end) = pipe().expect("pipe");
        write_all(write_end, b"he").expect("first half");
        write_all(write_end, b"llo").expect("second half");

        let mut buf = [0u8; 5];
        read_exact(read_end, &mut buf).expect("read");
        assert_eq!(&buf, b"hello");

        let _ = unistd::close(read_end);
        let _ = unistd::close(write_end);
    }

    #[test]
    fn eof_mid_read_is_an_error() {
        let (read_end, write_end) = pipe().expect("pipe");
        write_all(write_end, b"hi").expect("write");
        let _ = unistd::close(write_end);

        let mut buf = [0u8; 5];
        let error = read_exact(read_end, &mut buf).expect_err("eof");
        assert_eq!(error.kind(), io::ErrorKind::UnexpectedEof);

        let _ = unistd::close(read_end);
    }

    #[test]
    fn descriptor_travels_in_ancillary_data() {
        let (left, right) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .expect("socketpair");

        let (pipe_read, pipe_write) = pipe().expect("pipe");
        write_all(pipe_write, b"payload").expect("fill pipe");
        let _ = unistd::close(pipe_write);

        send_with_fd(left, &[0u8], pipe_read).expect("send");
        let _ = unistd::close(pipe_read);

        let mut carrier = [0u8; 1];
        let fd = recv_with_fd(right, &mut carrier)
            .expect("recv")
            .expect("fd attached");

        let mut buf = [0u8; 7];
        read_exact(fd.as_raw_fd(), &mut buf).expect("read through received fd");
        assert_eq!(&buf, b"payload");

        let _ = unistd::close(left);
        let _ = unistd::close(right);
    }

    #[test]
    fn fd_limit_roundtrip() {
        let limit = max_fd_count().expect("query limit");
        set_max_fd_count(limit).expect("restore same limit");
    }
}
