use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};

use nix::errno::Errno;
use nix::sys::epoll::{epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollOp};
use tracing::{trace, warn};

use crate::error::IpcError;
use crate::lock;

use super::Events;

/// Callback invoked with the ready descriptor and the reported event mask.
pub type PollCallback = dyn Fn(RawFd, Events) + Send + Sync;

struct Inner {
    epoll: OwnedFd,
    callbacks: Mutex<HashMap<RawFd, Arc<PollCallback>>>,
}

/// Waits on registered descriptors and dispatches their callbacks.
///
/// Cheap to clone; all clones drive the same kernel poll object. Callbacks
/// are held as shared objects and looked up under the table lock immediately
/// before the call, so removing a descriptor during a pending dispatch never
/// runs its stale callback, and a running callback may add or remove
/// descriptors, including its own.
#[derive(Clone)]
pub struct EventPoll {
    inner: Arc<Inner>,
}

impl EventPoll {
    pub fn new() -> Result<Self, IpcError> {
        let raw = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(EventPoll {
            inner: Arc::new(Inner {
                epoll: unsafe { OwnedFd::from_raw_fd(raw) },
                callbacks: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// The poll object itself, so one poll can be nested inside another.
    pub fn poll_fd(&self) -> RawFd {
        self.inner.epoll.as_raw_fd()
    }

    /// Starts watching `fd`. Fails if it is already registered.
    pub fn add_fd(
        &self,
        fd: RawFd,
        events: Events,
        callback: impl Fn(RawFd, Events) + Send + Sync + 'static,
    ) -> Result<(), IpcError> {
        let mut callbacks = lock(&self.inner.callbacks);
        if callbacks.contains_key(&fd) {
            return Err(IpcError::Configuration(format!(
                "descriptor {fd} is already registered"
            )));
        }
        let mut event = EpollEvent::new(events, fd as u64);
        epoll_ctl(self.poll_fd(), EpollOp::EpollCtlAdd, fd, &mut event)?;
        callbacks.insert(fd, Arc::new(callback));
        Ok(())
    }

    /// Changes the watched event mask of a registered descriptor.
    pub fn modify_fd(&self, fd: RawFd, events: Events) -> Result<(), IpcError> {
        let callbacks = lock(&self.inner.callbacks);
        if !callbacks.contains_key(&fd) {
            return Err(IpcError::Configuration(format!(
                "descriptor {fd} is not registered"
            )));
        }
        let mut event = EpollEvent::new(events, fd as u64);
        epoll_ctl(self.poll_fd(), EpollOp::EpollCtlMod, fd, &mut event)?;
        Ok(())
    }

    /// Stops watching a registered descriptor.
    pub fn remove_fd(&self, fd: RawFd) -> Result<(), IpcError> {
        let mut callbacks = lock(&self.inner.callbacks);
        if callbacks.remove(&fd).is_none() {
            return Err(IpcError::Configuration(format!(
                "descriptor {fd} is not registered"
            )));
        }
        if let Err(errno) = epoll_ctl(self.poll_fd(), EpollOp::EpollCtlDel, fd, None) {
            // The descriptor may have been closed already; the kernel dropped
            // it from the set on close.
            warn!(fd, %errno, "failed to detach descriptor from the poll");
        }
        Ok(())
    }

    /// Waits up to `timeout_ms` (`-1` = forever) and dispatches at most one
    /// ready callback. Returns `false` on timeout, `true` otherwise.
    pub fn dispatch_iteration(&self, timeout_ms: isize) -> Result<bool, IpcError> {
        let mut events = [EpollEvent::empty()];
        let count = match epoll_wait(self.poll_fd(), &mut events, timeout_ms) {
            Ok(count) => count,
            Err(Errno::EINTR) => return Ok(true),
            Err(errno) => return Err(errno.into()),
        };
        if count == 0 {
            return Ok(false);
        }

        let fd = events[0].data() as RawFd;
        let mask = events[0].events();
        let callback = lock(&self.inner.callbacks).get(&fd).cloned();
        match callback {
            Some(callback) => callback(fd, mask),
            None => trace!(fd, "event for a descriptor removed mid-dispatch"),
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use nix::unistd::{close, pipe};

    use super::*;
    use crate::eventfd::EventFd;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn duplicate_registration_fails() {
        let poll = EventPoll::new().expect("poll");
        let (read_end, write_end) = pipe().expect("pipe");

        poll.add_fd(read_end, Events::EPOLLIN, |_, _| {}).expect("add");
        assert!(poll.add_fd(read_end, Events::EPOLLIN, |_, _| {}).is_err());

        poll.remove_fd(read_end).expect("remove");
        let _ = close(read_end);
        let _ = close(write_end);
    }

    #[test]
    fn unknown_descriptor_cannot_be_modified_or_removed() {
        let poll = EventPoll::new().expect("poll");
        assert!(poll.modify_fd(999, Events::EPOLLIN).is_err());
        assert!(poll.remove_fd(999).is_err());
    }

    #[test]
    fn dispatch_reports_timeout_and_readiness() {
        let poll = EventPoll::new().expect("poll");
        let event = EventFd::new().expect("eventfd");
        let hits = Arc::new(AtomicUsize::new(0));

        let seen = Arc::clone(&hits);
        poll.add_fd(event.as_raw_fd(), Events::EPOLLIN, move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .expect("add");

        assert!(!poll.dispatch_iteration(0).expect("idle poll"));

        event.send().expect("arm");
        assert!(poll.dispatch_iteration(0).expect("ready poll"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        poll.remove_fd(event.as_raw_fd()).expect("remove");
    }

    #[test]
    fn callback_may_remove_its_own_descriptor() {
        let poll = EventPoll::new().expect("poll");
        let event = EventFd::new().expect("eventfd");
        let fd = event.as_raw_fd();

        let poll_handle = poll.clone();
        poll.add_fd(fd, Events::EPOLLIN, move |fd, _| {
            poll_handle.remove_fd(fd).expect("self-removal");
        })
        .expect("add");

        event.send().expect("arm");
        assert!(poll.dispatch_iteration(0).expect("dispatch"));
        assert!(poll.modify_fd(fd, Events::EPOLLIN).is_err(), "gone");
    }

    #[test]
    fn poll_fd_nests_inside_another_poll() {
        let outer = EventPoll::new().expect("outer");
        let inner = EventPoll::new().expect("inner");
        let event = EventFd::new().expect("eventfd");

        inner
            .add_fd(event.as_raw_fd(), Events::EPOLLIN, |_, _| {})
            .expect("inner add");

        let chained = inner.clone();
        outer
            .add_fd(inner.poll_fd(), Events::EPOLLIN, move |_, _| {
                chained.dispatch_iteration(0).expect("nested dispatch");
            })
            .expect("outer add");

        event.send().expect("arm");
        assert!(outer.dispatch_iteration(0).expect("outer dispatch"));
    }
}
