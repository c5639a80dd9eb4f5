use std::os::fd::RawFd;

use crate::error::IpcError;

use super::EventPoll;

/// Reactor driver for hosts that already own a main loop.
///
/// Add [`ExternalDispatcher::poll_fd`] to the host loop watching for input
/// and call [`ExternalDispatcher::dispatch`] whenever it reports readiness;
/// each call runs at most one pending callback and never blocks.
pub struct ExternalDispatcher {
    poll: EventPoll,
}

impl ExternalDispatcher {
    pub fn new() -> Result<Self, IpcError> {
        Ok(ExternalDispatcher {
            poll: EventPoll::new()?,
        })
    }

    pub fn poll(&self) -> &EventPoll {
        &self.poll
    }

    /// The descriptor the host loop should watch.
    pub fn poll_fd(&self) -> RawFd {
        self.poll.poll_fd()
    }

    /// Runs one iteration without waiting. Returns `false` when nothing was
    /// pending.
    pub fn dispatch(&self) -> Result<bool, IpcError> {
        self.poll.dispatch_iteration(0)
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use nix::poll::{poll, PollFd, PollFlags};

    use super::super::Events;
    use super::*;
    use crate::eventfd::EventFd;

    #[test]
    fn host_loop_sees_readiness_through_the_poll_fd() {
        let dispatcher = ExternalDispatcher::new().expect("dispatcher");
        let event = EventFd::new().expect("eventfd");
        let hits = Arc::new(AtomicUsize::new(0));

        let seen = Arc::clone(&hits);
        dispatcher
            .poll()
            .add_fd(event.as_raw_fd(), Events::EPOLLIN, move |_, _| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .expect("add");

        assert!(!dispatcher.dispatch().expect("idle"));

        event.send().expect("arm");

        // This is what the host main loop would observe.
        let mut fds = [PollFd::new(dispatcher.poll_fd(), PollFlags::POLLIN)];
        assert!(poll(&mut fds, 1000).expect("host poll") > 0);

        assert!(dispatcher.dispatch().expect("ready"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
