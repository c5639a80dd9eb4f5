//! Thread-safe ordered queue of pending work, with an eventfd the reactor
//! watches for wakeups.

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Condvar, Mutex};

use tracing::warn;

use crate::eventfd::EventFd;
use crate::lock;

/// FIFO of requests. Every push arms the embedded [`EventFd`], so the
/// descriptor polls readable while work is queued. Entries cancelled with
/// [`RequestQueue::remove_if`] leave their wakeup behind; consumers treat an
/// empty pop after a wakeup as a no-op.
#[derive(Debug)]
pub(crate) struct RequestQueue<R> {
    entries: Mutex<VecDeque<R>>,
    available: Condvar,
    event: EventFd,
}

impl<R> RequestQueue<R> {
    pub fn new() -> io::Result<Self> {
        Ok(RequestQueue {
            entries: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            event: EventFd::new()?,
        })
    }

    /// Descriptor to register with the poll.
    pub fn event_fd(&self) -> RawFd {
        self.event.as_raw_fd()
    }

    /// Consumes one eventfd wakeup; call once per pop driven by the poll.
    pub fn acknowledge(&self) {
        if let Err(error) = self.event.receive() {
            warn!(%error, "failed to acknowledge a queue wakeup");
        }
    }

    pub fn push_back(&self, request: R) {
        lock(&self.entries).push_back(request);
        self.available.notify_one();
        if let Err(error) = self.event.send() {
            warn!(%error, "failed to signal the queue eventfd");
        }
    }

    /// Enqueues ahead of everything else; used when an entry must be observed
    /// before already-queued traffic.
    pub fn push_front(&self, request: R) {
        lock(&self.entries).push_front(request);
        self.available.notify_one();
        if let Err(error) = self.event.send() {
            warn!(%error, "failed to signal the queue eventfd");
        }
    }

    /// Blocks until an entry is available.
    #[allow(dead_code)]
    pub fn pop(&self) -> R {
        let mut entries = lock(&self.entries);
        loop {
            if let Some(request) = entries.pop_front() {
                return request;
            }
            entries = self
                .available
                .wait(entries)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    pub fn try_pop(&self) -> Option<R> {
        lock(&self.entries).pop_front()
    }

    /// Removes and returns the first entry matching `predicate`.
    pub fn remove_if(&self, predicate: impl Fn(&R) -> bool) -> Option<R> {
        let mut entries = lock(&self.entries);
        let index = entries.iter().position(|entry| predicate(entry))?;
        entries.remove(index)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }
}
