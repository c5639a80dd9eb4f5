use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{error, warn};

use crate::error::IpcError;
use crate::eventfd::EventFd;

use super::{EventPoll, Events};

/// Drives an [`EventPoll`] from a dedicated worker thread.
///
/// Dropping the dispatcher signals the embedded eventfd, joins the worker and
/// detaches the wakeup descriptor; a handler already in flight completes, no
/// new handler starts.
pub struct ThreadDispatcher {
    poll: EventPoll,
    stop_event: Arc<EventFd>,
    thread: Option<JoinHandle<()>>,
}

impl ThreadDispatcher {
    pub fn new() -> Result<Self, IpcError> {
        let poll = EventPoll::new()?;
        let stop_event = Arc::new(EventFd::new()?);
        let stopped = Arc::new(AtomicBool::new(false));

        let control_event = Arc::clone(&stop_event);
        let control_flag = Arc::clone(&stopped);
        poll.add_fd(stop_event.as_raw_fd(), Events::EPOLLIN, move |_, _| {
            if let Err(error) = control_event.receive() {
                warn!(%error, "failed to drain the stop event");
            }
            control_flag.store(true, Ordering::Release);
        })?;

        let worker_poll = poll.clone();
        let thread = std::thread::spawn(move || {
            while !stopped.load(Ordering::Acquire) {
                if let Err(error) = worker_poll.dispatch_iteration(-1) {
                    error!(%error, "event dispatch failed");
                }
            }
        });

        Ok(ThreadDispatcher {
            poll,
            stop_event,
            thread: Some(thread),
        })
    }

    pub fn poll(&self) -> &EventPoll {
        &self.poll
    }
}

impl Drop for ThreadDispatcher {
    fn drop(&mut self) {
        if let Err(error) = self.stop_event.send() {
            error!(%error, "failed to signal the dispatcher to stop");
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("dispatcher worker panicked");
            }
        }
        if let Err(error) = self.poll.remove_fd(self.stop_event.as_raw_fd()) {
            warn!(%error, "failed to detach the stop event");
        }
    }
}
