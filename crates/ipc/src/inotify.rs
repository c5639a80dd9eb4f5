//! Filesystem watches multiplexed over one inotify descriptor in the
//! reactor.

use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use nix::errno::Errno;
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify as SysInotify, WatchDescriptor};
use tracing::{debug, warn};

use crate::epoll::{EventPoll, Events};
use crate::error::IpcError;
use crate::lock;

/// Callback invoked with the watched path and the event mask that fired.
pub type WatchCallback = dyn Fn(&Path, AddWatchFlags) + Send + Sync;

struct Watch {
    path: PathBuf,
    descriptor: WatchDescriptor,
    callback: Arc<WatchCallback>,
}

struct Inner {
    system: SysInotify,
    watches: Mutex<Vec<Watch>>,
}

/// Path-to-callback watch registration over a single inotify descriptor
/// plugged into an [`EventPoll`].
pub struct Inotify {
    poll: EventPoll,
    inner: Arc<Inner>,
}

impl Inotify {
    pub fn new(poll: &EventPoll) -> Result<Self, IpcError> {
        let system = SysInotify::init(InitFlags::IN_CLOEXEC | InitFlags::IN_NONBLOCK)?;
        let inner = Arc::new(Inner {
            system,
            watches: Mutex::new(Vec::new()),
        });

        let handler = Arc::downgrade(&inner);
        poll.add_fd(inner.system.as_raw_fd(), Events::EPOLLIN, move |_, _| {
            if let Some(inner) = handler.upgrade() {
                inner.dispatch();
            }
        })?;

        Ok(Inotify {
            poll: poll.clone(),
            inner,
        })
    }

    /// The underlying inotify descriptor.
    pub fn fd(&self) -> RawFd {
        self.inner.system.as_raw_fd()
    }

    /// Watches `path` with `mask`, replacing any previous watch on the same
    /// path.
    pub fn set_handler(
        &self,
        path: impl Into<PathBuf>,
        mask: AddWatchFlags,
        callback: impl Fn(&Path, AddWatchFlags) + Send + Sync + 'static,
    ) -> Result<(), IpcError> {
        let path = path.into();
        let mut watches = lock(&self.inner.watches);
        self.remove_watch_locked(&mut watches, &path);

        let descriptor = self.inner.system.add_watch(&path, mask)?;
        debug!(?path, "watching");
        watches.push(Watch {
            path,
            descriptor,
            callback: Arc::new(callback),
        });
        Ok(())
    }

    /// Stops watching `path`; unknown paths are ignored.
    pub fn remove_handler(&self, path: &Path) {
        let mut watches = lock(&self.inner.watches);
        self.remove_watch_locked(&mut watches, path);
    }

    fn remove_watch_locked(&self, watches: &mut Vec<Watch>, path: &Path) {
        if let Some(index) = watches.iter().position(|watch| watch.path == path) {
            let watch = watches.remove(index);
            if let Err(errno) = self.inner.system.rm_watch(watch.descriptor) {
                warn!(path = ?watch.path, %errno, "failed to remove the watch");
            }
        }
    }
}

impl Inner {
    fn dispatch(&self) {
        let events = match self.system.read_events() {
            Ok(events) => events,
            Err(Errno::EAGAIN) => return,
            Err(errno) => {
                warn!(%errno, "failed to read inotify events");
                return;
            }
        };

        for event in events {
            let target = lock(&self.watches)
                .iter()
                .find(|watch| watch.descriptor == event.wd)
                .map(|watch| (watch.path.clone(), Arc::clone(&watch.callback)));
            if let Some((path, callback)) = target {
                callback(&path, event.mask);
            }
        }
    }
}

impl Drop for Inotify {
    fn drop(&mut self) {
        if let Err(error) = self.poll.remove_fd(self.inner.system.as_raw_fd()) {
            warn!(%error, "failed to detach the inotify descriptor");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use crate::epoll::ThreadDispatcher;

    use super::*;

    #[test]
    fn reports_file_creation_under_a_watched_directory() {
        let dispatcher = ThreadDispatcher::new().expect("dispatcher");
        let watcher = Inotify::new(dispatcher.poll()).expect("inotify");
        let dir = tempfile::tempdir().expect("tempdir");

        let (tx, rx) = mpsc::channel();
        watcher
            .set_handler(dir.path(), AddWatchFlags::IN_CREATE, move |path, mask| {
                let _ = tx.send((path.to_path_buf(), mask));
            })
            .expect("watch");

        std::fs::write(dir.path().join("zone.conf"), b"x").expect("create file");

        let (path, mask) = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("watch fired");
        assert_eq!(path, dir.path());
        assert!(mask.contains(AddWatchFlags::IN_CREATE));

        watcher.remove_handler(dir.path());
    }

    #[test]
    fn removed_handler_stays_silent() {
        let dispatcher = ThreadDispatcher::new().expect("dispatcher");
        let watcher = Inotify::new(dispatcher.poll()).expect("inotify");
        let dir = tempfile::tempdir().expect("tempdir");

        let (tx, rx) = mpsc::channel();
        watcher
            .set_handler(dir.path(), AddWatchFlags::IN_CREATE, move |_, _| {
                let _ = tx.send(());
            })
            .expect("watch");
        watcher.remove_handler(dir.path());

        std::fs::write(dir.path().join("zone.conf"), b"x").expect("create file");
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }
}
