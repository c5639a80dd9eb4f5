//! End-to-end scenarios driving a real service/client pair over a socket in
//! a temporary directory.

mod calls;
mod descriptors;

use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::epoll::{EventPoll, ThreadDispatcher};
use crate::error::IpcError;
use crate::latch::ValueLatch;
use crate::method_result::MethodResult;
use crate::types::{HandlerExitCode, PeerId};
use crate::{Client, Service};

pub(crate) const TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Payload {
    pub int_val: i32,
}

pub(crate) struct Fixture {
    dispatcher: ThreadDispatcher,
    dir: tempfile::TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        Fixture {
            dispatcher: ThreadDispatcher::new().expect("dispatcher"),
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    pub fn poll(&self) -> &EventPoll {
        self.dispatcher.poll()
    }

    pub fn socket_path(&self) -> PathBuf {
        self.dir.path().join("test.socket")
    }

    pub fn dir(&self) -> &std::path::Path {
        self.dir.path()
    }
}

/// Starts both sides and returns the client's peer id as the service sees
/// it.
pub(crate) fn connect_peer(service: &Service, client: &Client) -> PeerId {
    let latch: Arc<ValueLatch<PeerId>> = Arc::new(ValueLatch::new());
    let fulfil = Arc::clone(&latch);
    service.set_new_peer_callback(Some(move |peer_id: PeerId, _: RawFd| fulfil.set(peer_id)));

    if !service.is_started() {
        service.start().expect("service start");
    }
    client.start().expect("client start");

    let peer_id = latch.get_timeout(TIMEOUT).expect("peer connected");
    service.set_new_peer_callback(None::<fn(PeerId, RawFd)>);
    peer_id
}

pub(crate) fn echo_handler(
    _peer: PeerId,
    data: Payload,
    result: MethodResult<Payload>,
) -> Result<HandlerExitCode, IpcError> {
    result.set(data);
    Ok(HandlerExitCode::Success)
}

pub(crate) fn expect_echo(client: &Client, method_id: crate::MethodId) {
    let sent = Payload { int_val: 34 };
    let received: Payload = client
        .call_sync(method_id, sent.clone(), TIMEOUT)
        .expect("echo reply");
    assert_eq!(received, sent);
}

pub(crate) fn expect_echo_to_peer(service: &Service, method_id: crate::MethodId, peer_id: PeerId) {
    let sent = Payload { int_val: 56 };
    let received: Payload = service
        .call_sync(method_id, peer_id, sent.clone(), TIMEOUT)
        .expect("echo reply");
    assert_eq!(received, sent);
}
