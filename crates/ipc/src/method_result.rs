//! Deferred replies to method calls.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use serde::Serialize;
use tracing::{error, warn};

use crate::processor::{make_serializer, ErrorMessage, Request};
use crate::types::{MessageId, MethodId, PeerId, ERROR_METHOD_ID, RETURN_METHOD_ID};

/// Shared, type-erased state of one outstanding reply.
pub(crate) struct MethodResultInner {
    queue: Weak<crate::queue::RequestQueue<Request>>,
    method_id: MethodId,
    peer_id: PeerId,
    message_id: MessageId,
    fulfilled: AtomicBool,
}

impl MethodResultInner {
    pub(crate) fn new(
        queue: Weak<crate::queue::RequestQueue<Request>>,
        method_id: MethodId,
        peer_id: PeerId,
        message_id: MessageId,
    ) -> Self {
        MethodResultInner {
            queue,
            method_id,
            peer_id,
            message_id,
            fulfilled: AtomicBool::new(false),
        }
    }

    /// Marks the reply as handled elsewhere so dropping it stays silent.
    pub(crate) fn dismiss(&self) {
        self.fulfilled.store(true, Ordering::SeqCst);
    }

    fn reply(&self, request: Request) {
        if self.fulfilled.swap(true, Ordering::SeqCst) {
            error!(
                method_id = self.method_id,
                message_id = %self.message_id,
                "method result fulfilled more than once, dropping the late reply"
            );
            return;
        }
        let Some(queue) = self.queue.upgrade() else {
            warn!(
                method_id = self.method_id,
                "processor is gone, dropping the reply"
            );
            return;
        };
        queue.push_back(request);
    }
}

impl Drop for MethodResultInner {
    fn drop(&mut self) {
        if !self.fulfilled.load(Ordering::SeqCst) {
            error!(
                method_id = self.method_id,
                peer_id = %self.peer_id,
                "method result dropped without a reply, the caller will wait in vain"
            );
        }
    }
}

/// Handle a method handler uses to answer the call, immediately or later
/// from any thread. Clones share the same underlying reply; exactly one
/// fulfilment is expected, and dropping the last clone without one is a
/// logged programming error.
pub struct MethodResult<Out> {
    inner: Arc<MethodResultInner>,
    _out: PhantomData<fn(Out)>,
}

impl<Out> Clone for MethodResult<Out> {
    fn clone(&self) -> Self {
        MethodResult {
            inner: Arc::clone(&self.inner),
            _out: PhantomData,
        }
    }
}

impl<Out> MethodResult<Out>
where
    Out: Serialize + Send + 'static,
{
    pub(crate) fn from_inner(inner: Arc<MethodResultInner>) -> Self {
        MethodResult {
            inner,
            _out: PhantomData,
        }
    }

    /// Schedules the reply payload.
    pub fn set(&self, data: Out) {
        self.inner.reply(Request::SendResult {
            method_id: RETURN_METHOD_ID,
            peer_id: self.inner.peer_id,
            message_id: self.inner.message_id,
            data: Box::new(data),
            serialize: make_serializer::<Out>(),
        });
    }

    /// Schedules an error reply carrying `code` and `message`.
    pub fn set_error(&self, code: i32, message: &str) {
        self.inner.reply(Request::SendResult {
            method_id: ERROR_METHOD_ID,
            peer_id: self.inner.peer_id,
            message_id: self.inner.message_id,
            data: Box::new(ErrorMessage {
                message_id: self.inner.message_id,
                code,
                message: message.to_string(),
            }),
            serialize: make_serializer::<ErrorMessage>(),
        });
    }

    /// The peer that issued the call being answered.
    pub fn peer_id(&self) -> PeerId {
        self.inner.peer_id
    }
}

impl MethodResult<()> {
    /// Indicates completion without data.
    pub fn set_void(&self) {
        self.set(());
    }
}
