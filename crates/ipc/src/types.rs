//! Identifiers and handler vocabulary shared across the runtime.

use std::fmt;
use std::os::fd::RawFd;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Application-assigned method selector. The three highest values are
/// reserved for the reply, signal-registration and error frames.
pub type MethodId = u32;

/// Marks a frame carrying the return value of an earlier request.
pub const RETURN_METHOD_ID: MethodId = MethodId::MAX;

/// Marks the peer-to-peer announcement of signal interest.
pub const REGISTER_SIGNAL_METHOD_ID: MethodId = MethodId::MAX - 1;

/// Marks a reply carrying an error code and message.
pub const ERROR_METHOD_ID: MethodId = MethodId::MAX - 2;

pub(crate) fn is_reserved(method_id: MethodId) -> bool {
    method_id >= ERROR_METHOD_ID
}

/// Identifies one connected peer for the lifetime of its connection.
///
/// Values are 128-bit, drawn from a random source, unique within the process
/// and never recycled. On the wire they travel as their raw byte
/// representation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(u128);

/// Correlates a reply with the request that caused it. Same shape and
/// uniqueness guarantees as [`PeerId`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(u128);

impl PeerId {
    pub(crate) fn generate() -> Self {
        PeerId(Uuid::new_v4().as_u128())
    }
}

impl MessageId {
    pub(crate) fn generate() -> Self {
        MessageId(Uuid::new_v4().as_u128())
    }
}

// Logs show only the leading bits; full ids are too wide to scan.
impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", (self.0 >> 96) as u32)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", (self.0 >> 96) as u32)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({self})")
    }
}

/// Tells the processor whether a handler stays registered after a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerExitCode {
    /// Keep the handler for further frames.
    Success,
    /// Unregister the handler before the next frame is dispatched to it.
    RemoveHandler,
}

/// Callback invoked when a peer joins or leaves a processor.
pub type PeerCallback = dyn Fn(PeerId, RawFd) + Send + Sync;
