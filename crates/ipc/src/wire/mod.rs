//! Schema-driven binary codec between typed records and file descriptors.
//!
//! Any `#[derive(Serialize, Deserialize)]` type can travel over the wire; the
//! declared field order *is* the schema, and both peers ship the same record
//! registry so nothing on the wire is self-describing. Encoding rules:
//!
//! - fixed-width integers, floats and `bool` as raw host-endian bytes (the
//!   `*_internet_fd` variants emit big-endian for multi-byte numerics),
//! - strings, byte runs, sequences and maps behind a `u32` length prefix,
//! - tuples and fixed arrays as their elements with no prefix,
//! - enums as a string tag naming the active variant, then that variant's
//!   encoding; an unknown tag fails the load,
//! - nested records as their fields in declared order,
//! - [`FileDescriptor`] fields as a one-byte carrier whose `SCM_RIGHTS`
//!   ancillary block holds the descriptor.
//!
//! The codec never buffers more than a single scalar: data streams directly
//! between the record's storage and the descriptor.

mod de;
mod error;
mod fd;
mod io;
mod ser;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::os::fd::RawFd;

pub use de::Deserializer;
pub use error::{Error, Result};
pub use fd::FileDescriptor;
pub use io::{FdIo, WireRead, WireWrite};
pub use ser::Serializer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ByteOrder {
    Host,
    Network,
}

/// Streams `value` into `out` in host byte order.
pub fn save<T: Serialize + ?Sized>(out: &mut dyn WireWrite, value: &T) -> Result<()> {
    value.serialize(&mut Serializer::new(out))
}

/// Reads one `T` out of `input` in host byte order.
pub fn load<T: DeserializeOwned>(input: &mut dyn WireRead) -> Result<T> {
    T::deserialize(&mut Deserializer::new(input))
}

/// Saves directly to a raw descriptor (socket, pipe or file).
pub fn save_to_fd<T: Serialize + ?Sized>(fd: RawFd, value: &T) -> Result<()> {
    let mut out = FdIo::new(fd);
    save(&mut out, value)
}

/// Loads directly from a raw descriptor.
pub fn load_from_fd<T: DeserializeOwned>(fd: RawFd) -> Result<T> {
    let mut input = FdIo::new(fd);
    load(&mut input)
}

/// Saves with big-endian multi-byte numerics for cross-host transports.
pub fn save_to_internet_fd<T: Serialize + ?Sized>(fd: RawFd, value: &T) -> Result<()> {
    let mut out = FdIo::new(fd);
    value.serialize(&mut Serializer::with_order(&mut out, ByteOrder::Network))
}

/// Loads the big-endian encoding written by [`save_to_internet_fd`].
pub fn load_from_internet_fd<T: DeserializeOwned>(fd: RawFd) -> Result<T> {
    let mut input = FdIo::new(fd);
    T::deserialize(&mut Deserializer::with_order(&mut input, ByteOrder::Network))
}
