use std::fmt;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

use serde::de::{self, Deserialize, Deserializer, Visitor};
use serde::ser::{Serialize, Serializer};

/// Format-internal marker: a newtype struct with this name is a descriptor,
/// not an integer field.
pub(crate) const FD_TOKEN: &str = "$zones-ipc/fd";

/// An owned file descriptor embedded in a record.
///
/// Saving a record containing one emits no payload bytes; the descriptor
/// rides in the ancillary data of a one-byte carrier. Loading consumes that
/// carrier and takes ownership of the received descriptor, so the sender may
/// close its copy as soon as the save returns.
pub struct FileDescriptor(OwnedFd);

impl FileDescriptor {
    pub fn new(fd: OwnedFd) -> Self {
        FileDescriptor(fd)
    }

    pub fn into_inner(self) -> OwnedFd {
        self.0
    }
}

impl From<OwnedFd> for FileDescriptor {
    fn from(fd: OwnedFd) -> Self {
        FileDescriptor(fd)
    }
}

impl AsFd for FileDescriptor {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl AsRawFd for FileDescriptor {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl fmt::Debug for FileDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileDescriptor({})", self.0.as_raw_fd())
    }
}

impl Serialize for FileDescriptor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_newtype_struct(FD_TOKEN, &self.0.as_raw_fd())
    }
}

struct FdVisitor;

impl<'de> Visitor<'de> for FdVisitor {
    type Value = FileDescriptor;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a file descriptor")
    }

    fn visit_i32<E: de::Error>(self, raw: i32) -> Result<Self::Value, E> {
        if raw < 0 {
            return Err(E::custom("received an invalid file descriptor"));
        }
        // The deserializer hands over a descriptor it just received and owns
        // nothing else references it yet.
        Ok(FileDescriptor(unsafe { OwnedFd::from_raw_fd(raw) }))
    }
}

impl<'de> Deserialize<'de> for FileDescriptor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_newtype_struct(FD_TOKEN, FdVisitor)
    }
}

impl IntoRawFd for FileDescriptor {
    fn into_raw_fd(self) -> RawFd {
        self.0.into_raw_fd()
    }
}
