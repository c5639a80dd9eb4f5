//! Records exchanged with the daemon.
//!
//! Field order is the wire schema; extending a record means extending it on
//! both sides at once.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneId {
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneIds {
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZoneState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Freezing,
    Frozen,
    Thawing,
    Locked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneInfo {
    pub id: String,
    pub vt: i32,
    pub state: ZoneState,
    pub root_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateZoneIn {
    pub id: String,
    pub template_name: String,
}

/// Kind of filesystem node created by a file declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    Directory,
    Fifo,
    Regular,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclareFileIn {
    pub zone: String,
    pub file_type: FileType,
    pub path: String,
    pub flags: i32,
    pub mode: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclareMountIn {
    pub zone: String,
    pub source: String,
    pub target: String,
    pub fs_type: String,
    pub flags: i64,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclareLinkIn {
    pub zone: String,
    pub source: String,
    pub target: String,
}

/// One provisioned resource of a zone, as the daemon stores it after a
/// declare call; replayed on every zone start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProvisionEntry {
    File {
        file_type: FileType,
        path: String,
        flags: i32,
        mode: i32,
    },
    Mount {
        source: String,
        target: String,
        fs_type: String,
        flags: i64,
        data: String,
    },
    Link {
        source: String,
        target: String,
    },
}

/// Identifier of a stored declaration, returned by a declare call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Declaration {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Declarations {
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveDeclarationIn {
    pub zone: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrantDeviceIn {
    pub zone: String,
    pub device: String,
    pub flags: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevokeDeviceIn {
    pub zone: String,
    pub device: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMoveRequestIn {
    pub dest_zone: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMoveRequestStatus {
    pub value: String,
}

/// Payload of the [`NOTIFICATION`](crate::methods::NOTIFICATION) signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub zone: String,
    pub application: String,
    pub message: String,
}
