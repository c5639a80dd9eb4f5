//! Selector table of the host control protocol.
//!
//! Both the daemon and its clients compile this table in; the wire carries
//! only the numeric values.

use zones_ipc::MethodId;

pub const GET_ZONE_IDS: MethodId = 1;
pub const GET_ACTIVE_ZONE_ID: MethodId = 2;
pub const SET_ACTIVE_ZONE: MethodId = 3;
pub const GET_ZONE_INFO: MethodId = 4;
pub const CREATE_ZONE: MethodId = 5;
pub const DESTROY_ZONE: MethodId = 6;
pub const START_ZONE: MethodId = 7;
pub const SHUTDOWN_ZONE: MethodId = 8;
pub const LOCK_ZONE: MethodId = 9;
pub const UNLOCK_ZONE: MethodId = 10;
pub const FREEZE_ZONE: MethodId = 11;
pub const UNFREEZE_ZONE: MethodId = 12;
pub const GRANT_DEVICE: MethodId = 13;
pub const REVOKE_DEVICE: MethodId = 14;
pub const DECLARE_FILE: MethodId = 15;
pub const DECLARE_MOUNT: MethodId = 16;
pub const DECLARE_LINK: MethodId = 17;
pub const GET_DECLARATIONS: MethodId = 18;
pub const REMOVE_DECLARATION: MethodId = 19;
pub const FILE_MOVE_REQUEST: MethodId = 20;

/// Daemon-to-client signal carrying a [`crate::messages::Notification`].
pub const NOTIFICATION: MethodId = 100;

/// Client-to-daemon signal asking to switch back to the default zone.
pub const SWITCH_TO_DEFAULT: MethodId = 101;
