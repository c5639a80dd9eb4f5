use std::path::Path;
use std::sync::Arc;

use tracing::debug;
use zones_ipc::config::DEFAULT_METHOD_TIMEOUT;
use zones_ipc::{Client, HandlerExitCode, MethodId, ThreadDispatcher};

use crate::error::ControlError;
use crate::messages::{
    CreateZoneIn, DeclareFileIn, DeclareLinkIn, DeclareMountIn, Declaration, Declarations,
    FileMoveRequestIn, FileMoveRequestStatus, FileType, GrantDeviceIn, Notification,
    RemoveDeclarationIn, RevokeDeviceIn, ZoneId, ZoneIds, ZoneInfo,
};
use crate::methods;

/// Connection to the zones daemon over its host control socket.
///
/// Owns a private reactor thread; every method is a synchronous call with
/// the protocol's default timeout. Safe to share behind an `Arc` — the
/// underlying client serializes socket access.
pub struct HostConnection {
    // Declaration order doubles as drop order: the client must wind down
    // while the dispatcher thread still runs.
    client: Client,
    _dispatcher: ThreadDispatcher,
}

impl HostConnection {
    /// Connects to the daemon listening on `path`.
    pub fn connect(path: &Path) -> Result<Self, ControlError> {
        let dispatcher = ThreadDispatcher::new()?;
        let client = Client::new(dispatcher.poll(), path)?;
        client.start()?;
        debug!(?path, "connected to the zones daemon");
        Ok(HostConnection {
            client,
            _dispatcher: dispatcher,
        })
    }

    fn call<In, Out>(&self, method_id: MethodId, data: In) -> Result<Out, ControlError>
    where
        In: serde::Serialize + Send + 'static,
        Out: serde::de::DeserializeOwned + Send + 'static,
    {
        Ok(self
            .client
            .call_sync::<In, Out>(method_id, data, DEFAULT_METHOD_TIMEOUT)?)
    }

    pub fn get_zone_ids(&self) -> Result<Vec<String>, ControlError> {
        let ids: ZoneIds = self.call(methods::GET_ZONE_IDS, ())?;
        Ok(ids.values)
    }

    pub fn get_active_zone_id(&self) -> Result<String, ControlError> {
        let id: ZoneId = self.call(methods::GET_ACTIVE_ZONE_ID, ())?;
        Ok(id.value)
    }

    pub fn set_active_zone(&self, zone: &str) -> Result<(), ControlError> {
        self.call(methods::SET_ACTIVE_ZONE, zone_id(zone))
    }

    pub fn get_zone_info(&self, zone: &str) -> Result<ZoneInfo, ControlError> {
        self.call(methods::GET_ZONE_INFO, zone_id(zone))
    }

    pub fn create_zone(&self, zone: &str, template_name: &str) -> Result<(), ControlError> {
        self.call(
            methods::CREATE_ZONE,
            CreateZoneIn {
                id: zone.to_string(),
                template_name: template_name.to_string(),
            },
        )
    }

    pub fn destroy_zone(&self, zone: &str) -> Result<(), ControlError> {
        self.call(methods::DESTROY_ZONE, zone_id(zone))
    }

    pub fn start_zone(&self, zone: &str) -> Result<(), ControlError> {
        self.call(methods::START_ZONE, zone_id(zone))
    }

    pub fn shutdown_zone(&self, zone: &str) -> Result<(), ControlError> {
        self.call(methods::SHUTDOWN_ZONE, zone_id(zone))
    }

    pub fn lock_zone(&self, zone: &str) -> Result<(), ControlError> {
        self.call(methods::LOCK_ZONE, zone_id(zone))
    }

    pub fn unlock_zone(&self, zone: &str) -> Result<(), ControlError> {
        self.call(methods::UNLOCK_ZONE, zone_id(zone))
    }

    pub fn freeze_zone(&self, zone: &str) -> Result<(), ControlError> {
        self.call(methods::FREEZE_ZONE, zone_id(zone))
    }

    pub fn unfreeze_zone(&self, zone: &str) -> Result<(), ControlError> {
        self.call(methods::UNFREEZE_ZONE, zone_id(zone))
    }

    pub fn grant_device(&self, zone: &str, device: &str, flags: u32) -> Result<(), ControlError> {
        self.call(
            methods::GRANT_DEVICE,
            GrantDeviceIn {
                zone: zone.to_string(),
                device: device.to_string(),
                flags,
            },
        )
    }

    pub fn revoke_device(&self, zone: &str, device: &str) -> Result<(), ControlError> {
        self.call(
            methods::REVOKE_DEVICE,
            RevokeDeviceIn {
                zone: zone.to_string(),
                device: device.to_string(),
            },
        )
    }

    /// Declares a filesystem node to provision; the returned id can later be
    /// passed to [`HostConnection::remove_declaration`].
    pub fn declare_file(
        &self,
        zone: &str,
        file_type: FileType,
        path: &str,
        flags: i32,
        mode: i32,
    ) -> Result<String, ControlError> {
        let declaration: Declaration = self.call(
            methods::DECLARE_FILE,
            DeclareFileIn {
                zone: zone.to_string(),
                file_type,
                path: path.to_string(),
                flags,
                mode,
            },
        )?;
        Ok(declaration.id)
    }

    /// Declares a mount to provision inside the zone.
    pub fn declare_mount(
        &self,
        zone: &str,
        source: &str,
        target: &str,
        fs_type: &str,
        flags: i64,
        data: &str,
    ) -> Result<String, ControlError> {
        let declaration: Declaration = self.call(
            methods::DECLARE_MOUNT,
            DeclareMountIn {
                zone: zone.to_string(),
                source: source.to_string(),
                target: target.to_string(),
                fs_type: fs_type.to_string(),
                flags,
                data: data.to_string(),
            },
        )?;
        Ok(declaration.id)
    }

    /// Declares a hard link to provision inside the zone.
    pub fn declare_link(
        &self,
        zone: &str,
        source: &str,
        target: &str,
    ) -> Result<String, ControlError> {
        let declaration: Declaration = self.call(
            methods::DECLARE_LINK,
            DeclareLinkIn {
                zone: zone.to_string(),
                source: source.to_string(),
                target: target.to_string(),
            },
        )?;
        Ok(declaration.id)
    }

    pub fn get_declarations(&self, zone: &str) -> Result<Vec<String>, ControlError> {
        let declarations: Declarations = self.call(methods::GET_DECLARATIONS, zone_id(zone))?;
        Ok(declarations.ids)
    }

    pub fn remove_declaration(&self, zone: &str, declaration: &str) -> Result<(), ControlError> {
        self.call(
            methods::REMOVE_DECLARATION,
            RemoveDeclarationIn {
                zone: zone.to_string(),
                id: declaration.to_string(),
            },
        )
    }

    pub fn file_move_request(&self, dest_zone: &str, path: &str) -> Result<String, ControlError> {
        let status: FileMoveRequestStatus = self.call(
            methods::FILE_MOVE_REQUEST,
            FileMoveRequestIn {
                dest_zone: dest_zone.to_string(),
                path: path.to_string(),
            },
        )?;
        Ok(status.value)
    }

    /// Subscribes `callback` to daemon notifications. The callback runs on
    /// the connection's reactor thread.
    pub fn subscribe_notifications(
        &self,
        callback: impl Fn(Notification) + Send + Sync + 'static,
    ) -> Result<(), ControlError> {
        let callback = Arc::new(callback);
        self.client
            .set_signal_handler::<Notification, _>(methods::NOTIFICATION, move |_, notification| {
                callback(notification);
                Ok(HandlerExitCode::Success)
            })?;
        Ok(())
    }

    /// Drops the notification subscription installed by
    /// [`HostConnection::subscribe_notifications`].
    pub fn unsubscribe_notifications(&self) {
        self.client.remove_method(methods::NOTIFICATION);
    }

    /// Asks the daemon to bring the default zone to the foreground.
    pub fn signal_switch_to_default(&self) -> Result<(), ControlError> {
        self.client.signal(methods::SWITCH_TO_DEFAULT, ())?;
        Ok(())
    }
}

fn zone_id(zone: &str) -> ZoneId {
    ZoneId {
        value: zone.to_string(),
    }
}
