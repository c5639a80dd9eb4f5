//! Drives a [`HostConnection`] against a stub daemon holding an in-memory
//! zone table.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use zones_ipc::{HandlerExitCode, IpcError, Service, ThreadDispatcher, ValueLatch};

use crate::messages::{
    CreateZoneIn, DeclareFileIn, DeclareLinkIn, DeclareMountIn, Declaration, Declarations,
    FileMoveRequestIn, FileMoveRequestStatus, FileType, GrantDeviceIn, Notification,
    ProvisionEntry, RemoveDeclarationIn, RevokeDeviceIn, ZoneId, ZoneIds, ZoneInfo, ZoneState,
};
use crate::methods;
use crate::{ControlError, HostConnection};

const ERROR_NO_SUCH_ZONE: i32 = -10;

#[derive(Clone)]
struct ZoneRecord {
    state: ZoneState,
    declarations: Vec<(String, ProvisionEntry)>,
}

#[derive(Default)]
struct DaemonState {
    zones: HashMap<String, ZoneRecord>,
    active: Option<String>,
    next_declaration: u32,
}

struct StubDaemon {
    // The service must drop while the dispatcher thread still runs.
    service: Service,
    _dispatcher: ThreadDispatcher,
}

fn with_zone<T>(
    state: &Arc<Mutex<DaemonState>>,
    zone: &str,
    apply: impl FnOnce(&mut ZoneRecord) -> T,
) -> Result<T, IpcError> {
    let mut state = state.lock().expect("daemon state");
    match state.zones.get_mut(zone) {
        Some(record) => Ok(apply(record)),
        None => Err(IpcError::User {
            code: ERROR_NO_SUCH_ZONE,
            message: format!("no such zone: {zone}"),
        }),
    }
}

fn store_declaration(
    state: &Arc<Mutex<DaemonState>>,
    zone: &str,
    entry: ProvisionEntry,
) -> Result<String, IpcError> {
    let id = {
        let mut locked = state.lock().expect("daemon state");
        locked.next_declaration += 1;
        format!("decl-{}", locked.next_declaration)
    };
    let stored = id.clone();
    with_zone(state, zone, move |record| {
        record.declarations.push((stored, entry));
    })?;
    Ok(id)
}

impl StubDaemon {
    fn start(socket_path: &std::path::Path) -> Self {
        let dispatcher = ThreadDispatcher::new().expect("dispatcher");
        let service = Service::new(dispatcher.poll(), socket_path).expect("service");
        let state = Arc::new(Mutex::new(DaemonState::default()));

        let zones = Arc::clone(&state);
        service
            .set_method_handler::<(), ZoneIds, _>(methods::GET_ZONE_IDS, move |_, (), result| {
                let mut values: Vec<String> =
                    zones.lock().expect("state").zones.keys().cloned().collect();
                values.sort();
                result.set(ZoneIds { values });
                Ok(HandlerExitCode::Success)
            })
            .expect("get_zone_ids");

        let zones = Arc::clone(&state);
        service
            .set_method_handler::<(), ZoneId, _>(
                methods::GET_ACTIVE_ZONE_ID,
                move |_, (), result| {
                    let active = zones.lock().expect("state").active.clone().unwrap_or_default();
                    result.set(ZoneId { value: active });
                    Ok(HandlerExitCode::Success)
                },
            )
            .expect("get_active_zone_id");

        let zones = Arc::clone(&state);
        service
            .set_method_handler::<ZoneId, (), _>(methods::SET_ACTIVE_ZONE, move |_, id, result| {
                with_zone(&zones, &id.value, |_| ())?;
                zones.lock().expect("state").active = Some(id.value);
                result.set_void();
                Ok(HandlerExitCode::Success)
            })
            .expect("set_active_zone");

        let zones = Arc::clone(&state);
        service
            .set_method_handler::<ZoneId, ZoneInfo, _>(
                methods::GET_ZONE_INFO,
                move |_, id, result| {
                    let state = with_zone(&zones, &id.value, |record| record.state)?;
                    result.set(ZoneInfo {
                        id: id.value.clone(),
                        vt: 1,
                        state,
                        root_path: format!("/var/lib/zones/{}", id.value),
                    });
                    Ok(HandlerExitCode::Success)
                },
            )
            .expect("get_zone_info");

        let zones = Arc::clone(&state);
        service
            .set_method_handler::<CreateZoneIn, (), _>(
                methods::CREATE_ZONE,
                move |_, request, result| {
                    zones.lock().expect("state").zones.insert(
                        request.id,
                        ZoneRecord {
                            state: ZoneState::Stopped,
                            declarations: Vec::new(),
                        },
                    );
                    result.set_void();
                    Ok(HandlerExitCode::Success)
                },
            )
            .expect("create_zone");

        let zones = Arc::clone(&state);
        service
            .set_method_handler::<ZoneId, (), _>(methods::DESTROY_ZONE, move |_, id, result| {
                with_zone(&zones, &id.value, |_| ())?;
                zones.lock().expect("state").zones.remove(&id.value);
                result.set_void();
                Ok(HandlerExitCode::Success)
            })
            .expect("destroy_zone");

        for (method, target) in [
            (methods::START_ZONE, ZoneState::Running),
            (methods::SHUTDOWN_ZONE, ZoneState::Stopped),
            (methods::LOCK_ZONE, ZoneState::Locked),
            (methods::UNLOCK_ZONE, ZoneState::Running),
            (methods::FREEZE_ZONE, ZoneState::Frozen),
            (methods::UNFREEZE_ZONE, ZoneState::Running),
        ] {
            let zones = Arc::clone(&state);
            service
                .set_method_handler::<ZoneId, (), _>(method, move |_, id, result| {
                    with_zone(&zones, &id.value, |record| record.state = target)?;
                    result.set_void();
                    Ok(HandlerExitCode::Success)
                })
                .expect("state transition");
        }

        let zones = Arc::clone(&state);
        service
            .set_method_handler::<DeclareFileIn, Declaration, _>(
                methods::DECLARE_FILE,
                move |_, request, result| {
                    let id = store_declaration(
                        &zones,
                        &request.zone,
                        ProvisionEntry::File {
                            file_type: request.file_type,
                            path: request.path,
                            flags: request.flags,
                            mode: request.mode,
                        },
                    )?;
                    result.set(Declaration { id });
                    Ok(HandlerExitCode::Success)
                },
            )
            .expect("declare_file");

        let zones = Arc::clone(&state);
        service
            .set_method_handler::<DeclareMountIn, Declaration, _>(
                methods::DECLARE_MOUNT,
                move |_, request, result| {
                    let id = store_declaration(
                        &zones,
                        &request.zone,
                        ProvisionEntry::Mount {
                            source: request.source,
                            target: request.target,
                            fs_type: request.fs_type,
                            flags: request.flags,
                            data: request.data,
                        },
                    )?;
                    result.set(Declaration { id });
                    Ok(HandlerExitCode::Success)
                },
            )
            .expect("declare_mount");

        let zones = Arc::clone(&state);
        service
            .set_method_handler::<DeclareLinkIn, Declaration, _>(
                methods::DECLARE_LINK,
                move |_, request, result| {
                    let id = store_declaration(
                        &zones,
                        &request.zone,
                        ProvisionEntry::Link {
                            source: request.source,
                            target: request.target,
                        },
                    )?;
                    result.set(Declaration { id });
                    Ok(HandlerExitCode::Success)
                },
            )
            .expect("declare_link");

        let zones = Arc::clone(&state);
        service
            .set_method_handler::<ZoneId, Declarations, _>(
                methods::GET_DECLARATIONS,
                move |_, id, result| {
                    let ids = with_zone(&zones, &id.value, |record| {
                        record
                            .declarations
                            .iter()
                            .map(|(id, _)| id.clone())
                            .collect::<Vec<_>>()
                    })?;
                    result.set(Declarations { ids });
                    Ok(HandlerExitCode::Success)
                },
            )
            .expect("get_declarations");

        let zones = Arc::clone(&state);
        service
            .set_method_handler::<GrantDeviceIn, (), _>(
                methods::GRANT_DEVICE,
                move |_, request, result| {
                    with_zone(&zones, &request.zone, |_| ())?;
                    result.set_void();
                    Ok(HandlerExitCode::Success)
                },
            )
            .expect("grant_device");

        let zones = Arc::clone(&state);
        service
            .set_method_handler::<RevokeDeviceIn, (), _>(
                methods::REVOKE_DEVICE,
                move |_, request, result| {
                    with_zone(&zones, &request.zone, |_| ())?;
                    result.set_void();
                    Ok(HandlerExitCode::Success)
                },
            )
            .expect("revoke_device");

        let zones = Arc::clone(&state);
        service
            .set_method_handler::<FileMoveRequestIn, FileMoveRequestStatus, _>(
                methods::FILE_MOVE_REQUEST,
                move |_, request, result| {
                    with_zone(&zones, &request.dest_zone, |_| ())?;
                    result.set(FileMoveRequestStatus {
                        value: "SUCCEEDED".to_string(),
                    });
                    Ok(HandlerExitCode::Success)
                },
            )
            .expect("file_move_request");

        let zones = Arc::clone(&state);
        service
            .set_method_handler::<RemoveDeclarationIn, (), _>(
                methods::REMOVE_DECLARATION,
                move |_, request, result| {
                    with_zone(&zones, &request.zone, |record| {
                        record.declarations.retain(|(id, _)| *id != request.id);
                    })?;
                    result.set_void();
                    Ok(HandlerExitCode::Success)
                },
            )
            .expect("remove_declaration");

        service.start().expect("daemon start");
        StubDaemon {
            service,
            _dispatcher: dispatcher,
        }
    }
}

#[test]
fn zone_lifecycle_over_the_control_surface() {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket = dir.path().join("host.socket");
    let _daemon = StubDaemon::start(&socket);

    let connection = HostConnection::connect(&socket).expect("connect");

    assert!(connection.get_zone_ids().expect("empty list").is_empty());

    connection.create_zone("sandbox", "default").expect("create");
    connection.create_zone("work", "default").expect("create");
    assert_eq!(
        connection.get_zone_ids().expect("ids"),
        vec!["sandbox".to_string(), "work".to_string()]
    );

    connection.start_zone("sandbox").expect("start");
    connection.set_active_zone("sandbox").expect("activate");
    assert_eq!(
        connection.get_active_zone_id().expect("active"),
        "sandbox".to_string()
    );

    let info = connection.get_zone_info("sandbox").expect("info");
    assert_eq!(info.state, ZoneState::Running);
    assert_eq!(info.root_path, "/var/lib/zones/sandbox");

    connection.freeze_zone("sandbox").expect("freeze");
    assert_eq!(
        connection.get_zone_info("sandbox").expect("info").state,
        ZoneState::Frozen
    );
    connection.unfreeze_zone("sandbox").expect("thaw");

    connection.lock_zone("sandbox").expect("lock");
    assert_eq!(
        connection.get_zone_info("sandbox").expect("info").state,
        ZoneState::Locked
    );
    connection.unlock_zone("sandbox").expect("unlock");

    connection.grant_device("sandbox", "/dev/fb0", 0o6).expect("grant");
    connection.revoke_device("sandbox", "/dev/fb0").expect("revoke");
    assert_eq!(
        connection
            .file_move_request("sandbox", "/tmp/report.txt")
            .expect("file move"),
        "SUCCEEDED".to_string()
    );

    connection.shutdown_zone("sandbox").expect("shutdown");
    assert_eq!(
        connection.get_zone_info("sandbox").expect("info").state,
        ZoneState::Stopped
    );

    connection.destroy_zone("work").expect("destroy");
    assert_eq!(
        connection.get_zone_ids().expect("ids"),
        vec!["sandbox".to_string()]
    );
}

#[test]
fn provisioning_declarations_are_stored_and_removed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket = dir.path().join("host.socket");
    let _daemon = StubDaemon::start(&socket);

    let connection = HostConnection::connect(&socket).expect("connect");
    connection.create_zone("sandbox", "default").expect("create");

    let file_id = connection
        .declare_file("sandbox", FileType::Regular, "/dev/null", 0o2, 0o666)
        .expect("declare file");
    let mount_id = connection
        .declare_mount("sandbox", "tmpfs", "/tmp", "tmpfs", 0, "")
        .expect("declare mount");
    let link_id = connection
        .declare_link("sandbox", "/etc/hosts", "/etc/hosts")
        .expect("declare link");

    assert_eq!(
        connection.get_declarations("sandbox").expect("list"),
        vec![file_id.clone(), mount_id.clone(), link_id.clone()]
    );

    connection
        .remove_declaration("sandbox", &file_id)
        .expect("remove");
    assert_eq!(
        connection.get_declarations("sandbox").expect("list"),
        vec![mount_id, link_id]
    );
}

#[test]
fn missing_zones_surface_as_rejections() {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket = dir.path().join("host.socket");
    let _daemon = StubDaemon::start(&socket);

    let connection = HostConnection::connect(&socket).expect("connect");
    match connection.start_zone("ghost") {
        Err(ControlError::Rejected { code, message }) => {
            assert_eq!(code, ERROR_NO_SUCH_ZONE);
            assert!(message.contains("ghost"));
        }
        other => panic!("expected a rejection, got {other:?}"),
    }
}

#[test]
fn notifications_reach_subscribed_connections() {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket = dir.path().join("host.socket");
    let daemon = StubDaemon::start(&socket);

    let connection = HostConnection::connect(&socket).expect("connect");
    let latch: Arc<ValueLatch<Notification>> = Arc::new(ValueLatch::new());
    let fulfil = Arc::clone(&latch);
    connection
        .subscribe_notifications(move |notification| fulfil.set(notification))
        .expect("subscribe");

    // Let the subscription announcement reach the daemon.
    std::thread::sleep(Duration::from_millis(700));

    daemon
        .service
        .signal(
            methods::NOTIFICATION,
            Notification {
                zone: "sandbox".to_string(),
                application: "player".to_string(),
                message: "ping".to_string(),
            },
        )
        .expect("signal");

    let seen = latch
        .get_timeout(Duration::from_millis(1000))
        .expect("notification arrived");
    assert_eq!(seen.zone, "sandbox");
    assert_eq!(seen.application, "player");
    assert_eq!(seen.message, "ping");

    connection.unsubscribe_notifications();
}
