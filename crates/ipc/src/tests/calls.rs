use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::{
    MethodId, ThreadDispatcher, ERROR_METHOD_ID, REGISTER_SIGNAL_METHOD_ID, RETURN_METHOD_ID,
};

#[test]
fn construction_without_start() {
    let fixture = Fixture::new();
    let _service = Service::new(fixture.poll(), &fixture.socket_path()).expect("service");
    let _client = Client::new(fixture.poll(), &fixture.socket_path()).expect("client");
}

#[test]
fn sync_echo_client_to_service() {
    let fixture = Fixture::new();
    let service = Service::new(fixture.poll(), &fixture.socket_path()).expect("service");
    service
        .set_method_handler::<Payload, Payload, _>(1, echo_handler)
        .expect("method 1");
    service
        .set_method_handler::<Payload, Payload, _>(2, echo_handler)
        .expect("method 2");

    let client = Client::new(fixture.poll(), &fixture.socket_path()).expect("client");
    connect_peer(&service, &client);

    expect_echo(&client, 1);
    expect_echo(&client, 2);
}

#[test]
fn sync_echo_service_to_client() {
    let fixture = Fixture::new();
    let service = Service::new(fixture.poll(), &fixture.socket_path()).expect("service");
    let client = Client::new(fixture.poll(), &fixture.socket_path()).expect("client");
    client
        .set_method_handler::<Payload, Payload, _>(1, echo_handler)
        .expect("method 1");

    let peer_id = connect_peer(&service, &client);
    expect_echo_to_peer(&service, 1, peer_id);
}

#[test]
fn async_echo_client_to_service() {
    let fixture = Fixture::new();
    let service = Service::new(fixture.poll(), &fixture.socket_path()).expect("service");
    service
        .set_method_handler::<Payload, Payload, _>(1, echo_handler)
        .expect("method 1");
    service.start().expect("service start");

    let client = Client::new(fixture.poll(), &fixture.socket_path()).expect("client");
    client.start().expect("client start");

    let latch: Arc<ValueLatch<Result<Payload, IpcError>>> = Arc::new(ValueLatch::new());
    let fulfil = Arc::clone(&latch);
    client
        .call_async::<Payload, Payload, _>(1, Payload { int_val: 34 }, move |reply| {
            fulfil.set(reply)
        })
        .expect("call dispatched");

    let reply = latch.get_timeout(TIMEOUT).expect("completion ran");
    assert_eq!(reply.expect("successful reply"), Payload { int_val: 34 });
}

#[test]
fn async_echo_service_to_client() {
    let fixture = Fixture::new();
    let service = Service::new(fixture.poll(), &fixture.socket_path()).expect("service");
    let client = Client::new(fixture.poll(), &fixture.socket_path()).expect("client");
    client
        .set_method_handler::<Payload, Payload, _>(1, echo_handler)
        .expect("method 1");
    let peer_id = connect_peer(&service, &client);

    let latch: Arc<ValueLatch<Result<Payload, IpcError>>> = Arc::new(ValueLatch::new());
    let fulfil = Arc::clone(&latch);
    service
        .call_async::<Payload, Payload, _>(1, peer_id, Payload { int_val: 56 }, move |reply| {
            fulfil.set(reply)
        })
        .expect("call dispatched");

    let reply = latch.get_timeout(TIMEOUT).expect("completion ran");
    assert_eq!(reply.expect("successful reply"), Payload { int_val: 56 });
}

#[test]
fn method_handlers_can_be_replaced_and_removed() {
    let fixture = Fixture::new();
    let service = Service::new(fixture.poll(), &fixture.socket_path()).expect("service");
    service
        .set_method_handler::<Payload, Payload, _>(1, |_, _, result: MethodResult<Payload>| {
            result.set(Payload { int_val: 0 });
            Ok(HandlerExitCode::Success)
        })
        .expect("first registration");
    service.start().expect("start");

    // Replacing an existing handler is allowed.
    service
        .set_method_handler::<Payload, Payload, _>(1, echo_handler)
        .expect("replacement");
    service
        .set_method_handler::<Payload, Payload, _>(2, echo_handler)
        .expect("method 2");

    let client = Client::new(fixture.poll(), &fixture.socket_path()).expect("client");
    connect_peer(&service, &client);
    expect_echo(&client, 1);

    service.remove_method(1);
    service.remove_method(2);
    // A second removal must be harmless.
    service.remove_method(1);

    let error = client
        .call_sync::<Payload, Payload>(2, Payload { int_val: 1 }, TIMEOUT)
        .expect_err("method is gone");
    assert!(matches!(error, IpcError::NaughtyPeer), "got {error:?}");
}

#[test]
fn client_side_methods_can_be_removed() {
    let fixture = Fixture::new();
    let service = Service::new(fixture.poll(), &fixture.socket_path()).expect("service");
    let client = Client::new(fixture.poll(), &fixture.socket_path()).expect("client");
    client
        .set_method_handler::<Payload, Payload, _>(1, echo_handler)
        .expect("method 1");

    let peer_id = connect_peer(&service, &client);
    expect_echo_to_peer(&service, 1, peer_id);

    client.remove_method(1);
    let error = service
        .call_sync::<Payload, Payload>(1, peer_id, Payload { int_val: 1 }, TIMEOUT)
        .expect_err("method is gone");
    assert!(matches!(error, IpcError::NaughtyPeer), "got {error:?}");
}

#[test]
fn service_start_stop_is_idempotent() {
    let fixture = Fixture::new();
    let service = Service::new(fixture.poll(), &fixture.socket_path()).expect("service");
    service
        .set_method_handler::<Payload, Payload, _>(1, echo_handler)
        .expect("method 1");

    service.start().expect("start");
    service.stop(true);
    service.start().expect("restart");
    service.stop(true);

    service.start().expect("start again");
    service.start().expect("double start");
}

#[test]
fn client_start_stop_is_idempotent() {
    let fixture = Fixture::new();
    let service = Service::new(fixture.poll(), &fixture.socket_path()).expect("service");
    service.start().expect("service start");

    let client = Client::new(fixture.poll(), &fixture.socket_path()).expect("client");
    client.start().expect("start");
    client.stop(true);
    client.start().expect("restart");
    client.stop(true);

    client.start().expect("start again");
    client.start().expect("double start");

    client.stop(true);
    client.stop(true);
}

#[test]
fn restart_drops_old_connections_but_keeps_handlers() {
    let fixture = Fixture::new();
    let service = Service::new(fixture.poll(), &fixture.socket_path()).expect("service");
    service
        .set_method_handler::<Payload, Payload, _>(1, echo_handler)
        .expect("method 1");
    service.start().expect("service start");
    service
        .set_method_handler::<Payload, Payload, _>(2, echo_handler)
        .expect("method 2");

    let client = Client::new(fixture.poll(), &fixture.socket_path()).expect("client");
    client.start().expect("client start");
    expect_echo(&client, 1);
    expect_echo(&client, 2);

    client.stop(true);
    client.start().expect("client restart");
    expect_echo(&client, 1);
    expect_echo(&client, 2);

    service.stop(true);
    service.start().expect("service restart");

    // The old connection died with the service stop.
    assert!(client
        .call_sync::<Payload, Payload>(2, Payload { int_val: 1 }, TIMEOUT)
        .is_err());

    client.stop(true);
    client.start().expect("client reconnect");
    expect_echo(&client, 1);
    expect_echo(&client, 2);
}

#[test]
fn method_result_reports_the_calling_peer() {
    let fixture = Fixture::new();
    let service = Service::new(fixture.poll(), &fixture.socket_path()).expect("service");
    let client = Client::new(fixture.poll(), &fixture.socket_path()).expect("client");
    let peer_id = connect_peer(&service, &client);

    let latch: Arc<ValueLatch<PeerId>> = Arc::new(ValueLatch::new());
    let seen = Arc::clone(&latch);
    service
        .set_method_handler::<Payload, (), _>(1, move |_, _, result| {
            seen.set(result.peer_id());
            result.set_void();
            Ok(HandlerExitCode::Success)
        })
        .expect("method 1");

    client
        .call_sync::<Payload, ()>(1, Payload { int_val: 32 }, TIMEOUT)
        .expect("void reply");
    assert_eq!(latch.get_timeout(TIMEOUT).expect("peer id"), peer_id);
}

#[test]
fn sync_call_times_out_and_drops_the_peer() {
    let server = Fixture::new();
    let service = Service::new(server.poll(), &server.socket_path()).expect("service");
    service
        .set_method_handler::<Payload, Payload, _>(1, |_, data: Payload, result| {
            std::thread::sleep(Duration::from_millis(2200));
            result.set(data);
            Ok(HandlerExitCode::Success)
        })
        .expect("slow method");

    // The client gets its own worker so the slow handler cannot stall the
    // cancellation path.
    let client_dispatcher = ThreadDispatcher::new().expect("client dispatcher");
    let client = Client::new(client_dispatcher.poll(), &server.socket_path()).expect("client");
    connect_peer(&service, &client);

    let error = client
        .call_sync::<Payload, Payload>(1, Payload { int_val: 78 }, TIMEOUT)
        .expect_err("timeout");
    assert!(matches!(error, IpcError::Timeout { method: 1 }), "got {error:?}");

    // The unresponsive peer was removed; further calls fail fast.
    let error = client
        .call_sync::<Payload, Payload>(1, Payload { int_val: 79 }, TIMEOUT)
        .expect_err("disconnected");
    assert!(
        matches!(error, IpcError::PeerDisconnected),
        "got {error:?}"
    );
}

#[test]
fn user_errors_travel_back_to_the_caller() {
    const CODE: i32 = -234;
    const MESSAGE: &str = "Ay, caramba!";

    let fixture = Fixture::new();
    let service = Service::new(fixture.poll(), &fixture.socket_path()).expect("service");
    let client = Client::new(fixture.poll(), &fixture.socket_path()).expect("client");

    // Method 1 fails by returning the error, method 2 by using the result.
    let failing = |_: PeerId, _: Payload, _: MethodResult<Payload>| {
        Err(IpcError::User {
            code: CODE,
            message: MESSAGE.to_string(),
        })
    };
    let replying = |_: PeerId, _: Payload, result: MethodResult<Payload>| {
        result.set_error(CODE, MESSAGE);
        Ok(HandlerExitCode::Success)
    };
    service
        .set_method_handler::<Payload, Payload, _>(1, failing)
        .expect("service method 1");
    service
        .set_method_handler::<Payload, Payload, _>(2, replying)
        .expect("service method 2");
    client
        .set_method_handler::<Payload, Payload, _>(1, failing)
        .expect("client method 1");
    client
        .set_method_handler::<Payload, Payload, _>(2, replying)
        .expect("client method 2");

    let peer_id = connect_peer(&service, &client);
    let assert_user_error = |outcome: Result<Payload, IpcError>| match outcome {
        Err(IpcError::User { code, message }) => {
            assert_eq!(code, CODE);
            assert_eq!(message, MESSAGE);
        }
        other => panic!("expected a user error, got {other:?}"),
    };

    assert_user_error(client.call_sync(1, Payload { int_val: 78 }, TIMEOUT));
    assert_user_error(service.call_sync(1, peer_id, Payload { int_val: 78 }, TIMEOUT));
    assert_user_error(client.call_sync(2, Payload { int_val: 78 }, TIMEOUT));
    assert_user_error(service.call_sync(2, peer_id, Payload { int_val: 78 }, TIMEOUT));
}

#[test]
fn method_results_can_be_fulfilled_from_other_threads() {
    const CODE: i32 = -567;
    const MESSAGE: &str = "Ooo jooo!";
    const DELAY: Duration = Duration::from_millis(10);

    let fixture = Fixture::new();
    let service = Service::new(fixture.poll(), &fixture.socket_path()).expect("service");
    let client = Client::new(fixture.poll(), &fixture.socket_path()).expect("client");

    service
        .set_method_handler::<Payload, Payload, _>(1, |_, _, result| {
            std::thread::spawn(move || {
                std::thread::sleep(DELAY);
                result.set_error(CODE, MESSAGE);
            });
            Ok(HandlerExitCode::Success)
        })
        .expect("deferred error");
    service
        .set_method_handler::<Payload, (), _>(2, |_, _, result| {
            std::thread::spawn(move || {
                std::thread::sleep(DELAY);
                result.set_void();
            });
            Ok(HandlerExitCode::Success)
        })
        .expect("deferred void");
    service
        .set_method_handler::<Payload, Payload, _>(3, |_, data: Payload, result| {
            std::thread::spawn(move || {
                std::thread::sleep(DELAY);
                result.set(data);
            });
            Ok(HandlerExitCode::Success)
        })
        .expect("deferred data");

    connect_peer(&service, &client);

    match client.call_sync::<Payload, Payload>(1, Payload { int_val: 90 }, TIMEOUT) {
        Err(IpcError::User { code, message }) => {
            assert_eq!(code, CODE);
            assert_eq!(message, MESSAGE);
        }
        other => panic!("expected a user error, got {other:?}"),
    }

    client
        .call_sync::<Payload, ()>(2, Payload { int_val: 90 }, TIMEOUT)
        .expect("void reply");

    let echoed: Payload = client
        .call_sync(3, Payload { int_val: 90 }, TIMEOUT)
        .expect("deferred echo");
    assert_eq!(echoed, Payload { int_val: 90 });
}

#[test]
fn reserved_and_conflicting_selectors_are_rejected() {
    let fixture = Fixture::new();
    let service = Service::new(fixture.poll(), &fixture.socket_path()).expect("service");

    for reserved in [RETURN_METHOD_ID, REGISTER_SIGNAL_METHOD_ID, ERROR_METHOD_ID] {
        assert!(matches!(
            service.set_method_handler::<Payload, Payload, _>(reserved, echo_handler),
            Err(IpcError::Configuration(_))
        ));
        assert!(matches!(
            service.set_signal_handler::<Payload, _>(reserved, |_, _| Ok(
                HandlerExitCode::Success
            )),
            Err(IpcError::Configuration(_))
        ));
    }

    const METHOD: MethodId = 5;
    const SIGNAL: MethodId = 6;
    service
        .set_method_handler::<Payload, Payload, _>(METHOD, echo_handler)
        .expect("method");
    service
        .set_signal_handler::<Payload, _>(SIGNAL, |_, _| Ok(HandlerExitCode::Success))
        .expect("signal");

    assert!(matches!(
        service.set_signal_handler::<Payload, _>(METHOD, |_, _| Ok(HandlerExitCode::Success)),
        Err(IpcError::Configuration(_))
    ));
    assert!(matches!(
        service.set_method_handler::<Payload, Payload, _>(SIGNAL, echo_handler),
        Err(IpcError::Configuration(_))
    ));
    assert!(service.is_handled(METHOD));
    assert!(service.is_handled(SIGNAL));
    assert!(!service.is_handled(7));
}

#[test]
fn calls_without_a_connection_fail_fast() {
    let fixture = Fixture::new();
    let _service = Service::new(fixture.poll(), &fixture.socket_path()).expect("service");
    let client = Client::new(fixture.poll(), &fixture.socket_path()).expect("client");

    let error = client
        .call_sync::<Payload, Payload>(1, Payload { int_val: 1 }, TIMEOUT)
        .expect_err("not connected");
    assert!(matches!(error, IpcError::PeerDisconnected));
}
