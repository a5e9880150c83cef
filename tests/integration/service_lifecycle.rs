// Integration tests for the service lifecycle: start, drain, cancel, restart

use fc_channels::engine::{FieldValue, FormatTag, JobFailure, JobStatus, ServiceError, ServiceStatus};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use crate::common::helpers::*;

#[test]
fn test_start_stop_restart() {
    let service = service_on(unused_udp_addr(), &[]);
    assert_eq!(service.status(), ServiceStatus::Stopped);

    assert_eq!(service.start().unwrap(), ServiceStatus::Listening);
    let first = service.address().expect("listening service has an address");
    assert_eq!(first.name, "FreeCAD");

    assert_eq!(service.stop().unwrap(), ServiceStatus::Stopped);
    assert!(service.address().is_none());

    assert_eq!(service.start().unwrap(), ServiceStatus::Listening);
    assert!(service.address().is_some());
}

#[test]
fn test_port_in_use_leaves_service_stopped() {
    let taken = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();
    let service = service_on(
        unused_udp_addr(),
        &[("bind_port", FieldValue::Number(port as f64))],
    );

    assert!(matches!(
        service.start(),
        Err(ServiceError::BindError { .. })
    ));
    let state = service.state();
    assert_eq!(state.status, ServiceStatus::Stopped);
    assert!(state.last_error.is_some());
}

#[test]
fn test_stop_waits_for_running_job() {
    let discovery = unused_udp_addr();
    let peer = blender_peer(discovery, &[]);
    let sender = service_with(discovery, &[], slow_encoders(Duration::from_millis(300)));
    sender
        .registry()
        .record_endpoint("blender", peer.address().unwrap().socket_addr())
        .unwrap();
    sender.start().unwrap();

    let events = sender.subscribe();
    let handle = sender.submit("blender", FormatTag::Obj, plate()).unwrap();
    assert!(wait_for_status(&events, handle.id, JobStatus::Encoding, Duration::from_secs(2)));

    sender.stop_within(Duration::from_secs(5)).unwrap();

    // Drained, not cancelled
    let report = handle
        .wait_timeout(Duration::from_secs(1))
        .expect("job settled before stop returned");
    assert_eq!(report.status, JobStatus::Done);
    assert_eq!(peer.next_request(Duration::from_secs(1)).unwrap().name, "Plate.obj");
}

#[test]
fn test_stop_cancels_jobs_after_drain_window() {
    let sender = service_with(unused_udp_addr(), &[], slow_encoders(Duration::from_secs(2)));
    sender.start().unwrap();

    let events = sender.subscribe();
    let handle = sender.submit("blender", FormatTag::Obj, plate()).unwrap();
    assert!(wait_for_status(&events, handle.id, JobStatus::Encoding, Duration::from_secs(2)));

    let started = Instant::now();
    sender.stop_within(Duration::from_millis(100)).unwrap();
    let report = handle.wait();

    assert_eq!(report.status, JobStatus::Failed(JobFailure::Cancelled));
    assert!(started.elapsed() < Duration::from_millis(1500));
    assert_eq!(sender.status(), ServiceStatus::Stopped);
}

#[test]
fn test_submit_while_stopping_is_rejected() {
    let sender = service_with(
        unused_udp_addr(),
        &[("discovery_timeout", FieldValue::Number(0.2))],
        slow_encoders(Duration::from_millis(800)),
    );
    sender.start().unwrap();

    let events = sender.subscribe();
    let running = sender.submit("blender", FormatTag::Obj, plate()).unwrap();
    assert!(wait_for_status(&events, running.id, JobStatus::Encoding, Duration::from_secs(2)));

    thread::scope(|scope| {
        let stopping = scope.spawn(|| sender.stop_within(Duration::from_secs(5)));

        let deadline = Instant::now() + Duration::from_secs(2);
        while sender.status() != ServiceStatus::Stopping && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(matches!(
            sender.submit("blender", FormatTag::Obj, plate()),
            Err(ServiceError::Stopping)
        ));

        assert_eq!(stopping.join().unwrap().unwrap(), ServiceStatus::Stopped);
    });

    // Nobody announced "Blender", so the drained job ends in discovery
    assert_eq!(
        running.wait().status,
        JobStatus::Failed(JobFailure::NotFound("blender".into()))
    );
}

#[test]
fn test_preset_change_applies_on_next_start() {
    let service = service_on(unused_udp_addr(), &[]);
    service.start().unwrap();
    assert_eq!(service.address().unwrap().name, "FreeCAD");
    service.stop().unwrap();

    let mut fields = service.presets().get_active().fields.clone();
    fields.insert("service_name".into(), "Workbench".into());
    service.presets().update_current(fields).unwrap();

    service.start().unwrap();
    assert_eq!(service.address().unwrap().name, "Workbench");
}

#[test]
fn test_concurrent_start_binds_once() {
    let port = TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let service = service_on(
        unused_udp_addr(),
        &[("bind_port", FieldValue::Number(port as f64))],
    );

    let results: Vec<_> = thread::scope(|s| {
        let starts: Vec<_> = (0..4).map(|_| s.spawn(|| service.start())).collect();
        starts.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for result in results {
        let status = result.unwrap();
        assert!(
            matches!(status, ServiceStatus::Starting | ServiceStatus::Listening),
            "{:?}",
            status
        );
    }
    assert_eq!(service.status(), ServiceStatus::Listening);
    assert_eq!(service.address().unwrap().port, port);
}

#[test]
fn test_idle_connection_is_counted_and_closed_by_stop() {
    let service = service_on(unused_udp_addr(), &[]);
    service.start().unwrap();
    assert_eq!(service.state().active_connections, 0);

    // Connects but never sends a request
    let _idle = TcpStream::connect(service.address().unwrap().socket_addr()).unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    while service.state().active_connections != 1 {
        assert!(Instant::now() < deadline, "connection never showed up");
        thread::sleep(Duration::from_millis(10));
    }

    let started = Instant::now();
    service.stop_within(Duration::from_millis(200)).unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(service.state().active_connections, 0);
    assert_eq!(service.status(), ServiceStatus::Stopped);
}

#[test]
fn test_stop_releases_listening_port() {
    let service = service_on(unused_udp_addr(), &[]);
    service.start().unwrap();
    let addr = service.address().unwrap().socket_addr();

    service.stop().unwrap();
    assert!(TcpListener::bind(addr).is_ok());
}
