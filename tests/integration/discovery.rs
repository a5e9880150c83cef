// Integration tests for peer discovery over the UDP announcement channel

use fc_channels::engine::discovery::{Announcer, UdpTransport};
use fc_channels::engine::{
    ChannelRegistry, DiscoveryClient, DiscoveryError, FieldValue, FormatTag, JobFailure,
    JobStatus, ServiceAddress, ServiceError,
};
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::common::helpers::*;

fn client(discovery: SocketAddr) -> (Arc<ChannelRegistry>, DiscoveryClient) {
    let registry = Arc::new(ChannelRegistry::builtin());
    let client = DiscoveryClient::new(registry.clone(), Arc::new(UdpTransport::new(discovery)));
    (registry, client)
}

#[test]
fn test_not_found_after_timeout() {
    let (registry, client) = client(unused_udp_addr());

    let started = Instant::now();
    let err = client.find("blender", Duration::from_secs(2)).unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, DiscoveryError::NotFound { .. }), "{:?}", err);
    assert!(elapsed >= Duration::from_secs(2), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(3), "{:?}", elapsed);
    assert_eq!(
        registry.resolve("blender").unwrap().last_known_endpoint,
        None
    );
}

#[test]
fn test_unknown_channel_does_not_listen() {
    let (_, client) = client(unused_udp_addr());
    assert!(matches!(
        client.find("maya", Duration::from_secs(5)),
        Err(DiscoveryError::UnknownChannel(_))
    ));
}

#[test]
fn test_malformed_announcements_are_ignored() {
    let discovery = unused_udp_addr();
    let (registry, client) = client(discovery);
    let peer: SocketAddr = "127.0.0.1:47001".parse().unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let noise = {
        let stop = stop.clone();
        thread::spawn(move || {
            let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
            let started = Instant::now();
            let valid = ServiceAddress::new("Blender", peer).to_string();
            while !stop.load(Ordering::Relaxed) {
                let _ = socket.send_to(b"\xff\xfe not utf-8", discovery);
                let _ = socket.send_to(b"_freecad_channels._tcp.local.:Blender", discovery);
                let _ = socket.send_to(b"_http._tcp.local.:Blender@127.0.0.1:1", discovery);
                let _ = socket.send_to(
                    b"_freecad_channels._tcp.local.:FreeCAD@127.0.0.1:47000",
                    discovery,
                );
                // Real announcement only once the listener had a chance to see the noise
                if started.elapsed() > Duration::from_millis(300) {
                    let _ = socket.send_to(valid.as_bytes(), discovery);
                }
                thread::sleep(Duration::from_millis(20));
            }
        })
    };

    let found = client.find("blender", Duration::from_secs(3));
    stop.store(true, Ordering::Relaxed);
    noise.join().unwrap();

    assert_eq!(found.unwrap(), peer);
    assert_eq!(
        registry.resolve("blender").unwrap().last_known_endpoint,
        Some(peer)
    );
}

#[test]
fn test_announcer_reaches_discovery_client() {
    let discovery = unused_udp_addr();
    let peer: SocketAddr = "127.0.0.1:47002".parse().unwrap();
    let mut announcer = Announcer::spawn(discovery, Duration::from_millis(50)).unwrap();
    announcer.register(ServiceAddress::new("Blender", peer));

    let (_, client) = client(discovery);
    assert_eq!(client.find("blender", Duration::from_secs(2)).unwrap(), peer);

    announcer.unregister("Blender");
    announcer.shutdown();
}

#[test]
fn test_service_finds_started_peer() {
    let discovery = unused_udp_addr();
    let peer = blender_peer(discovery, &[]);
    let expected = peer.address().unwrap().socket_addr();

    let sender = service_on(discovery, &[]);
    assert_eq!(sender.find("blender", Duration::from_secs(3)).unwrap(), expected);
    assert_eq!(
        sender.registry().resolve("blender").unwrap().last_known_endpoint,
        Some(expected)
    );
}

#[test]
fn test_stopped_peer_is_not_found() {
    let discovery = unused_udp_addr();
    let peer = blender_peer(discovery, &[]);
    peer.stop().unwrap();

    let sender = service_on(discovery, &[]);
    assert!(matches!(
        sender.find("blender", Duration::from_millis(500)),
        Err(ServiceError::Discovery(DiscoveryError::NotFound { .. }))
    ));
}

#[test]
fn test_concurrent_lookups_share_the_discovery_address() {
    let discovery = unused_udp_addr();

    let results: Vec<_> = thread::scope(|s| {
        let lookups: Vec<_> = (0..2)
            .map(|_| s.spawn(move || client(discovery).1.find("blender", Duration::from_millis(500))))
            .collect();
        lookups.into_iter().map(|h| h.join().unwrap()).collect()
    });
    for result in &results {
        assert!(
            matches!(result, Err(DiscoveryError::NotFound { .. })),
            "{:?}",
            result
        );
    }

    let peer: SocketAddr = "127.0.0.1:47003".parse().unwrap();
    let mut announcer = Announcer::spawn(discovery, Duration::from_millis(50)).unwrap();
    announcer.register(ServiceAddress::new("Blender", peer));
    let found: Vec<_> = thread::scope(|s| {
        let lookups: Vec<_> = (0..3)
            .map(|_| s.spawn(move || client(discovery).1.find("blender", Duration::from_secs(2))))
            .collect();
        lookups.into_iter().map(|h| h.join().unwrap()).collect()
    });
    announcer.shutdown();

    for result in found {
        assert_eq!(result.unwrap(), peer);
    }
}

#[test]
fn test_concurrent_jobs_both_report_not_found() {
    let sender = service_on(
        unused_udp_addr(),
        &[("discovery_timeout", FieldValue::Number(0.5))],
    );
    let first = sender.submit("blender", FormatTag::Obj, plate()).unwrap();
    let second = sender.submit("blender", FormatTag::Obj, plate()).unwrap();

    for handle in [first, second] {
        let report = handle.wait_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(
            report.status,
            JobStatus::Failed(JobFailure::NotFound("blender".into()))
        );
    }
}
