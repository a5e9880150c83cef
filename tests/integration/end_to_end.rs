// End-to-end exports between two services sharing a discovery address

use fc_channels::engine::encode::GltfEncoder;
use fc_channels::engine::protocol::{Reply, Request, read_message, write_message};
use fc_channels::engine::{
    Channels, EncodeError, EncoderSet, FieldValue, FormatEncoder, FormatTag, Geometry,
    JobFailure, JobStatus, ServiceError, ServiceOptions,
};
use std::io::{BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use crate::common::helpers::*;

fn channels_on(discovery: SocketAddr, fields: &[(&str, FieldValue)]) -> Channels {
    Channels::new(
        preset_store(fields),
        ServiceOptions {
            discovery_addr: discovery,
            ..Default::default()
        },
    )
}

#[test]
fn test_send_objects_delivers_identical_obj() {
    let discovery = unused_udp_addr();
    let peer = blender_peer(discovery, &[]);
    let channels = channels_on(discovery, &[]);

    let geometry = two_parts();
    let expected = obj_bytes(&geometry);
    let report = channels
        .send_objects("blender", FormatTag::Obj, geometry)
        .unwrap();

    assert!(report.is_done(), "{:?}", report.status);
    assert_eq!(report.bytes_sent, expected.len() as u64);
    assert_eq!(report.channel, "blender");

    let received = peer.drain_requests();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].source, "FreeCAD");
    assert_eq!(received[0].name, "Base.obj");
    assert_eq!(received[0].format, FormatTag::Obj);
    assert_eq!(received[0].data, expected);
}

#[test]
fn test_send_gltf_reuses_discovered_endpoint() {
    let discovery = unused_udp_addr();
    let peer = blender_peer(discovery, &[]);
    let channels = channels_on(discovery, &[]);

    let first = channels
        .send_objects("blender", FormatTag::Gltf, plate())
        .unwrap();
    assert!(first.is_done());
    let endpoint = channels
        .service()
        .registry()
        .resolve("blender")
        .unwrap()
        .last_known_endpoint;
    assert_eq!(endpoint, Some(peer.address().unwrap().socket_addr()));

    let second = channels
        .send_objects("blender", FormatTag::Gltf, plate())
        .unwrap();
    assert!(second.is_done());

    let received = peer.drain_requests();
    assert_eq!(received.len(), 2);
    let expected = GltfEncoder.encode(plate()).unwrap();
    assert!(received.iter().all(|r| r.data == expected));
    assert_eq!(received[1].name, "Plate.gltf");
}

#[test]
fn test_peer_queue_full_rejects_transfer() {
    let discovery = unused_udp_addr();
    let peer = blender_peer(discovery, &[("queue_size", FieldValue::Number(1.0))]);
    let channels = channels_on(discovery, &[]);

    assert!(
        channels
            .send_objects("blender", FormatTag::Obj, plate())
            .unwrap()
            .is_done()
    );
    let report = channels
        .send_objects("blender", FormatTag::Obj, plate())
        .unwrap();

    assert_eq!(
        report.status,
        JobStatus::Failed(JobFailure::Rejected("queue full".into()))
    );
    assert_eq!(peer.pending_requests(), 1);
}

fn import_header(length: u64) -> Request {
    Request::Import {
        source: "Tester".into(),
        format: FormatTag::Obj,
        name: "part.obj".into(),
        length,
    }
}

#[test]
fn test_full_queue_rejects_before_body_arrives() {
    let discovery = unused_udp_addr();
    let peer = blender_peer(discovery, &[("queue_size", FieldValue::Number(1.0))]);
    let endpoint = peer.address().unwrap().socket_addr();

    let mut first = TcpStream::connect(endpoint).unwrap();
    write_message(&mut first, &import_header(3)).unwrap();
    first.write_all(b"v 1").unwrap();
    let reply: Reply = read_message(&mut BufReader::new(&first)).unwrap();
    assert_eq!(reply, Reply::Accepted);

    // Claims 100 MB but never sends a byte of it
    let mut second = TcpStream::connect(endpoint).unwrap();
    second
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let started = Instant::now();
    write_message(&mut second, &import_header(100_000_000)).unwrap();
    let reply: Reply = read_message(&mut BufReader::new(&second)).unwrap();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(
        reply,
        Reply::Rejected {
            message: "queue full".into()
        }
    );
    assert_eq!(peer.pending_requests(), 1);
}

#[test]
fn test_no_peer_reports_not_found() {
    let channels = channels_on(
        unused_udp_addr(),
        &[("discovery_timeout", FieldValue::Number(0.3))],
    );
    let report = channels
        .send_objects("blender", FormatTag::Obj, plate())
        .unwrap();
    assert_eq!(
        report.status,
        JobStatus::Failed(JobFailure::NotFound("blender".into()))
    );
}

#[test]
fn test_unknown_channel_creates_no_job() {
    let channels = channels_on(unused_udp_addr(), &[]);
    assert!(matches!(
        channels.send_objects("maya", FormatTag::Obj, plate()),
        Err(ServiceError::UnknownChannel(_))
    ));
}

#[test]
fn test_export_dir_keeps_copy_of_sent_file() {
    let discovery = unused_udp_addr();
    let _peer = blender_peer(discovery, &[]);
    let dir = TempDir::new().unwrap();
    let channels = channels_on(
        discovery,
        &[(
            "export_dir",
            FieldValue::Text(dir.path().to_string_lossy().into_owned()),
        )],
    );

    let report = channels
        .send_objects("blender", FormatTag::Obj, plate())
        .unwrap();
    assert!(report.is_done());

    let kept = dir.path().join(format!("{}.obj", report.id));
    assert_eq!(std::fs::read(kept).unwrap(), obj_bytes(&plate()));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
}

struct BrokenEncoder;

impl FormatEncoder for BrokenEncoder {
    fn format(&self) -> FormatTag {
        FormatTag::Obj
    }

    fn encode(&self, _geometry: Geometry) -> Result<Vec<u8>, EncodeError> {
        Err(EncodeError::EncodingFailed("mesh is not manifold".into()))
    }
}

#[test]
fn test_failed_encoding_leaves_export_dir_empty() {
    let dir = TempDir::new().unwrap();
    let mut encoders = EncoderSet::builtin();
    encoders.register(Arc::new(BrokenEncoder));
    let service = service_with(
        unused_udp_addr(),
        &[(
            "export_dir",
            FieldValue::Text(dir.path().to_string_lossy().into_owned()),
        )],
        encoders,
    );

    let report = service
        .submit("blender", FormatTag::Obj, plate())
        .unwrap()
        .wait();
    assert!(matches!(
        report.status,
        JobStatus::Failed(JobFailure::EncodingFailed(_))
    ));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn test_remote_export_request() {
    let discovery = unused_udp_addr();
    let peer = blender_peer(discovery, &[]);
    let host = service_on(discovery, &[]);
    host.start().unwrap();

    let mut stream = TcpStream::connect(host.address().unwrap().socket_addr()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    write_message(
        &mut stream,
        &Request::Export {
            target: "blender".into(),
            format: FormatTag::Obj,
            payload: plate(),
        },
    )
    .unwrap();

    let reply: Reply = read_message(&mut BufReader::new(&stream)).unwrap();
    match reply {
        Reply::Job { report } => assert!(report.is_done(), "{:?}", report.status),
        other => panic!("expected a job report, got {:?}", other),
    }
    let received = peer.next_request(Duration::from_secs(1)).unwrap();
    assert_eq!(received.data, obj_bytes(&plate()));
}
