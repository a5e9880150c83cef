#![allow(dead_code)] // Shared across test binaries that each use a subset

use fc_channels::engine::encode::ObjEncoder;
use fc_channels::engine::{
    ChannelService, EncodeError, EncoderSet, FieldValue, FormatEncoder, FormatTag, Geometry,
    JobMessage, JobStatus, MeshObject, PresetStore, Schema, ServiceOptions,
};
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// In-memory store whose active preset is "Test" with `fields` applied
pub fn preset_store(fields: &[(&str, FieldValue)]) -> Arc<PresetStore> {
    let store = PresetStore::in_memory(Schema::builtin());
    let mut all = store.get_active().fields.clone();
    for (key, value) in fields {
        all.insert(key.to_string(), value.clone());
    }
    store.save_as("Test", all).unwrap();
    store.set_active("Test").unwrap();
    Arc::new(store)
}

/// A UDP address nothing listens on; every test gets its own discovery port
pub fn unused_udp_addr() -> SocketAddr {
    UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap()
}

/// A TCP address that refuses connections
pub fn closed_tcp_addr() -> SocketAddr {
    TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap()
}

/// Service sharing `discovery_addr` with its peers
pub fn service_on(discovery_addr: SocketAddr, fields: &[(&str, FieldValue)]) -> ChannelService {
    service_with(discovery_addr, fields, EncoderSet::builtin())
}

pub fn service_with(
    discovery_addr: SocketAddr,
    fields: &[(&str, FieldValue)],
    encoders: EncoderSet,
) -> ChannelService {
    ChannelService::new(
        preset_store(fields),
        ServiceOptions {
            encoders,
            discovery_addr,
            ..Default::default()
        },
    )
}

/// A started "Blender" peer that announces itself quickly
pub fn blender_peer(discovery_addr: SocketAddr, extra: &[(&str, FieldValue)]) -> ChannelService {
    let mut fields = vec![
        ("service_name", FieldValue::from("Blender")),
        ("announce_interval", FieldValue::Number(0.1)),
    ];
    fields.extend(extra.iter().cloned());
    let peer = service_on(discovery_addr, &fields);
    peer.start().unwrap();
    peer
}

pub fn plate() -> Geometry {
    Geometry::new(vec![MeshObject::quad("Plate")])
}

pub fn two_parts() -> Geometry {
    let mut lid = MeshObject::quad("Lid");
    lid.normals.clear();
    Geometry::new(vec![MeshObject::quad("Base"), lid])
}

pub fn obj_bytes(geometry: &Geometry) -> Vec<u8> {
    ObjEncoder.encode(geometry.clone()).unwrap()
}

/// OBJ encoder that takes its time, for drain and cancel tests
pub struct SlowObjEncoder(pub Duration);

impl FormatEncoder for SlowObjEncoder {
    fn format(&self) -> FormatTag {
        FormatTag::Obj
    }

    fn encode(&self, geometry: Geometry) -> Result<Vec<u8>, EncodeError> {
        thread::sleep(self.0);
        ObjEncoder.encode(geometry)
    }
}

pub fn slow_encoders(delay: Duration) -> EncoderSet {
    let mut encoders = EncoderSet::builtin();
    encoders.register(Arc::new(SlowObjEncoder(delay)));
    encoders
}

/// Block until `job_id` reports `status`, or give up after `timeout`
pub fn wait_for_status(
    events: &crossbeam::channel::Receiver<JobMessage>,
    job_id: Uuid,
    status: JobStatus,
    timeout: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    while let Ok(message) = events.recv_deadline(deadline) {
        if let JobMessage::StatusChanged { job_id: id, status: s } = message {
            if id == job_id && s == status {
                return true;
            }
        }
    }
    false
}
