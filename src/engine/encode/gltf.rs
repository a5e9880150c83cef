use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};

use super::{EncodeError, FormatEncoder, check_geometry};
use crate::engine::core::{FormatTag, Geometry, MeshObject};

const FLOAT: u32 = 5126;
const UNSIGNED_INT: u32 = 5125;
const ARRAY_BUFFER: u32 = 34962;
const ELEMENT_ARRAY_BUFFER: u32 = 34963;
const TRIANGLES: u32 = 4;

/// Self-contained glTF 2.0: one mesh and node per object, with all vertex
/// data in a single base64 data-URI buffer.
pub struct GltfEncoder;

impl FormatEncoder for GltfEncoder {
    fn format(&self) -> FormatTag {
        FormatTag::Gltf
    }

    fn encode(&self, geometry: Geometry) -> Result<Vec<u8>, EncodeError> {
        check_geometry(&geometry)?;

        // glTF forbids accessors with a count of zero
        let (drawable, empty): (Vec<&MeshObject>, Vec<&MeshObject>) = geometry
            .objects
            .iter()
            .partition(|o| !o.positions.is_empty() && !o.triangles.is_empty());
        for object in &empty {
            tracing::debug!("Skipping object '{}' without triangles", object.name);
        }
        if drawable.is_empty() {
            return Err(EncodeError::EncodingFailed(
                "no object has any triangles".to_string(),
            ));
        }

        let mut builder = Builder::default();
        let nodes: Vec<usize> = drawable
            .into_iter()
            .map(|object| builder.push_object(object))
            .collect();

        let gltf = json!({
            "asset": {
                "generator": concat!("fc-channels ", env!("CARGO_PKG_VERSION")),
                "version": "2.0"
            },
            "scene": 0,
            "scenes": [{ "nodes": nodes }],
            "nodes": builder.nodes,
            "meshes": builder.meshes,
            "accessors": builder.accessors,
            "bufferViews": builder.views,
            "buffers": [{
                "byteLength": builder.buffer.len(),
                "uri": format!(
                    "data:application/octet-stream;base64,{}",
                    STANDARD.encode(&builder.buffer)
                )
            }]
        });

        serde_json::to_vec(&gltf).map_err(|e| EncodeError::EncodingFailed(e.to_string()))
    }
}

#[derive(Default)]
struct Builder {
    buffer: Vec<u8>,
    views: Vec<Value>,
    accessors: Vec<Value>,
    meshes: Vec<Value>,
    nodes: Vec<Value>,
}

impl Builder {
    /// Append one object and return its node index
    fn push_object(&mut self, object: &MeshObject) -> usize {
        let (min, max) = bounds(&object.positions);
        let position = self.push_vec3(&object.positions, ARRAY_BUFFER);
        self.accessors[position]["min"] = json!(min);
        self.accessors[position]["max"] = json!(max);

        let mut attributes = json!({ "POSITION": position });
        if !object.normals.is_empty() {
            attributes["NORMAL"] = json!(self.push_vec3(&object.normals, ARRAY_BUFFER));
        }

        let indices = self.push_indices(&object.triangles);

        let mesh = self.meshes.len();
        self.meshes.push(json!({
            "name": object.name,
            "primitives": [{
                "attributes": attributes,
                "indices": indices,
                "mode": TRIANGLES
            }]
        }));

        let node = self.nodes.len();
        self.nodes.push(json!({ "name": object.name, "mesh": mesh }));
        node
    }

    fn push_vec3(&mut self, data: &[[f32; 3]], target: u32) -> usize {
        let offset = self.buffer.len();
        for value in data.iter().flatten() {
            self.buffer.extend_from_slice(&value.to_le_bytes());
        }
        self.push_accessor(offset, target, FLOAT, data.len(), "VEC3")
    }

    fn push_indices(&mut self, triangles: &[[u32; 3]]) -> usize {
        let offset = self.buffer.len();
        for index in triangles.iter().flatten() {
            self.buffer.extend_from_slice(&index.to_le_bytes());
        }
        self.push_accessor(
            offset,
            ELEMENT_ARRAY_BUFFER,
            UNSIGNED_INT,
            triangles.len() * 3,
            "SCALAR",
        )
    }

    fn push_accessor(
        &mut self,
        offset: usize,
        target: u32,
        component_type: u32,
        count: usize,
        kind: &str,
    ) -> usize {
        let view = self.views.len();
        self.views.push(json!({
            "buffer": 0,
            "byteOffset": offset,
            "byteLength": self.buffer.len() - offset,
            "target": target
        }));

        let accessor = self.accessors.len();
        self.accessors.push(json!({
            "bufferView": view,
            "byteOffset": 0,
            "componentType": component_type,
            "count": count,
            "type": kind
        }));
        accessor
    }
}

fn bounds(positions: &[[f32; 3]]) -> ([f32; 3], [f32; 3]) {
    if positions.is_empty() {
        return ([0.0; 3], [0.0; 3]);
    }
    let mut min = [f32::MAX; 3];
    let mut max = [f32::MIN; 3];
    for p in positions {
        for axis in 0..3 {
            min[axis] = min[axis].min(p[axis]);
            max[axis] = max[axis].max(p[axis]);
        }
    }
    (min, max)
}
