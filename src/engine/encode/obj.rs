use std::fmt::Write;

use super::{EncodeError, FormatEncoder, check_geometry};
use crate::engine::core::{FormatTag, Geometry};

/// Wavefront OBJ, one `o` group per object.
///
/// OBJ indices are 1-based and global to the file, so each object's faces
/// are shifted by the vertices written before it.
pub struct ObjEncoder;

impl FormatEncoder for ObjEncoder {
    fn format(&self) -> FormatTag {
        FormatTag::Obj
    }

    fn encode(&self, geometry: Geometry) -> Result<Vec<u8>, EncodeError> {
        check_geometry(&geometry)?;

        let mut out = String::new();
        out.push_str("# fc-channels OBJ export\n");

        let mut vertex_offset = 1u64;
        let mut normal_offset = 1u64;

        for object in &geometry.objects {
            let _ = writeln!(out, "o {}", object_name(&object.name));
            for [x, y, z] in &object.positions {
                let _ = writeln!(out, "v {} {} {}", x, y, z);
            }
            for [x, y, z] in &object.normals {
                let _ = writeln!(out, "vn {} {} {}", x, y, z);
            }

            let has_normals = !object.normals.is_empty();
            for triangle in &object.triangles {
                out.push('f');
                for &index in triangle {
                    let v = vertex_offset + index as u64;
                    if has_normals {
                        let n = normal_offset + index as u64;
                        let _ = write!(out, " {}//{}", v, n);
                    } else {
                        let _ = write!(out, " {}", v);
                    }
                }
                out.push('\n');
            }

            vertex_offset += object.positions.len() as u64;
            normal_offset += object.normals.len() as u64;
        }

        Ok(out.into_bytes())
    }
}

/// OBJ names end at whitespace
fn object_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect();
    if cleaned.is_empty() {
        "Object".to_string()
    } else {
        cleaned
    }
}
