use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Resolved geometry handed over by the host application for export.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub objects: Vec<MeshObject>,
}

/// A named triangle mesh
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshObject {
    pub name: String,
    pub positions: Vec<[f32; 3]>,
    /// Per-vertex normals; empty when the source has none
    #[serde(default)]
    pub normals: Vec<[f32; 3]>,
    pub triangles: Vec<[u32; 3]>,
}

impl Geometry {
    pub fn new(objects: Vec<MeshObject>) -> Self {
        Self { objects }
    }

    pub fn is_empty(&self) -> bool {
        self.objects.iter().all(|o| o.triangles.is_empty())
    }

    pub fn vertex_count(&self) -> usize {
        self.objects.iter().map(|o| o.positions.len()).sum()
    }

    /// Check that every mesh is internally consistent
    pub fn check(&self) -> Result<(), String> {
        if self.objects.is_empty() {
            return Err("geometry has no objects".to_string());
        }
        for object in &self.objects {
            object.check()?;
        }
        Ok(())
    }

    /// Load geometry from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read geometry file: {}", path.display()))?;
        let geometry: Geometry = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse geometry file: {}", path.display()))?;
        Ok(geometry)
    }
}

impl MeshObject {
    fn check(&self) -> Result<(), String> {
        if !self.normals.is_empty() && self.normals.len() != self.positions.len() {
            return Err(format!(
                "object '{}' has {} normals for {} vertices",
                self.name,
                self.normals.len(),
                self.positions.len()
            ));
        }
        let count = self.positions.len() as u32;
        if let Some(bad) = self.triangles.iter().flatten().find(|&&i| i >= count) {
            return Err(format!(
                "object '{}' references vertex {} but has only {}",
                self.name, bad, count
            ));
        }
        if self.positions.iter().flatten().any(|c| !c.is_finite()) {
            return Err(format!("object '{}' has non-finite coordinates", self.name));
        }
        Ok(())
    }

    /// Unit quad in the XY plane, handy for tests and demos
    pub fn quad(name: &str) -> Self {
        Self {
            name: name.to_string(),
            positions: vec![
                [0.0, 0.0, 0.0],
                [1.0, 0.0, 0.0],
                [1.0, 1.0, 0.0],
                [0.0, 1.0, 0.0],
            ],
            normals: vec![[0.0, 0.0, 1.0]; 4],
            triangles: vec![[0, 1, 2], [0, 2, 3]],
        }
    }
}
