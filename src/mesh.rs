//! Triangle meshes and their synchronization into kernel-owned buffers

use crate::device::Device;
use crate::error::{RayLinkError, Result};
use crate::math::Vec3;
use crate::native::{BufferKind, RawScene};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Application-side triangle mesh.
///
/// Buffer sizes are fixed at creation: the kernel allocates its own storage with these
/// counts, so contents may change (through the `modify_*` methods) but lengths may not.
/// Every modification bumps a revision, and each [`Geometry`](crate::Geometry) holding
/// the mesh re-uploads it on its next commit.
#[derive(Debug)]
pub struct Mesh {
    indices: RwLock<Vec<u32>>,
    vertices: RwLock<Vec<Vec3>>,
    /// Vertices at time 1, present only for motion-blurred meshes
    vertices_t1: Option<RwLock<Vec<Vec3>>>,
    triangle_count: usize,
    vertex_count: usize,
    revision: AtomicU64,
}

impl Mesh {
    /// Creates a static mesh.
    ///
    /// # Arguments
    /// * `indices` - Three vertex indices per triangle
    /// * `vertices` - Vertex positions
    ///
    /// # Errors
    /// Returns [`RayLinkError::InvalidMesh`] if there are no triangles or vertices, the
    /// index count is not a multiple of 3, or an index is out of range.
    pub fn new(indices: Vec<u32>, vertices: Vec<Vec3>) -> Result<Self> {
        Self::validate(&indices, &vertices)?;
        Ok(Self::build(indices, vertices, None))
    }

    /// Creates a motion-blurred mesh with vertex positions at time 0 and time 1.
    ///
    /// # Errors
    /// Same as [`new`](Self::new), and the two vertex buffers must have equal length.
    pub fn with_motion(
        indices: Vec<u32>,
        vertices_t0: Vec<Vec3>,
        vertices_t1: Vec<Vec3>,
    ) -> Result<Self> {
        Self::validate(&indices, &vertices_t0)?;
        if vertices_t0.len() != vertices_t1.len() {
            return Err(RayLinkError::InvalidMesh(format!(
                "motion vertex buffers differ in length ({} vs {})",
                vertices_t0.len(),
                vertices_t1.len()
            )));
        }
        Ok(Self::build(indices, vertices_t0, Some(vertices_t1)))
    }

    fn build(indices: Vec<u32>, vertices: Vec<Vec3>, vertices_t1: Option<Vec<Vec3>>) -> Self {
        Self {
            triangle_count: indices.len() / 3,
            vertex_count: vertices.len(),
            indices: RwLock::new(indices),
            vertices: RwLock::new(vertices),
            vertices_t1: vertices_t1.map(RwLock::new),
            revision: AtomicU64::new(0),
        }
    }

    fn validate(indices: &[u32], vertices: &[Vec3]) -> Result<()> {
        if indices.is_empty() || vertices.is_empty() {
            return Err(RayLinkError::InvalidMesh(
                "mesh needs at least one triangle and one vertex".to_string(),
            ));
        }
        if indices.len() % 3 != 0 {
            return Err(RayLinkError::InvalidMesh(format!(
                "index count {} is not a multiple of 3",
                indices.len()
            )));
        }
        check_indices(indices, vertices.len())
    }

    pub fn triangle_count(&self) -> usize {
        self.triangle_count
    }

    pub fn vertex_count(&self) -> usize {
        self.vertex_count
    }

    pub fn has_motion(&self) -> bool {
        self.vertices_t1.is_some()
    }

    /// Number of vertex time steps the kernel must allocate (1 or 2).
    pub fn time_steps(&self) -> usize {
        if self.has_motion() { 2 } else { 1 }
    }

    pub fn indices(&self) -> Vec<u32> {
        self.indices.read().clone()
    }

    pub fn vertices(&self) -> Vec<Vec3> {
        self.vertices.read().clone()
    }

    pub fn vertices_t1(&self) -> Option<Vec<Vec3>> {
        self.vertices_t1.as_ref().map(|v| v.read().clone())
    }

    /// Position of `index` at time 0.
    pub fn vertex(&self, index: u32) -> Option<Vec3> {
        self.vertices.read().get(index as usize).copied()
    }

    /// Vertex indices of a triangle.
    pub fn triangle(&self, primitive: u32) -> Option<[u32; 3]> {
        let indices = self.indices.read();
        let start = primitive as usize * 3;
        indices
            .get(start..start + 3)
            .map(|tri| [tri[0], tri[1], tri[2]])
    }

    /// Edits the time-0 vertices in place. The length must be left unchanged, or the
    /// next commit fails with [`RayLinkError::BufferLengthChanged`].
    pub fn modify_vertices<R>(&self, f: impl FnOnce(&mut Vec<Vec3>) -> R) -> R {
        let result = f(&mut self.vertices.write());
        self.mark_for_upload();
        result
    }

    /// Edits the time-1 vertices of a motion mesh. Returns `None` for static meshes.
    pub fn modify_vertices_t1<R>(&self, f: impl FnOnce(&mut Vec<Vec3>) -> R) -> Option<R> {
        let vertices = self.vertices_t1.as_ref()?;
        let result = f(&mut vertices.write());
        self.mark_for_upload();
        Some(result)
    }

    /// Edits the index buffer. Besides keeping the length, every index must stay below
    /// [`vertex_count`](Self::vertex_count) or the next commit fails with
    /// [`RayLinkError::InvalidMesh`].
    pub fn modify_indices<R>(&self, f: impl FnOnce(&mut Vec<u32>) -> R) -> R {
        let result = f(&mut self.indices.write());
        self.mark_for_upload();
        result
    }

    /// Schedules a re-upload on the next commit without changing any data.
    pub fn mark_for_upload(&self) {
        self.revision.fetch_add(1, Ordering::AcqRel);
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    /// Copies every buffer into the kernel's storage for geometry `geom_id`.
    ///
    /// Lengths and index ranges are validated before anything is mapped, so a failed
    /// check leaves the kernel's copy untouched.
    pub(crate) fn upload(&self, device: &Device, scene: RawScene, geom_id: u32) -> Result<()> {
        let indices = self.indices.read();
        let vertices = self.vertices.read();
        let vertices_t1 = self.vertices_t1.as_ref().map(|v| v.read());

        check_length("index", self.triangle_count * 3, indices.len())?;
        check_length(BufferKind::Vertex0.name(), self.vertex_count, vertices.len())?;
        if let Some(vertices_t1) = &vertices_t1 {
            check_length(BufferKind::Vertex1.name(), self.vertex_count, vertices_t1.len())?;
        }
        // The kernel reads vertices through these without bounds checks.
        check_indices(&indices, self.vertex_count)?;

        write_indices(device, scene, geom_id, &indices)?;
        write_vertices(device, scene, geom_id, BufferKind::Vertex0, &vertices)?;
        if let Some(vertices_t1) = &vertices_t1 {
            write_vertices(device, scene, geom_id, BufferKind::Vertex1, vertices_t1)?;
        }
        Ok(())
    }
}

fn check_length(buffer: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(RayLinkError::BufferLengthChanged {
            buffer,
            expected,
            actual,
        });
    }
    Ok(())
}

fn check_indices(indices: &[u32], vertex_count: usize) -> Result<()> {
    if let Some(index) = indices.iter().find(|&&i| i as usize >= vertex_count) {
        return Err(RayLinkError::InvalidMesh(format!(
            "index {} out of range for {} vertices",
            index, vertex_count
        )));
    }
    Ok(())
}

fn map(device: &Device, scene: RawScene, geom_id: u32, kind: BufferKind) -> Result<*mut u8> {
    let ptr = device.kernel().map_buffer(scene, geom_id, kind);
    device.check_result("map_buffer", ptr.is_null())?;
    Ok(ptr)
}

fn unmap(device: &Device, scene: RawScene, geom_id: u32, kind: BufferKind) -> Result<()> {
    device.kernel().unmap_buffer(scene, geom_id, kind);
    device.check_error("unmap_buffer")
}

fn write_indices(device: &Device, scene: RawScene, geom_id: u32, indices: &[u32]) -> Result<()> {
    let ptr = map(device, scene, geom_id, BufferKind::Index)?.cast::<u32>();
    for (i, &index) in indices.iter().enumerate() {
        // SAFETY: the kernel allocated `triangle_count * 3` indices for this geometry
        // and `indices.len()` was checked against that count.
        unsafe { ptr.add(i).write_unaligned(index) };
    }
    unmap(device, scene, geom_id, BufferKind::Index)
}

fn write_vertices(
    device: &Device,
    scene: RawScene,
    geom_id: u32,
    kind: BufferKind,
    vertices: &[Vec3],
) -> Result<()> {
    let ptr = map(device, scene, geom_id, kind)?.cast::<[f32; 4]>();
    for (i, v) in vertices.iter().enumerate() {
        // SAFETY: as for indices, with four floats per vertex.
        unsafe { ptr.add(i).write_unaligned([v.x, v.y, v.z, 1.0]) };
    }
    unmap(device, scene, geom_id, kind)
}
