//! Mesh collections backed by a native sub-scene

use crate::arena::{GeometryId, IdMap};
use crate::config::{MeshKind, SceneDesc};
use crate::device::Device;
use crate::error::{RayLinkError, Result};
use crate::mesh::Mesh;
use crate::native::{INVALID_ID, RawScene};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
struct MeshEntry {
    mesh: Arc<Mesh>,
    kind: MeshKind,
    /// Mesh revision last copied into the kernel
    uploaded: Option<u64>,
}

#[derive(Debug, Default)]
struct GeometryState {
    meshes: IdMap<MeshEntry>,
    /// `Arc::as_ptr` address to id, for remove-by-reference
    ids: HashMap<usize, GeometryId>,
    /// Slot generations as of the last successful commit; query results are
    /// resolved against these, not against the live map
    committed: HashMap<u32, u32>,
}

/// Outcome of [`Geometry::commit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GeometryCommit {
    /// Change epoch the kernel now reflects
    pub epoch: u64,
    /// Meshes whose buffers were pushed to the kernel
    pub uploads: usize,
}

fn mesh_key(mesh: &Arc<Mesh>) -> usize {
    Arc::as_ptr(mesh) as usize
}

/// A collection of meshes that can be instanced into a [`Scene`](crate::Scene).
///
/// Each `Geometry` owns its own native sub-scene. Meshes receive their native
/// [`GeometryId`] on [`add`](Self::add); buffers are pushed to the kernel when an owning
/// scene commits.
pub struct Geometry {
    device: Device,
    raw: RawScene,
    desc: SceneDesc,
    state: RwLock<GeometryState>,
    /// Bumped by every add and remove
    epoch: AtomicU64,
}

impl Geometry {
    /// Creates an empty geometry.
    ///
    /// # Arguments
    /// * `device` - Device the native sub-scene is created on
    /// * `desc` - Scene flags and traversal widths; the widths must match every scene
    ///   this geometry is added to
    pub fn new(device: &Device, desc: SceneDesc) -> Result<Self> {
        let raw = device
            .kernel()
            .new_scene(device.raw(), desc.flags.bits(), desc.widths.bits());
        device.check_result("new_scene", raw.is_null())?;

        log::debug!(
            "Created geometry scene {} (flags {:?}, widths {:?})",
            raw.0,
            desc.flags,
            desc.widths
        );

        Ok(Self {
            device: device.clone(),
            raw,
            desc,
            state: RwLock::new(GeometryState::default()),
            epoch: AtomicU64::new(0),
        })
    }

    pub fn desc(&self) -> &SceneDesc {
        &self.desc
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Registers a mesh and returns its id.
    ///
    /// The mesh's buffers are uploaded on the next commit of a scene using this
    /// geometry. Scenes instancing this geometry refuse queries until then.
    ///
    /// # Errors
    /// - [`RayLinkError::AlreadyAdded`] if this exact mesh is already registered
    /// - [`RayLinkError::NativeKernel`] if the kernel rejects the mesh
    pub fn add(&self, mesh: Arc<Mesh>, kind: MeshKind) -> Result<GeometryId> {
        let mut state = self.state.write();
        let key = mesh_key(&mesh);
        if let Some(id) = state.ids.get(&key) {
            return Err(RayLinkError::AlreadyAdded(format!("mesh is already {}", id)));
        }

        let raw_id = self.device.kernel().new_triangle_mesh(
            self.raw,
            kind.as_raw(),
            mesh.triangle_count(),
            mesh.vertex_count(),
            mesh.time_steps(),
        );
        self.device.check_result("new_triangle_mesh", raw_id == INVALID_ID)?;

        let entry = MeshEntry {
            mesh,
            kind,
            uploaded: None,
        };
        let generation = match state.meshes.insert_at(raw_id, entry) {
            Ok(generation) => generation,
            Err(_) => {
                // The kernel reissued a live id; undo the native side.
                self.device.kernel().delete_geometry(self.raw, raw_id);
                self.device.check_error("delete_geometry")?;
                return Err(RayLinkError::UnknownNativeId {
                    kind: "geometry",
                    id: raw_id,
                });
            }
        };

        let id = GeometryId::new(raw_id, generation);
        state.ids.insert(key, id);
        self.epoch.fetch_add(1, Ordering::AcqRel);
        log::debug!("Added mesh {} ({:?}) to geometry scene {}", id, kind, self.raw.0);
        Ok(id)
    }

    /// Unregisters a mesh and releases its native geometry.
    ///
    /// Like [`add`](Self::add), this takes effect for queries after the next commit.
    ///
    /// # Errors
    /// Returns [`RayLinkError::NotFound`] if the mesh was never added.
    pub fn remove(&self, mesh: &Arc<Mesh>) -> Result<()> {
        let mut state = self.state.write();
        let key = mesh_key(mesh);
        let Some(&id) = state.ids.get(&key) else {
            return Err(RayLinkError::NotFound(
                "mesh is not part of this geometry".to_string(),
            ));
        };

        self.device.kernel().delete_geometry(self.raw, id.raw());
        self.device.check_error("delete_geometry")?;

        state.ids.remove(&key);
        state.meshes.remove(id.raw(), id.generation());
        self.epoch.fetch_add(1, Ordering::AcqRel);
        log::debug!("Removed mesh {} from geometry scene {}", id, self.raw.0);
        Ok(())
    }

    pub fn mesh(&self, id: GeometryId) -> Option<Arc<Mesh>> {
        self.state
            .read()
            .meshes
            .get(id.raw(), id.generation())
            .map(|entry| entry.mesh.clone())
    }

    pub fn id_of(&self, mesh: &Arc<Mesh>) -> Option<GeometryId> {
        self.state.read().ids.get(&mesh_key(mesh)).copied()
    }

    pub fn kind_of(&self, id: GeometryId) -> Option<MeshKind> {
        self.state
            .read()
            .meshes
            .get(id.raw(), id.generation())
            .map(|entry| entry.kind)
    }

    /// All meshes with their ids, in native id order.
    pub fn meshes(&self) -> Vec<(GeometryId, Arc<Mesh>)> {
        self.state
            .read()
            .meshes
            .iter()
            .map(|(raw, generation, entry)| (GeometryId::new(raw, generation), entry.mesh.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().meshes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn raw(&self) -> RawScene {
        self.raw
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Pushes new or modified meshes to the kernel and commits the sub-scene.
    ///
    /// Per mesh: map/write/unmap every buffer, then `update` if the geometry is
    /// dynamic. The sub-scene commit comes last.
    pub(crate) fn commit(&self) -> Result<GeometryCommit> {
        let mut state = self.state.write();
        let epoch = self.epoch();
        let kernel = self.device.kernel();
        let mut uploads = 0;

        for (raw_id, _, entry) in state.meshes.iter_mut() {
            let revision = entry.mesh.revision();
            if entry.uploaded == Some(revision) {
                continue;
            }
            entry.mesh.upload(&self.device, self.raw, raw_id)?;
            if self.desc.is_dynamic() {
                kernel.update(self.raw, raw_id);
                self.device.check_error("update")?;
            }
            entry.uploaded = Some(revision);
            uploads += 1;
        }

        kernel.commit(self.raw);
        self.device.check_error("commit")?;

        let committed = state
            .meshes
            .iter()
            .map(|(raw_id, generation, _)| (raw_id, generation))
            .collect();
        state.committed = committed;

        log::debug!(
            "Committed geometry scene {}: {} mesh(es), {} uploaded",
            self.raw.0,
            state.meshes.len(),
            uploads
        );
        Ok(GeometryCommit { epoch, uploads })
    }

    /// Mesh for a native id reported by a query.
    ///
    /// Only meshes that were part of the last successful commit resolve; a mesh that
    /// took over the native id of a removed one since then does not.
    pub(crate) fn resolve(&self, raw_id: u32) -> Option<(GeometryId, Arc<Mesh>)> {
        let state = self.state.read();
        let generation = *state.committed.get(&raw_id)?;
        state
            .meshes
            .get(raw_id, generation)
            .map(|entry| (GeometryId::new(raw_id, generation), entry.mesh.clone()))
    }
}

impl Drop for Geometry {
    fn drop(&mut self) {
        self.device.kernel().delete_scene(self.raw);
        if let Err(e) = self.device.check_error("delete_scene") {
            log::warn!("Failed to delete geometry scene {}: {}", self.raw.0, e);
        }
    }
}

impl fmt::Debug for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Geometry")
            .field("raw", &self.raw)
            .field("desc", &self.desc)
            .field("meshes", &self.len())
            .finish()
    }
}
