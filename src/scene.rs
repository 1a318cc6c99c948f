//! Top-level scenes: instancing, commit and the query families

use crate::arena::{IdMap, InstanceId};
use crate::config::SceneDesc;
use crate::device::Device;
use crate::error::{RayLinkError, Result};
use crate::geometry::Geometry;
use crate::instance::Instance;
use crate::math::{self, Vec3};
use crate::native::{INVALID_ID, MatrixLayout, RawScene};
use crate::packet::{Intersection, PacketBuffer, PacketWidth, QueryScratch, Ray, W1, W4, W8, W16};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommitState {
    Never,
    Clean,
    Dirty,
}

/// A native top-level scene of instanced [`Geometry`](crate::Geometry).
///
/// Mutations (`add`, `delete`, `commit`) take `&mut self`; queries take `&self` plus a
/// per-thread [`QueryScratch`], so a committed scene can be shared across worker
/// threads.
///
/// The borrow checker only covers the scene itself. Geometries and meshes are shared
/// through `Arc` and change through `&self`: [`Geometry::add`], [`Geometry::remove`],
/// the `Mesh::modify_*` methods and the commit of any other scene using the same
/// geometry. Callers must not run those while queries against this scene are in
/// flight. Membership changes on a geometry are detected, and queries fail with
/// [`RayLinkError::NotCommitted`] until this scene commits again.
///
/// # Example
///
/// ```
/// use raylink::{
///     Device, Geometry, GeometryInstance, Mesh, MeshKind, QueryScratch, Ray, Scene, SceneDesc,
///     Vec3,
/// };
/// use std::sync::Arc;
///
/// let device = Device::create(false)?;
/// let geometry = Arc::new(Geometry::new(&device, SceneDesc::default())?);
/// let mesh = Arc::new(Mesh::new(vec![0, 1, 2], vec![Vec3::ZERO, Vec3::X, Vec3::Y])?);
/// geometry.add(mesh, MeshKind::Static)?;
///
/// let mut scene = Scene::new(&device, SceneDesc::default())?;
/// scene.add(Arc::new(GeometryInstance::new(geometry)))?;
/// scene.commit()?;
///
/// let mut scratch = QueryScratch::new();
/// let ray = Ray::new(Vec3::new(0.25, 0.25, -1.0), Vec3::Z);
/// let hit = scene.intersect1(&mut scratch, &ray)?.expect("ray hits the triangle");
/// assert!((hit.distance - 1.0).abs() < 1e-5);
/// # Ok::<(), raylink::RayLinkError>(())
/// ```
pub struct Scene<I: Instance> {
    device: Device,
    raw: RawScene,
    desc: SceneDesc,
    instances: IdMap<Arc<I>>,
    /// `Arc::as_ptr` address to id, for delete-by-reference
    ids: HashMap<usize, InstanceId>,
    state: CommitState,
    /// Each distinct geometry with its epoch as of the last successful commit
    geometries: Vec<(Arc<Geometry>, u64)>,
}

fn instance_key<I>(instance: &Arc<I>) -> usize {
    Arc::as_ptr(instance) as usize
}

impl<I: Instance> Scene<I> {
    /// Creates an empty scene.
    ///
    /// # Arguments
    /// * `device` - Device the native scene is created on
    /// * `desc` - Scene flags and the traversal widths queries may use
    pub fn new(device: &Device, desc: SceneDesc) -> Result<Self> {
        let raw = device
            .kernel()
            .new_scene(device.raw(), desc.flags.bits(), desc.widths.bits());
        device.check_result("new_scene", raw.is_null())?;

        log::debug!(
            "Created scene {} (flags {:?}, widths {:?})",
            raw.0,
            desc.flags,
            desc.widths
        );

        Ok(Self {
            device: device.clone(),
            raw,
            desc,
            instances: IdMap::new(),
            ids: HashMap::new(),
            state: CommitState::Never,
            geometries: Vec::new(),
        })
    }

    pub fn desc(&self) -> &SceneDesc {
        &self.desc
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Places an instance into the scene.
    ///
    /// # Errors
    /// - [`RayLinkError::IncompatibleConfiguration`] if the instance's geometry uses
    ///   different traversal widths or another device; the scene is left unchanged
    /// - [`RayLinkError::AlreadyAdded`] if this exact instance is already placed
    /// - [`RayLinkError::NativeKernel`] if the kernel rejects the instance
    pub fn add(&mut self, instance: Arc<I>) -> Result<InstanceId> {
        let geometry = instance.geometry();
        if geometry.desc().widths != self.desc.widths {
            return Err(RayLinkError::IncompatibleConfiguration(format!(
                "geometry widths {:?} differ from scene widths {:?}",
                geometry.desc().widths,
                self.desc.widths
            )));
        }
        if !geometry.device().same_device(&self.device) {
            return Err(RayLinkError::IncompatibleConfiguration(
                "geometry was created on a different device".to_string(),
            ));
        }

        let key = instance_key(&instance);
        if let Some(id) = self.ids.get(&key) {
            return Err(RayLinkError::AlreadyAdded(format!("instance is already {}", id)));
        }

        let raw_id = self.device.kernel().new_instance(self.raw, geometry.raw());
        self.device.check_result("new_instance", raw_id == INVALID_ID)?;

        let generation = match self.instances.insert_at(raw_id, instance) {
            Ok(generation) => generation,
            Err(_) => {
                self.device.kernel().delete_geometry(self.raw, raw_id);
                self.device.check_error("delete_geometry")?;
                return Err(RayLinkError::UnknownNativeId {
                    kind: "instance",
                    id: raw_id,
                });
            }
        };

        let id = InstanceId::new(raw_id, generation);
        self.ids.insert(key, id);
        self.state = CommitState::Dirty;
        log::debug!("Added instance {} to scene {}", id, self.raw.0);
        Ok(id)
    }

    /// Removes an instance and releases its native counterpart.
    ///
    /// # Errors
    /// Returns [`RayLinkError::NotFound`] if the instance is not in this scene.
    pub fn delete(&mut self, instance: &Arc<I>) -> Result<()> {
        let key = instance_key(instance);
        let Some(&id) = self.ids.get(&key) else {
            return Err(RayLinkError::NotFound(
                "instance is not part of this scene".to_string(),
            ));
        };

        self.device.kernel().delete_geometry(self.raw, id.raw());
        self.device.check_error("delete_geometry")?;

        self.ids.remove(&key);
        self.instances.remove(id.raw(), id.generation());
        self.state = CommitState::Dirty;
        log::debug!("Deleted instance {} from scene {}", id, self.raw.0);
        Ok(())
    }

    pub fn instance(&self, id: InstanceId) -> Option<&Arc<I>> {
        self.instances.get(id.raw(), id.generation())
    }

    pub fn id_of(&self, instance: &Arc<I>) -> Option<InstanceId> {
        self.ids.get(&instance_key(instance)).copied()
    }

    /// Instances in native id order.
    pub fn instances(&self) -> impl Iterator<Item = (InstanceId, &Arc<I>)> {
        self.instances
            .iter()
            .map(|(raw, generation, instance)| (InstanceId::new(raw, generation), instance))
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Whether queries are currently allowed.
    ///
    /// False once an instanced geometry gained or lost a mesh since the last commit.
    pub fn is_committed(&self) -> bool {
        self.state == CommitState::Clean
            && self
                .geometries
                .iter()
                .all(|(geometry, epoch)| geometry.epoch() == *epoch)
    }

    /// Synchronizes every instance and its geometry into the kernel.
    ///
    /// For each instance: commit its geometry (once per geometry), upload the
    /// transform, apply the enabled flag and, for dynamic scenes, flag it for update.
    /// The top-level scene is committed last. Safe to call repeatedly.
    ///
    /// The native protocol has no transactions: if a step fails, geometries committed
    /// before it keep their new state. The scene then refuses queries until a later
    /// commit succeeds.
    pub fn commit(&mut self) -> Result<()> {
        self.state = CommitState::Dirty;
        self.geometries.clear();
        let kernel = self.device.kernel();
        let mut committed: Vec<(Arc<Geometry>, u64)> = Vec::new();

        for (raw_id, _, instance) in self.instances.iter() {
            let geometry = instance.geometry();
            if !committed.iter().any(|(seen, _)| Arc::ptr_eq(seen, geometry)) {
                let summary = geometry.commit()?;
                committed.push((geometry.clone(), summary.epoch));
            }

            let xfm = math::to_column_major(&instance.transform());
            kernel.set_transform(self.raw, raw_id, MatrixLayout::ColumnMajor, &xfm);
            self.device.check_error("set_transform")?;

            if instance.enabled() {
                kernel.enable(self.raw, raw_id);
                self.device.check_error("enable")?;
            } else {
                kernel.disable(self.raw, raw_id);
                self.device.check_error("disable")?;
            }

            if self.desc.is_dynamic() {
                kernel.update(self.raw, raw_id);
                self.device.check_error("update")?;
            }
        }

        kernel.commit(self.raw);
        self.device.check_error("commit")?;

        log::debug!(
            "Committed scene {}: {} instance(s), {} geometr(ies)",
            self.raw.0,
            self.instances.len(),
            committed.len()
        );
        self.geometries = committed;
        self.state = CommitState::Clean;
        Ok(())
    }

    /// Closest hit for a single ray.
    pub fn intersect1(
        &self,
        scratch: &mut QueryScratch,
        ray: &Ray,
    ) -> Result<Option<Intersection<I>>> {
        let mut hits = self.intersect::<W1>(scratch, std::slice::from_ref(ray))?;
        Ok(hits.pop().flatten())
    }

    /// Closest hits for up to 4 rays, one result per ray.
    pub fn intersect4(
        &self,
        scratch: &mut QueryScratch,
        rays: &[Ray],
    ) -> Result<Vec<Option<Intersection<I>>>> {
        self.intersect::<W4>(scratch, rays)
    }

    pub fn intersect8(
        &self,
        scratch: &mut QueryScratch,
        rays: &[Ray],
    ) -> Result<Vec<Option<Intersection<I>>>> {
        self.intersect::<W8>(scratch, rays)
    }

    pub fn intersect16(
        &self,
        scratch: &mut QueryScratch,
        rays: &[Ray],
    ) -> Result<Vec<Option<Intersection<I>>>> {
        self.intersect::<W16>(scratch, rays)
    }

    /// Whether anything lies between `ray.near` and `ray.far`.
    pub fn occluded1(&self, scratch: &mut QueryScratch, ray: &Ray) -> Result<bool> {
        let hits = self.occluded::<W1>(scratch, std::slice::from_ref(ray))?;
        Ok(hits.first().copied().unwrap_or(false))
    }

    pub fn occluded4(&self, scratch: &mut QueryScratch, rays: &[Ray]) -> Result<Vec<bool>> {
        self.occluded::<W4>(scratch, rays)
    }

    pub fn occluded8(&self, scratch: &mut QueryScratch, rays: &[Ray]) -> Result<Vec<bool>> {
        self.occluded::<W8>(scratch, rays)
    }

    pub fn occluded16(&self, scratch: &mut QueryScratch, rays: &[Ray]) -> Result<Vec<bool>> {
        self.occluded::<W16>(scratch, rays)
    }

    /// Closest hits at packet width `W`.
    ///
    /// # Errors
    /// - [`RayLinkError::UnsupportedTraversalWidth`] if the scene was not created
    ///   with width `W`
    /// - [`RayLinkError::TooManyRays`] if `rays` does not fit in one packet
    /// - [`RayLinkError::NotCommitted`] if the scene or one of its geometries changed
    ///   since its last commit
    /// - [`RayLinkError::UnknownNativeId`] if the kernel reports an id this scene
    ///   never issued
    pub fn intersect<W: PacketWidth>(
        &self,
        scratch: &mut QueryScratch,
        rays: &[Ray],
    ) -> Result<Vec<Option<Intersection<I>>>> {
        let buffer = self.trace::<W>(scratch, rays, false)?;
        (0..rays.len())
            .map(|lane| {
                if buffer.is_active(lane) {
                    self.decode(buffer, lane)
                } else {
                    Ok(None)
                }
            })
            .collect()
    }

    /// Occlusion at packet width `W`; errors as for [`intersect`](Self::intersect).
    pub fn occluded<W: PacketWidth>(
        &self,
        scratch: &mut QueryScratch,
        rays: &[Ray],
    ) -> Result<Vec<bool>> {
        let buffer = self.trace::<W>(scratch, rays, true)?;
        Ok((0..rays.len())
            .map(|lane| buffer.is_active(lane) && buffer.geom_id(lane) != INVALID_ID)
            .collect())
    }

    fn trace<'s, W: PacketWidth>(
        &self,
        scratch: &'s mut QueryScratch,
        rays: &[Ray],
        occlusion: bool,
    ) -> Result<&'s PacketBuffer<W>> {
        // Tracing at a width the kernel was not built for is undefined behavior.
        if !self.desc.widths.contains(W::flag()) {
            return Err(RayLinkError::UnsupportedTraversalWidth(W::WIDTH));
        }
        if rays.len() > W::WIDTH as usize {
            return Err(RayLinkError::TooManyRays {
                width: W::WIDTH,
                count: rays.len(),
            });
        }
        if !self.is_committed() {
            return Err(RayLinkError::NotCommitted);
        }

        let buffer = scratch.buffer::<W>();
        if buffer.encode(rays) == 0 {
            return Ok(&*buffer);
        }

        let kernel = self.device.kernel();
        if occlusion {
            buffer.occlude(kernel, self.raw);
            self.device.check_error("occluded")?;
        } else {
            buffer.intersect(kernel, self.raw);
            self.device.check_error("intersect")?;
        }
        Ok(&*buffer)
    }

    fn decode<W: PacketWidth>(
        &self,
        buffer: &PacketBuffer<W>,
        lane: usize,
    ) -> Result<Option<Intersection<I>>> {
        // The sentinel check comes before any other field is read.
        if buffer.geom_id(lane) == INVALID_ID {
            return Ok(None);
        }
        let hit = buffer.hit(lane);

        let unknown_instance = RayLinkError::UnknownNativeId {
            kind: "instance",
            id: hit.inst_id,
        };
        let Some(generation) = self.instances.generation(hit.inst_id) else {
            return Err(unknown_instance);
        };
        let Some(instance) = self.instances.get(hit.inst_id, generation) else {
            return Err(unknown_instance);
        };
        let Some((geometry_id, mesh)) = instance.geometry().resolve(hit.geom_id) else {
            return Err(RayLinkError::UnknownNativeId {
                kind: "geometry",
                id: hit.geom_id,
            });
        };

        Ok(Some(Intersection {
            distance: hit.tfar,
            primitive: hit.prim_id,
            mesh,
            instance: instance.clone(),
            geometry_id,
            instance_id: InstanceId::new(hit.inst_id, generation),
            u: hit.u,
            v: hit.v,
            normal: Vec3::from_array(hit.ng),
        }))
    }
}

impl<I: Instance> Drop for Scene<I> {
    fn drop(&mut self) {
        self.device.kernel().delete_scene(self.raw);
        if let Err(e) = self.device.check_error("delete_scene") {
            log::warn!("Failed to delete scene {}: {}", self.raw.0, e);
        }
    }
}

impl<I: Instance> fmt::Debug for Scene<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scene")
            .field("raw", &self.raw)
            .field("desc", &self.desc)
            .field("instances", &self.instances.len())
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceDesc, MeshKind, TraversalWidths};
    use crate::error::ErrorKind;
    use crate::geometry::Geometry;
    use crate::instance::GeometryInstance;
    use crate::mesh::Mesh;
    use crate::native::{
        BufferKind, NativeKernel, RawDevice, RawMask4, RawMask8, RawMask16, RawRay1, RawRay4,
        RawRay8, RawRay16, SoftwareKernel,
    };

    /// Software kernel whose queries leave every lane at "no hit" and scribble over
    /// all other output fields.
    struct BlindKernel(SoftwareKernel);

    fn scribble<P: crate::native::RayPacket>(packet: &mut P) {
        for lane in 0..P::LANES {
            packet.set_hit(
                lane,
                &crate::native::RawHitLane {
                    tfar: f32::NAN,
                    ng: [f32::NAN; 3],
                    u: f32::NAN,
                    v: f32::NAN,
                    geom_id: INVALID_ID,
                    prim_id: 12345,
                    inst_id: 54321,
                },
            );
        }
    }

    impl NativeKernel for BlindKernel {
        fn name(&self) -> &str {
            "blind"
        }
        fn new_device(&self, config: &str) -> RawDevice {
            self.0.new_device(config)
        }
        fn delete_device(&self, device: RawDevice) {
            self.0.delete_device(device)
        }
        fn device_error(&self, device: RawDevice) -> u32 {
            self.0.device_error(device)
        }
        fn new_scene(&self, device: RawDevice, scene_flags: u32, algorithm_flags: u32) -> RawScene {
            self.0.new_scene(device, scene_flags, algorithm_flags)
        }
        fn commit(&self, scene: RawScene) {
            self.0.commit(scene)
        }
        fn delete_scene(&self, scene: RawScene) {
            self.0.delete_scene(scene)
        }
        fn new_triangle_mesh(
            &self,
            scene: RawScene,
            flags: u32,
            tris: usize,
            verts: usize,
            steps: usize,
        ) -> u32 {
            self.0.new_triangle_mesh(scene, flags, tris, verts, steps)
        }
        fn new_instance(&self, target: RawScene, source: RawScene) -> u32 {
            self.0.new_instance(target, source)
        }
        fn set_transform(
            &self,
            scene: RawScene,
            geom_id: u32,
            layout: MatrixLayout,
            xfm: &[f32; 12],
        ) {
            self.0.set_transform(scene, geom_id, layout, xfm)
        }
        fn map_buffer(&self, scene: RawScene, geom_id: u32, kind: BufferKind) -> *mut u8 {
            self.0.map_buffer(scene, geom_id, kind)
        }
        fn unmap_buffer(&self, scene: RawScene, geom_id: u32, kind: BufferKind) {
            self.0.unmap_buffer(scene, geom_id, kind)
        }
        fn enable(&self, scene: RawScene, geom_id: u32) {
            self.0.enable(scene, geom_id)
        }
        fn disable(&self, scene: RawScene, geom_id: u32) {
            self.0.disable(scene, geom_id)
        }
        fn update(&self, scene: RawScene, geom_id: u32) {
            self.0.update(scene, geom_id)
        }
        fn delete_geometry(&self, scene: RawScene, geom_id: u32) {
            self.0.delete_geometry(scene, geom_id)
        }
        fn intersect1(&self, _scene: RawScene, ray: &mut RawRay1) {
            scribble(ray)
        }
        fn intersect4(&self, _valid: &RawMask4, _scene: RawScene, ray: &mut RawRay4) {
            scribble(ray)
        }
        fn intersect8(&self, _valid: &RawMask8, _scene: RawScene, ray: &mut RawRay8) {
            scribble(ray)
        }
        fn intersect16(&self, _valid: &RawMask16, _scene: RawScene, ray: &mut RawRay16) {
            scribble(ray)
        }
        fn occluded1(&self, _scene: RawScene, ray: &mut RawRay1) {
            scribble(ray)
        }
        fn occluded4(&self, _valid: &RawMask4, _scene: RawScene, ray: &mut RawRay4) {
            scribble(ray)
        }
        fn occluded8(&self, _valid: &RawMask8, _scene: RawScene, ray: &mut RawRay8) {
            scribble(ray)
        }
        fn occluded16(&self, _valid: &RawMask16, _scene: RawScene, ray: &mut RawRay16) {
            scribble(ray)
        }
    }

    fn all_widths() -> SceneDesc {
        SceneDesc::default().widths(TraversalWidths::all())
    }

    fn triangle_scene(device: &Device, desc: SceneDesc) -> Scene<GeometryInstance> {
        let geometry = Arc::new(Geometry::new(device, desc).unwrap());
        let mesh = Mesh::new(vec![0, 1, 2], vec![Vec3::ZERO, Vec3::X, Vec3::Y]).unwrap();
        geometry.add(Arc::new(mesh), MeshKind::Static).unwrap();
        let mut scene = Scene::new(device, desc).unwrap();
        scene.add(Arc::new(GeometryInstance::new(geometry))).unwrap();
        scene.commit().unwrap();
        scene
    }

    fn center_ray() -> Ray {
        Ray::new(Vec3::new(0.25, 0.25, -1.0), Vec3::Z)
    }

    #[test]
    fn test_sentinel_results_decode_to_no_hit() {
        let kernel = Arc::new(BlindKernel(SoftwareKernel::new()));
        let device = Device::with_kernel(kernel, DeviceDesc::new()).unwrap();
        let scene = triangle_scene(&device, all_widths());
        let mut scratch = QueryScratch::new();

        assert!(scene.intersect1(&mut scratch, &center_ray()).unwrap().is_none());
        for width in [4, 8, 16] {
            let rays = vec![center_ray(); width];
            let hits = match width {
                4 => scene.intersect4(&mut scratch, &rays),
                8 => scene.intersect8(&mut scratch, &rays),
                _ => scene.intersect16(&mut scratch, &rays),
            }
            .unwrap();
            assert_eq!(hits.len(), width);
            assert!(hits.iter().all(Option::is_none));
        }
        assert!(!scene.occluded1(&mut scratch, &center_ray()).unwrap());
    }

    #[test]
    fn test_intersect_resolves_objects() {
        let device = Device::create(false).unwrap();
        let scene = triangle_scene(&device, SceneDesc::default());
        let mut scratch = QueryScratch::new();

        let hit = scene.intersect1(&mut scratch, &center_ray()).unwrap().unwrap();
        let (instance_id, instance) = scene.instances().next().unwrap();
        assert_eq!(hit.instance_id, instance_id);
        assert!(Arc::ptr_eq(&hit.instance, instance));
        assert!(Arc::ptr_eq(&instance.geometry().mesh(hit.geometry_id).unwrap(), &hit.mesh));
        assert_eq!(hit.triangle(), Some([0, 1, 2]));
        let weights = hit.barycentric_weights();
        assert!((weights.iter().sum::<f32>() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_queries_require_commit() {
        let device = Device::create(false).unwrap();
        let mut scene = triangle_scene(&device, SceneDesc::default());
        let mut scratch = QueryScratch::new();
        assert!(scene.is_committed());

        let (_, instance) = scene.instances().next().unwrap();
        let instance = instance.clone();
        scene.delete(&instance).unwrap();
        assert!(matches!(
            scene.intersect1(&mut scratch, &center_ray()),
            Err(RayLinkError::NotCommitted)
        ));
        scene.commit().unwrap();
        assert!(scene.intersect1(&mut scratch, &center_ray()).unwrap().is_none());
    }

    #[test]
    fn test_mesh_swap_requires_commit() {
        let device = Device::create(false).unwrap();
        let mut scene = triangle_scene(&device, SceneDesc::default());
        let mut scratch = QueryScratch::new();
        let geometry = scene.instances().next().unwrap().1.geometry().clone();
        let (old_id, old_mesh) = geometry.meshes().remove(0);

        geometry.remove(&old_mesh).unwrap();
        let far = Vec3::new(0.0, 0.0, 50.0);
        let vertices = vec![far, far + Vec3::X, far + Vec3::Y];
        let new_mesh = Arc::new(Mesh::new(vec![0, 1, 2], vertices).unwrap());
        let new_id = geometry.add(new_mesh.clone(), MeshKind::Static).unwrap();
        assert_eq!(old_id.raw(), new_id.raw());

        // The kernel still traces the old triangle under the reused id.
        assert!(!scene.is_committed());
        assert!(matches!(
            scene.intersect1(&mut scratch, &center_ray()),
            Err(RayLinkError::NotCommitted)
        ));
        assert!(matches!(
            scene.occluded1(&mut scratch, &center_ray()),
            Err(RayLinkError::NotCommitted)
        ));

        scene.commit().unwrap();
        let hit = scene.intersect1(&mut scratch, &center_ray()).unwrap().unwrap();
        assert_eq!(hit.geometry_id, new_id);
        assert!(Arc::ptr_eq(&hit.mesh, &new_mesh));
        assert!((hit.distance - 51.0).abs() < 1e-4);
    }

    #[test]
    fn test_shared_geometry_change_invalidates_every_scene() {
        let device = Device::create(false).unwrap();
        let mut first = triangle_scene(&device, SceneDesc::default());
        let geometry = first.instances().next().unwrap().1.geometry().clone();
        let mut second = Scene::new(&device, SceneDesc::default()).unwrap();
        second.add(Arc::new(GeometryInstance::new(geometry.clone()))).unwrap();
        second.commit().unwrap();
        assert!(first.is_committed());

        let extra = Mesh::new(vec![0, 1, 2], vec![Vec3::ZERO, Vec3::Y, Vec3::Z]).unwrap();
        geometry.add(Arc::new(extra), MeshKind::Static).unwrap();
        second.commit().unwrap();

        assert!(second.is_committed());
        assert!(!first.is_committed());
        first.commit().unwrap();
        assert!(first.is_committed());
    }

    #[test]
    fn test_width_and_count_checks() {
        let device = Device::create(false).unwrap();
        let scene = triangle_scene(&device, SceneDesc::default());
        let mut scratch = QueryScratch::new();

        let err = scene.intersect4(&mut scratch, &[center_ray()]).unwrap_err();
        assert!(matches!(err, RayLinkError::UnsupportedTraversalWidth(4)));
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let scene = triangle_scene(&device, all_widths());
        let err = scene.occluded4(&mut scratch, &[center_ray(); 5]).unwrap_err();
        assert!(matches!(err, RayLinkError::TooManyRays { width: 4, count: 5 }));
    }

    #[test]
    fn test_add_rejects_mismatched_widths() {
        let device = Device::create(false).unwrap();
        let geometry = Arc::new(Geometry::new(&device, all_widths()).unwrap());
        let mut scene = Scene::new(&device, SceneDesc::default()).unwrap();
        let err = scene.add(Arc::new(GeometryInstance::new(geometry))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(scene.is_empty());
    }

    #[test]
    fn test_add_rejects_foreign_device() {
        let device = Device::create(false).unwrap();
        let other = Device::create(false).unwrap();
        let geometry = Arc::new(Geometry::new(&other, SceneDesc::default()).unwrap());
        let mut scene = Scene::new(&device, SceneDesc::default()).unwrap();
        let err = scene.add(Arc::new(GeometryInstance::new(geometry))).unwrap_err();
        assert!(matches!(err, RayLinkError::IncompatibleConfiguration(_)));
    }

    #[test]
    fn test_delete_unknown_instance() {
        let device = Device::create(false).unwrap();
        let mut scene = triangle_scene(&device, SceneDesc::default());
        let geometry = scene.instances().next().unwrap().1.geometry().clone();
        let stranger = Arc::new(GeometryInstance::new(geometry));
        assert!(matches!(scene.delete(&stranger), Err(RayLinkError::NotFound(_))));
        assert_eq!(scene.len(), 1);
        assert!(scene.id_of(&stranger).is_none());
    }

    #[test]
    fn test_inactive_single_ray_skips_kernel() {
        let device = Device::create(false).unwrap();
        let scene = triangle_scene(&device, SceneDesc::default());
        let mut scratch = QueryScratch::new();
        let ray = center_ray().with_active(false);
        assert!(scene.intersect1(&mut scratch, &ray).unwrap().is_none());
        assert!(!scene.occluded1(&mut scratch, &ray).unwrap());
    }
}
