//! Portable reference implementation of the native kernel protocol.
//!
//! `SoftwareKernel` speaks exactly the same protocol as the native library: opaque
//! handles, lowest-free geometry ids, map/unmap of kernel-owned buffers, staged state
//! that only becomes visible to queries on commit, activity masks, sentinel ids and a
//! per-thread error flag. Traversal is brute force; it is meant for tests, tools and
//! machines without the native library, not for production rendering.

use super::abi::{
    RawHitLane, RawMask4, RawMask8, RawMask16, RawRay1, RawRay4, RawRay8, RawRay16,
    RawRayLane, RayPacket, ValidMask,
};
use super::{
    BufferKind, ERROR_INVALID_ARGUMENT, ERROR_INVALID_OPERATION, ERROR_NONE,
    ERROR_OUT_OF_MEMORY, ERROR_UNSUPPORTED_CPU, INVALID_ID, MatrixLayout, NativeKernel,
    RawDevice, RawScene,
};
use crate::math::{self, Affine3A, Vec3};
use parking_lot::RwLock;
use std::cell::Cell;
use std::ptr;
use std::sync::Arc;

thread_local! {
    static LAST_ERROR: Cell<u32> = const { Cell::new(ERROR_NONE) };
}

/// Records `code` unless an earlier error on this thread is still unread.
fn raise(code: u32) {
    LAST_ERROR.with(|last| {
        if last.get() == ERROR_NONE {
            last.set(code);
        }
    });
}

const GEOMETRY_STATIC: u32 = 0;
const GEOMETRY_DYNAMIC: u32 = 2;

const INTERSECT1: u32 = 1 << 0;
const INTERSECT4: u32 = 1 << 1;
const INTERSECT8: u32 = 1 << 2;
const INTERSECT16: u32 = 1 << 3;

/// Determinants below this are treated as parallel rays / degenerate transforms.
const EPSILON: f32 = 1e-12;

#[derive(Debug, Clone)]
struct TriangleData {
    indices: Vec<[u32; 3]>,
    /// One buffer per time step, four floats per vertex.
    vertices: Vec<Vec<[f32; 4]>>,
}

struct TriangleHit {
    t: f32,
    prim: u32,
    u: f32,
    v: f32,
    ng: Vec3,
}

impl TriangleHit {
    fn into_raw(self, geom_id: u32, inst_id: u32) -> RawHitLane {
        RawHitLane {
            tfar: self.t,
            ng: self.ng.to_array(),
            u: self.u,
            v: self.v,
            geom_id,
            prim_id: self.prim,
            inst_id,
        }
    }
}

impl TriangleData {
    fn allocate(num_triangles: usize, num_vertices: usize, num_time_steps: usize) -> Option<Self> {
        let mut indices = Vec::new();
        indices.try_reserve_exact(num_triangles).ok()?;
        indices.resize(num_triangles, [0; 3]);

        let mut vertices = Vec::with_capacity(num_time_steps);
        for _ in 0..num_time_steps {
            let mut buffer = Vec::new();
            buffer.try_reserve_exact(num_vertices).ok()?;
            buffer.resize(num_vertices, [0.0; 4]);
            vertices.push(buffer);
        }

        Some(Self { indices, vertices })
    }

    fn position(&self, index: u32, time: f32) -> Option<Vec3> {
        let index = index as usize;
        let p0 = self.vertices.first()?.get(index)?;
        let p0 = Vec3::new(p0[0], p0[1], p0[2]);
        match self.vertices.get(1) {
            Some(step1) => {
                let p1 = step1.get(index)?;
                let p1 = Vec3::new(p1[0], p1[1], p1[2]);
                Some(p0.lerp(p1, time.clamp(0.0, 1.0)))
            }
            None => Some(p0),
        }
    }

    /// Closest triangle hit with `tnear <= t <= tfar`.
    fn intersect(
        &self,
        org: Vec3,
        dir: Vec3,
        tnear: f32,
        tfar: f32,
        time: f32,
    ) -> Option<TriangleHit> {
        let mut tfar = tfar;
        let mut best = None;

        for (prim, tri) in self.indices.iter().enumerate() {
            let (Some(v0), Some(v1), Some(v2)) = (
                self.position(tri[0], time),
                self.position(tri[1], time),
                self.position(tri[2], time),
            ) else {
                continue;
            };

            if let Some((t, u, v)) = intersect_triangle(org, dir, v0, v1, v2) {
                if t >= tnear && t <= tfar {
                    tfar = t;
                    best = Some(TriangleHit {
                        t,
                        prim: prim as u32,
                        u,
                        v,
                        ng: (v0 - v1).cross(v2 - v0),
                    });
                }
            }
        }

        best
    }
}

/// Möller–Trumbore. `u` weights `v1`, `v` weights `v2`.
fn intersect_triangle(
    org: Vec3,
    dir: Vec3,
    v0: Vec3,
    v1: Vec3,
    v2: Vec3,
) -> Option<(f32, f32, f32)> {
    let e1 = v1 - v0;
    let e2 = v2 - v0;
    let p = dir.cross(e2);
    let det = e1.dot(p);
    if det.abs() < EPSILON {
        return None;
    }

    let inv_det = 1.0 / det;
    let s = org - v0;
    let u = s.dot(p) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }

    let q = s.cross(e1);
    let v = dir.dot(q) * inv_det;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }

    Some((e2.dot(q) * inv_det, u, v))
}

#[derive(Debug, Clone)]
enum Shape {
    Triangles { flags: u32, data: Arc<TriangleData> },
    Instance { source: RawScene, transform: Affine3A },
}

struct StagedGeometry {
    shape: Shape,
    enabled: bool,
    committed_once: bool,
    /// Bit set of currently mapped buffers.
    mapped: u8,
}

enum CommittedShape {
    Triangles(Arc<TriangleData>),
    Instance {
        source: RawScene,
        world_to_object: Affine3A,
    },
}

struct CommittedScene {
    shapes: Vec<(u32, CommittedShape)>,
}

struct SceneState {
    device: RawDevice,
    verbose: bool,
    algorithms: u32,
    geometries: Vec<Option<StagedGeometry>>,
    committed: Option<Arc<CommittedScene>>,
}

struct DeviceState {
    verbose: bool,
}

#[derive(Default)]
struct KernelState {
    devices: Vec<Option<DeviceState>>,
    scenes: Vec<Option<SceneState>>,
}

impl KernelState {
    fn device(&self, device: RawDevice) -> Option<&DeviceState> {
        device
            .0
            .checked_sub(1)
            .and_then(|index| self.devices.get(index))
            .and_then(Option::as_ref)
    }

    fn scene(&self, scene: RawScene) -> Option<&SceneState> {
        scene
            .0
            .checked_sub(1)
            .and_then(|index| self.scenes.get(index))
            .and_then(Option::as_ref)
    }

    fn scene_mut(&mut self, scene: RawScene) -> Option<&mut SceneState> {
        scene
            .0
            .checked_sub(1)
            .and_then(|index| self.scenes.get_mut(index))
            .and_then(Option::as_mut)
    }

    fn committed(&self, scene: RawScene) -> Option<&CommittedScene> {
        self.scene(scene).and_then(|s| s.committed.as_deref())
    }
}

fn buffer_bit(kind: BufferKind) -> u8 {
    match kind {
        BufferKind::Index => 1 << 0,
        BufferKind::Vertex0 => 1 << 1,
        BufferKind::Vertex1 => 1 << 2,
    }
}

/// Places `geometry` in the lowest free slot, the way the native kernel assigns ids.
fn insert_lowest(slots: &mut Vec<Option<StagedGeometry>>, geometry: StagedGeometry) -> u32 {
    match slots.iter().position(Option::is_none) {
        Some(index) => {
            slots[index] = Some(geometry);
            index as u32
        }
        None => {
            slots.push(Some(geometry));
            (slots.len() - 1) as u32
        }
    }
}

fn cpu_supported() -> bool {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    {
        std::arch::is_x86_feature_detected!("sse2")
    }
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    {
        true
    }
}

fn parse_verbose(config: &str) -> bool {
    let mut verbose = false;
    for entry in config.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        match entry.split_once('=') {
            Some(("verbose", level)) => verbose = level.trim().parse::<u32>().unwrap_or(0) > 0,
            _ => log::warn!("Software kernel ignores config entry '{}'", entry),
        }
    }
    verbose
}

/// Pure-Rust kernel implementing the full [`NativeKernel`] protocol.
#[derive(Default)]
pub struct SoftwareKernel {
    state: RwLock<KernelState>,
}

impl SoftwareKernel {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_geometry<R>(
        &self,
        scene: RawScene,
        geom_id: u32,
        op: &str,
        f: impl FnOnce(&mut StagedGeometry) -> R,
    ) -> Option<R> {
        let mut state = self.state.write();
        let Some(scene_state) = state.scene_mut(scene) else {
            raise(ERROR_INVALID_ARGUMENT);
            return None;
        };
        if scene_state.verbose {
            log::trace!("{}(scene {}, geometry {})", op, scene.0, geom_id);
        }
        let Some(geometry) = scene_state
            .geometries
            .get_mut(geom_id as usize)
            .and_then(Option::as_mut)
        else {
            raise(ERROR_INVALID_ARGUMENT);
            return None;
        };
        Some(f(geometry))
    }

    fn add_geometry(&self, scene: RawScene, op: &str, shape: Shape) -> u32 {
        let mut state = self.state.write();
        let Some(scene_state) = state.scene_mut(scene) else {
            raise(ERROR_INVALID_ARGUMENT);
            return INVALID_ID;
        };
        let geom_id = insert_lowest(
            &mut scene_state.geometries,
            StagedGeometry {
                shape,
                enabled: true,
                committed_once: false,
                mapped: 0,
            },
        );
        if scene_state.verbose {
            log::trace!("{}(scene {}) -> {}", op, scene.0, geom_id);
        }
        geom_id
    }

    fn trace<P: RayPacket>(
        &self,
        scene: RawScene,
        packet: &mut P,
        width_flag: u32,
        active: impl Fn(usize) -> bool,
        occlusion: bool,
    ) {
        let state = self.state.read();
        let Some(scene_state) = state.scene(scene) else {
            raise(ERROR_INVALID_ARGUMENT);
            return;
        };
        if scene_state.algorithms & width_flag == 0 {
            raise(ERROR_INVALID_OPERATION);
            return;
        }
        let Some(snapshot) = scene_state.committed.as_deref() else {
            raise(ERROR_INVALID_OPERATION);
            return;
        };

        for lane in 0..P::LANES {
            if !active(lane) {
                continue;
            }
            let ray = packet.ray(lane);
            if !(ray.tnear <= ray.tfar) {
                continue;
            }
            if let Some(hit) = Self::trace_lane(&state, snapshot, &ray, occlusion) {
                if occlusion {
                    packet.set_geom_id(lane, 0);
                } else {
                    packet.set_hit(lane, &hit);
                }
            }
        }
    }

    fn trace_lane(
        state: &KernelState,
        snapshot: &CommittedScene,
        ray: &RawRayLane,
        occlusion: bool,
    ) -> Option<RawHitLane> {
        let org = Vec3::from_array(ray.org);
        let dir = Vec3::from_array(ray.dir);
        let mut tfar = ray.tfar;
        let mut best = None;

        for (geom_id, shape) in &snapshot.shapes {
            match shape {
                CommittedShape::Triangles(data) => {
                    if let Some(hit) = data.intersect(org, dir, ray.tnear, tfar, ray.time) {
                        tfar = hit.t;
                        best = Some(hit.into_raw(*geom_id, INVALID_ID));
                        if occlusion {
                            return best;
                        }
                    }
                }
                CommittedShape::Instance {
                    source,
                    world_to_object,
                } => {
                    let Some(source) = state.committed(*source) else {
                        continue;
                    };
                    let local_org = world_to_object.transform_point3(org);
                    let local_dir = world_to_object.transform_vector3(dir);
                    // one level of instancing
                    for (child_id, child) in &source.shapes {
                        let CommittedShape::Triangles(data) = child else {
                            continue;
                        };
                        if let Some(hit) =
                            data.intersect(local_org, local_dir, ray.tnear, tfar, ray.time)
                        {
                            tfar = hit.t;
                            best = Some(hit.into_raw(*child_id, *geom_id));
                            if occlusion {
                                return best;
                            }
                        }
                    }
                }
            }
        }

        best
    }

    fn trace_masked<P: RayPacket, M: ValidMask>(
        &self,
        valid: &M,
        scene: RawScene,
        packet: &mut P,
        width_flag: u32,
        occlusion: bool,
    ) {
        self.trace(scene, packet, width_flag, |lane| valid.is_active(lane), occlusion);
    }
}

impl NativeKernel for SoftwareKernel {
    fn name(&self) -> &str {
        "software"
    }

    fn new_device(&self, config: &str) -> RawDevice {
        if !cpu_supported() {
            raise(ERROR_UNSUPPORTED_CPU);
            return RawDevice::NULL;
        }
        let verbose = parse_verbose(config);
        let mut state = self.state.write();
        state.devices.push(Some(DeviceState { verbose }));
        let device = RawDevice(state.devices.len());
        if verbose {
            log::trace!("new_device('{}') -> {}", config, device.0);
        }
        device
    }

    fn delete_device(&self, device: RawDevice) {
        let mut state = self.state.write();
        let Some(slot) = device
            .0
            .checked_sub(1)
            .and_then(|index| state.devices.get_mut(index))
            .filter(|slot| slot.is_some())
        else {
            raise(ERROR_INVALID_ARGUMENT);
            return;
        };
        *slot = None;

        let orphans = state
            .scenes
            .iter()
            .flatten()
            .filter(|scene| scene.device == device)
            .count();
        if orphans > 0 {
            log::warn!(
                "Device {} deleted while {} scene(s) still reference it",
                device.0,
                orphans
            );
        }
    }

    fn device_error(&self, _device: RawDevice) -> u32 {
        LAST_ERROR.with(|last| last.replace(ERROR_NONE))
    }

    fn new_scene(&self, device: RawDevice, scene_flags: u32, algorithm_flags: u32) -> RawScene {
        let mut state = self.state.write();
        let Some(verbose) = state.device(device).map(|d| d.verbose) else {
            raise(ERROR_INVALID_ARGUMENT);
            return RawScene::NULL;
        };
        state.scenes.push(Some(SceneState {
            device,
            verbose,
            algorithms: algorithm_flags,
            geometries: Vec::new(),
            committed: None,
        }));
        let scene = RawScene(state.scenes.len());
        if verbose {
            log::trace!(
                "new_scene(device {}, flags {:#x}, algorithms {:#x}) -> {}",
                device.0,
                scene_flags,
                algorithm_flags,
                scene.0
            );
        }
        scene
    }

    fn commit(&self, scene: RawScene) {
        let mut state = self.state.write();
        let Some(scene_state) = state.scene_mut(scene) else {
            raise(ERROR_INVALID_ARGUMENT);
            return;
        };
        if scene_state.geometries.iter().flatten().any(|g| g.mapped != 0) {
            raise(ERROR_INVALID_OPERATION);
            return;
        }

        let mut shapes = Vec::new();
        for (geom_id, geometry) in scene_state.geometries.iter_mut().enumerate() {
            let Some(geometry) = geometry else {
                continue;
            };
            geometry.committed_once = true;
            if !geometry.enabled {
                continue;
            }
            let committed = match &geometry.shape {
                Shape::Triangles { data, .. } => CommittedShape::Triangles(data.clone()),
                Shape::Instance { source, transform } => {
                    if transform.matrix3.determinant().abs() < EPSILON {
                        log::warn!(
                            "Instance {} in scene {} has a singular transform and is skipped",
                            geom_id,
                            scene.0
                        );
                        continue;
                    }
                    CommittedShape::Instance {
                        source: *source,
                        world_to_object: transform.inverse(),
                    }
                }
            };
            shapes.push((geom_id as u32, committed));
        }

        if scene_state.verbose {
            log::trace!("commit(scene {}): {} shape(s)", scene.0, shapes.len());
        }
        scene_state.committed = Some(Arc::new(CommittedScene { shapes }));
    }

    fn delete_scene(&self, scene: RawScene) {
        let mut state = self.state.write();
        let Some(slot) = scene
            .0
            .checked_sub(1)
            .and_then(|index| state.scenes.get_mut(index))
            .filter(|slot| slot.is_some())
        else {
            raise(ERROR_INVALID_ARGUMENT);
            return;
        };
        *slot = None;
    }

    fn new_triangle_mesh(
        &self,
        scene: RawScene,
        geometry_flags: u32,
        num_triangles: usize,
        num_vertices: usize,
        num_time_steps: usize,
    ) -> u32 {
        if geometry_flags > GEOMETRY_DYNAMIC || !(1..=2).contains(&num_time_steps) {
            raise(ERROR_INVALID_ARGUMENT);
            return INVALID_ID;
        }
        let Some(data) = TriangleData::allocate(num_triangles, num_vertices, num_time_steps) else {
            raise(ERROR_OUT_OF_MEMORY);
            return INVALID_ID;
        };
        self.add_geometry(
            scene,
            "new_triangle_mesh",
            Shape::Triangles {
                flags: geometry_flags,
                data: Arc::new(data),
            },
        )
    }

    fn new_instance(&self, target: RawScene, source: RawScene) -> u32 {
        {
            let state = self.state.read();
            if target == source || state.scene(source).is_none() {
                raise(ERROR_INVALID_ARGUMENT);
                return INVALID_ID;
            }
        }
        self.add_geometry(
            target,
            "new_instance",
            Shape::Instance {
                source,
                transform: Affine3A::IDENTITY,
            },
        )
    }

    fn set_transform(&self, scene: RawScene, geom_id: u32, layout: MatrixLayout, xfm: &[f32; 12]) {
        self.with_geometry(scene, geom_id, "set_transform", |geometry| {
            let Shape::Instance { transform, .. } = &mut geometry.shape else {
                raise(ERROR_INVALID_ARGUMENT);
                return;
            };
            *transform = match layout {
                MatrixLayout::ColumnMajor => math::from_column_major(xfm),
                MatrixLayout::RowMajor => math::from_row_major(xfm),
            };
        });
    }

    fn map_buffer(&self, scene: RawScene, geom_id: u32, kind: BufferKind) -> *mut u8 {
        self.with_geometry(scene, geom_id, "map_buffer", |geometry| {
            let bit = buffer_bit(kind);
            if geometry.mapped & bit != 0 {
                raise(ERROR_INVALID_OPERATION);
                return ptr::null_mut();
            }
            let Shape::Triangles { flags, data } = &mut geometry.shape else {
                raise(ERROR_INVALID_ARGUMENT);
                return ptr::null_mut();
            };
            if *flags == GEOMETRY_STATIC && geometry.committed_once {
                raise(ERROR_INVALID_OPERATION);
                return ptr::null_mut();
            }

            // Copy-on-write: the committed snapshot keeps the old buffers until the
            // next commit.
            let data = Arc::make_mut(data);
            let buffer: *mut u8 = match kind {
                BufferKind::Index => data.indices.as_mut_ptr().cast(),
                BufferKind::Vertex0 => match data.vertices.get_mut(0) {
                    Some(vertices) => vertices.as_mut_ptr().cast(),
                    None => ptr::null_mut(),
                },
                BufferKind::Vertex1 => match data.vertices.get_mut(1) {
                    Some(vertices) => vertices.as_mut_ptr().cast(),
                    None => ptr::null_mut(),
                },
            };
            if buffer.is_null() {
                raise(ERROR_INVALID_ARGUMENT);
                return buffer;
            }
            geometry.mapped |= bit;
            buffer
        })
        .unwrap_or(ptr::null_mut())
    }

    fn unmap_buffer(&self, scene: RawScene, geom_id: u32, kind: BufferKind) {
        self.with_geometry(scene, geom_id, "unmap_buffer", |geometry| {
            let bit = buffer_bit(kind);
            if geometry.mapped & bit == 0 {
                raise(ERROR_INVALID_OPERATION);
                return;
            }
            geometry.mapped &= !bit;
        });
    }

    fn enable(&self, scene: RawScene, geom_id: u32) {
        self.with_geometry(scene, geom_id, "enable", |geometry| geometry.enabled = true);
    }

    fn disable(&self, scene: RawScene, geom_id: u32) {
        self.with_geometry(scene, geom_id, "disable", |geometry| geometry.enabled = false);
    }

    fn update(&self, scene: RawScene, geom_id: u32) {
        // Buffers are re-read on every commit; update only validates the id.
        self.with_geometry(scene, geom_id, "update", |_| ());
    }

    fn delete_geometry(&self, scene: RawScene, geom_id: u32) {
        let mut state = self.state.write();
        let Some(scene_state) = state.scene_mut(scene) else {
            raise(ERROR_INVALID_ARGUMENT);
            return;
        };
        match scene_state.geometries.get_mut(geom_id as usize) {
            Some(slot) if slot.is_some() => *slot = None,
            _ => raise(ERROR_INVALID_ARGUMENT),
        }
        if scene_state.verbose {
            log::trace!("delete_geometry(scene {}, geometry {})", scene.0, geom_id);
        }
    }

    fn intersect1(&self, scene: RawScene, ray: &mut RawRay1) {
        self.trace(scene, ray, INTERSECT1, |_| true, false);
    }

    fn intersect4(&self, valid: &RawMask4, scene: RawScene, ray: &mut RawRay4) {
        self.trace_masked(valid, scene, ray, INTERSECT4, false);
    }

    fn intersect8(&self, valid: &RawMask8, scene: RawScene, ray: &mut RawRay8) {
        self.trace_masked(valid, scene, ray, INTERSECT8, false);
    }

    fn intersect16(&self, valid: &RawMask16, scene: RawScene, ray: &mut RawRay16) {
        self.trace_masked(valid, scene, ray, INTERSECT16, false);
    }

    fn occluded1(&self, scene: RawScene, ray: &mut RawRay1) {
        self.trace(scene, ray, INTERSECT1, |_| true, true);
    }

    fn occluded4(&self, valid: &RawMask4, scene: RawScene, ray: &mut RawRay4) {
        self.trace_masked(valid, scene, ray, INTERSECT4, true);
    }

    fn occluded8(&self, valid: &RawMask8, scene: RawScene, ray: &mut RawRay8) {
        self.trace_masked(valid, scene, ray, INTERSECT8, true);
    }

    fn occluded16(&self, valid: &RawMask16, scene: RawScene, ray: &mut RawRay16) {
        self.trace_masked(valid, scene, ray, INTERSECT16, true);
    }
}
