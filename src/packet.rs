//! Ray requests, intersection records and the aligned packet scratch buffers

use crate::arena::{GeometryId, InstanceId};
use crate::config::TraversalWidths;
use crate::math::Vec3;
use crate::mesh::Mesh;
use crate::native::{
    NativeKernel, RawHitLane, RawMask1, RawMask4, RawMask8, RawMask16, RawRay1, RawRay4,
    RawRay8, RawRay16, RawRayLane, RawScene, RayPacket, ValidMask,
};
use bytemuck::Zeroable;
use std::fmt;
use std::mem::align_of;
use std::sync::Arc;

/// A single traversal request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ray {
    pub origin: Vec3,
    /// Expected to be unit length; distances are reported in multiples of it.
    pub direction: Vec3,
    /// Motion-blur time in `[0, 1]`
    pub time: f32,
    pub near: f32,
    pub far: f32,
    /// Inactive rays are never traced and always report no hit.
    pub active: bool,
}

impl Ray {
    pub fn new(origin: Vec3, direction: Vec3) -> Self {
        Self {
            origin,
            direction,
            time: 0.0,
            near: 0.0,
            far: f32::INFINITY,
            active: true,
        }
    }

    pub fn with_range(mut self, near: f32, far: f32) -> Self {
        self.near = near;
        self.far = far;
        self
    }

    pub fn at_time(mut self, time: f32) -> Self {
        self.time = time;
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    pub fn point_at(&self, distance: f32) -> Vec3 {
        self.origin + self.direction * distance
    }

    fn to_raw(self) -> RawRayLane {
        RawRayLane {
            org: self.origin.to_array(),
            dir: self.direction.to_array(),
            tnear: self.near,
            tfar: self.far,
            time: self.time,
            mask: u32::MAX,
        }
    }
}

/// A resolved hit.
///
/// `normal` is the kernel's raw geometric normal: object space, not normalized. Use
/// the inverse transpose of the instance transform to bring it to world space.
pub struct Intersection<I> {
    pub distance: f32,
    pub primitive: u32,
    pub mesh: Arc<Mesh>,
    pub instance: Arc<I>,
    pub geometry_id: GeometryId,
    pub instance_id: InstanceId,
    /// Barycentric weight of the triangle's second vertex
    pub u: f32,
    /// Barycentric weight of the triangle's third vertex
    pub v: f32,
    pub normal: Vec3,
}

impl<I> Intersection<I> {
    /// World-space hit position along `ray`.
    pub fn hit_point(&self, ray: &Ray) -> Vec3 {
        ray.point_at(self.distance)
    }

    /// Weights of the triangle's three vertices, in index order.
    pub fn barycentric_weights(&self) -> [f32; 3] {
        [1.0 - self.u - self.v, self.u, self.v]
    }

    /// Vertex indices of the hit triangle.
    pub fn triangle(&self) -> Option<[u32; 3]> {
        self.mesh.triangle(self.primitive)
    }
}

impl<I> Clone for Intersection<I> {
    fn clone(&self) -> Self {
        Self {
            distance: self.distance,
            primitive: self.primitive,
            mesh: self.mesh.clone(),
            instance: self.instance.clone(),
            geometry_id: self.geometry_id,
            instance_id: self.instance_id,
            u: self.u,
            v: self.v,
            normal: self.normal,
        }
    }
}

impl<I> fmt::Debug for Intersection<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Intersection")
            .field("distance", &self.distance)
            .field("primitive", &self.primitive)
            .field("geometry_id", &self.geometry_id)
            .field("instance_id", &self.instance_id)
            .field("u", &self.u)
            .field("v", &self.v)
            .field("normal", &self.normal)
            .finish_non_exhaustive()
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Compile-time packet width. Implemented by [`W1`], [`W4`], [`W8`] and [`W16`].
pub trait PacketWidth: sealed::Sealed + Sized + 'static {
    const WIDTH: u32;
    type Packet: RayPacket;
    type Mask: ValidMask;

    fn flag() -> TraversalWidths;

    #[doc(hidden)]
    fn intersect(
        kernel: &dyn NativeKernel,
        scene: RawScene,
        mask: &Self::Mask,
        packet: &mut Self::Packet,
    );

    #[doc(hidden)]
    fn occlude(
        kernel: &dyn NativeKernel,
        scene: RawScene,
        mask: &Self::Mask,
        packet: &mut Self::Packet,
    );

    #[doc(hidden)]
    fn buffer(scratch: &mut QueryScratch) -> &mut PacketBuffer<Self>;
}

#[derive(Debug, Clone, Copy)]
pub struct W1;
#[derive(Debug, Clone, Copy)]
pub struct W4;
#[derive(Debug, Clone, Copy)]
pub struct W8;
#[derive(Debug, Clone, Copy)]
pub struct W16;

impl sealed::Sealed for W1 {}

impl PacketWidth for W1 {
    const WIDTH: u32 = 1;
    type Packet = RawRay1;
    type Mask = RawMask1;

    fn flag() -> TraversalWidths {
        TraversalWidths::W1
    }

    fn intersect(
        kernel: &dyn NativeKernel,
        scene: RawScene,
        _mask: &RawMask1,
        packet: &mut RawRay1,
    ) {
        kernel.intersect1(scene, packet);
    }

    fn occlude(
        kernel: &dyn NativeKernel,
        scene: RawScene,
        _mask: &RawMask1,
        packet: &mut RawRay1,
    ) {
        kernel.occluded1(scene, packet);
    }

    fn buffer(scratch: &mut QueryScratch) -> &mut PacketBuffer<Self> {
        &mut scratch.w1
    }
}

macro_rules! packet_width {
    (
        $width:ident,
        $lanes:literal,
        $packet:ident,
        $mask:ident,
        $intersect:ident,
        $occluded:ident,
        $field:ident
    ) => {
        impl sealed::Sealed for $width {}

        impl PacketWidth for $width {
            const WIDTH: u32 = $lanes;
            type Packet = $packet;
            type Mask = $mask;

            fn flag() -> TraversalWidths {
                TraversalWidths::$width
            }

            fn intersect(
                kernel: &dyn NativeKernel,
                scene: RawScene,
                mask: &$mask,
                packet: &mut $packet,
            ) {
                kernel.$intersect(mask, scene, packet);
            }

            fn occlude(
                kernel: &dyn NativeKernel,
                scene: RawScene,
                mask: &$mask,
                packet: &mut $packet,
            ) {
                kernel.$occluded(mask, scene, packet);
            }

            fn buffer(scratch: &mut QueryScratch) -> &mut PacketBuffer<Self> {
                &mut scratch.$field
            }
        }
    };
}

packet_width!(W4, 4, RawRay4, RawMask4, intersect4, occluded4, w4);
packet_width!(W8, 8, RawRay8, RawMask8, intersect8, occluded8, w8);
packet_width!(W16, 16, RawRay16, RawMask16, intersect16, occluded16, w16);

/// Natively aligned scratch memory for one packet width.
///
/// The packet and its activity mask live in their own heap allocations with the
/// alignment of the native layout, so the buffer itself can be moved freely.
pub struct PacketBuffer<W: PacketWidth> {
    packet: Box<W::Packet>,
    mask: Box<W::Mask>,
}

impl<W: PacketWidth> PacketBuffer<W> {
    pub fn new() -> Self {
        let buffer = Self {
            packet: Box::new(W::Packet::zeroed()),
            mask: Box::new(W::Mask::zeroed()),
        };
        debug_assert_eq!(
            (&*buffer.packet as *const W::Packet as usize) % align_of::<W::Packet>(),
            0
        );
        debug_assert_eq!(
            (&*buffer.mask as *const W::Mask as usize) % align_of::<W::Mask>(),
            0
        );
        buffer
    }

    pub fn packet(&self) -> &W::Packet {
        &self.packet
    }

    pub fn mask(&self) -> &W::Mask {
        &self.mask
    }

    /// Writes `rays` into the packet. Lanes past `rays.len()` and inactive rays only
    /// get their mask slot cleared. Returns the number of active lanes.
    pub(crate) fn encode(&mut self, rays: &[Ray]) -> usize {
        let mut active = 0;
        for lane in 0..W::Packet::LANES {
            match rays.get(lane).filter(|ray| ray.active) {
                Some(ray) => {
                    self.packet.set_ray(lane, &ray.to_raw());
                    self.packet.reset_hit(lane);
                    self.mask.set_active(lane, true);
                    active += 1;
                }
                None => self.mask.set_active(lane, false),
            }
        }
        active
    }

    pub(crate) fn intersect(&mut self, kernel: &dyn NativeKernel, scene: RawScene) {
        W::intersect(kernel, scene, &self.mask, &mut self.packet);
    }

    pub(crate) fn occlude(&mut self, kernel: &dyn NativeKernel, scene: RawScene) {
        W::occlude(kernel, scene, &self.mask, &mut self.packet);
    }

    pub(crate) fn is_active(&self, lane: usize) -> bool {
        self.mask.is_active(lane)
    }

    pub(crate) fn geom_id(&self, lane: usize) -> u32 {
        self.packet.geom_id(lane)
    }

    pub(crate) fn hit(&self, lane: usize) -> RawHitLane {
        self.packet.hit(lane)
    }
}

impl<W: PacketWidth> Default for PacketBuffer<W> {
    fn default() -> Self {
        Self::new()
    }
}

/// One packet buffer per width, owned by a single worker.
///
/// Queries borrow the scratch mutably, so each thread needs its own; results are fully
/// decoded before the query returns, so the same scratch can be reused immediately.
#[derive(Default)]
pub struct QueryScratch {
    w1: PacketBuffer<W1>,
    w4: PacketBuffer<W4>,
    w8: PacketBuffer<W8>,
    w16: PacketBuffer<W16>,
}

impl QueryScratch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffer<W: PacketWidth>(&mut self) -> &mut PacketBuffer<W> {
        W::buffer(self)
    }
}
