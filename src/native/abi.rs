//! Binary layouts shared with the native kernel.
//!
//! Field order, sizes and alignment here are fixed by the kernel's compiled code.
//! A mismatch is silent memory corruption on the native side, so every layout is
//! pinned by compile-time assertions and offset tests.

use super::{INVALID_ID, LANE_ACTIVE, LANE_INACTIVE};
use bytemuck::{Pod, Zeroable};
use std::mem::{align_of, size_of};

/// One lane of ray input, independent of packet width.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RawRayLane {
    pub org: [f32; 3],
    pub dir: [f32; 3],
    pub tnear: f32,
    pub tfar: f32,
    pub time: f32,
    pub mask: u32,
}

/// One lane of hit output, independent of packet width.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawHitLane {
    pub tfar: f32,
    pub ng: [f32; 3],
    pub u: f32,
    pub v: f32,
    pub geom_id: u32,
    pub prim_id: u32,
    pub inst_id: u32,
}

/// Lane accessors over a native ray packet of any width.
pub trait RayPacket: Pod + Send {
    const LANES: usize;

    fn ray(&self, lane: usize) -> RawRayLane;
    fn set_ray(&mut self, lane: usize, ray: &RawRayLane);

    /// Resets the output fields of a lane to "no hit".
    fn reset_hit(&mut self, lane: usize);
    fn hit(&self, lane: usize) -> RawHitLane;
    fn set_hit(&mut self, lane: usize, hit: &RawHitLane);

    fn geom_id(&self, lane: usize) -> u32;
    fn set_geom_id(&mut self, lane: usize, geom_id: u32);
}

/// Activity mask passed next to packets wider than one lane.
pub trait ValidMask: Copy + Send + Zeroable {
    const LANES: usize;

    fn is_active(&self, lane: usize) -> bool;
    fn set_active(&mut self, lane: usize, active: bool);
}

/// Single ray.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy)]
pub struct RawRay1 {
    pub org: [f32; 3],
    pub align0: f32,
    pub dir: [f32; 3],
    pub align1: f32,
    pub tnear: f32,
    pub tfar: f32,
    pub time: f32,
    pub mask: u32,
    pub ng: [f32; 3],
    pub align2: f32,
    pub u: f32,
    pub v: f32,
    pub geom_id: u32,
    pub prim_id: u32,
    pub inst_id: u32,
    pub align3: [u32; 3],
}

// SAFETY: only f32/u32 fields, explicit padding, size is a multiple of the alignment.
unsafe impl Zeroable for RawRay1 {}
unsafe impl Pod for RawRay1 {}

const _: () = assert!(size_of::<RawRay1>() == 96);
const _: () = assert!(align_of::<RawRay1>() == 16);

impl RayPacket for RawRay1 {
    const LANES: usize = 1;

    fn ray(&self, _lane: usize) -> RawRayLane {
        RawRayLane {
            org: self.org,
            dir: self.dir,
            tnear: self.tnear,
            tfar: self.tfar,
            time: self.time,
            mask: self.mask,
        }
    }

    fn set_ray(&mut self, _lane: usize, ray: &RawRayLane) {
        self.org = ray.org;
        self.dir = ray.dir;
        self.tnear = ray.tnear;
        self.tfar = ray.tfar;
        self.time = ray.time;
        self.mask = ray.mask;
    }

    fn reset_hit(&mut self, _lane: usize) {
        self.ng = [0.0; 3];
        self.u = 0.0;
        self.v = 0.0;
        self.geom_id = INVALID_ID;
        self.prim_id = INVALID_ID;
        self.inst_id = INVALID_ID;
    }

    fn hit(&self, _lane: usize) -> RawHitLane {
        RawHitLane {
            tfar: self.tfar,
            ng: self.ng,
            u: self.u,
            v: self.v,
            geom_id: self.geom_id,
            prim_id: self.prim_id,
            inst_id: self.inst_id,
        }
    }

    fn set_hit(&mut self, _lane: usize, hit: &RawHitLane) {
        self.tfar = hit.tfar;
        self.ng = hit.ng;
        self.u = hit.u;
        self.v = hit.v;
        self.geom_id = hit.geom_id;
        self.prim_id = hit.prim_id;
        self.inst_id = hit.inst_id;
    }

    fn geom_id(&self, _lane: usize) -> u32 {
        self.geom_id
    }

    fn set_geom_id(&mut self, _lane: usize, geom_id: u32) {
        self.geom_id = geom_id;
    }
}

/// Width-1 queries take no mask; this exists so every width has a mask type.
#[repr(transparent)]
#[derive(Debug, Clone, Copy)]
pub struct RawMask1(pub [i32; 1]);

unsafe impl Zeroable for RawMask1 {}

impl ValidMask for RawMask1 {
    const LANES: usize = 1;

    fn is_active(&self, lane: usize) -> bool {
        self.0[lane] != LANE_INACTIVE
    }

    fn set_active(&mut self, lane: usize, active: bool) {
        self.0[lane] = if active { LANE_ACTIVE } else { LANE_INACTIVE };
    }
}

macro_rules! ray_packet {
    ($(#[$doc:meta])* $packet:ident, $mask:ident, $lanes:literal, $align:literal) => {
        $(#[$doc])*
        #[repr(C, align($align))]
        #[derive(Debug, Clone, Copy)]
        pub struct $packet {
            pub orgx: [f32; $lanes],
            pub orgy: [f32; $lanes],
            pub orgz: [f32; $lanes],
            pub dirx: [f32; $lanes],
            pub diry: [f32; $lanes],
            pub dirz: [f32; $lanes],
            pub tnear: [f32; $lanes],
            pub tfar: [f32; $lanes],
            pub time: [f32; $lanes],
            pub mask: [u32; $lanes],
            pub ngx: [f32; $lanes],
            pub ngy: [f32; $lanes],
            pub ngz: [f32; $lanes],
            pub u: [f32; $lanes],
            pub v: [f32; $lanes],
            pub geom_id: [u32; $lanes],
            pub prim_id: [u32; $lanes],
            pub inst_id: [u32; $lanes],
        }

        // SAFETY: 18 arrays of 4-byte scalars; the size is a multiple of the
        // alignment so there is no padding anywhere.
        unsafe impl Zeroable for $packet {}
        unsafe impl Pod for $packet {}

        const _: () = assert!(size_of::<$packet>() == 18 * 4 * $lanes);
        const _: () = assert!(align_of::<$packet>() == $align);

        /// Activity mask matching the packet of the same width.
        #[repr(C, align($align))]
        #[derive(Debug, Clone, Copy)]
        pub struct $mask(pub [i32; $lanes]);

        unsafe impl Zeroable for $mask {}

        const _: () = assert!(size_of::<$mask>() == 4 * $lanes);

        impl ValidMask for $mask {
            const LANES: usize = $lanes;

            fn is_active(&self, lane: usize) -> bool {
                self.0[lane] != LANE_INACTIVE
            }

            fn set_active(&mut self, lane: usize, active: bool) {
                self.0[lane] = if active { LANE_ACTIVE } else { LANE_INACTIVE };
            }
        }

        impl RayPacket for $packet {
            const LANES: usize = $lanes;

            fn ray(&self, lane: usize) -> RawRayLane {
                RawRayLane {
                    org: [self.orgx[lane], self.orgy[lane], self.orgz[lane]],
                    dir: [self.dirx[lane], self.diry[lane], self.dirz[lane]],
                    tnear: self.tnear[lane],
                    tfar: self.tfar[lane],
                    time: self.time[lane],
                    mask: self.mask[lane],
                }
            }

            fn set_ray(&mut self, lane: usize, ray: &RawRayLane) {
                self.orgx[lane] = ray.org[0];
                self.orgy[lane] = ray.org[1];
                self.orgz[lane] = ray.org[2];
                self.dirx[lane] = ray.dir[0];
                self.diry[lane] = ray.dir[1];
                self.dirz[lane] = ray.dir[2];
                self.tnear[lane] = ray.tnear;
                self.tfar[lane] = ray.tfar;
                self.time[lane] = ray.time;
                self.mask[lane] = ray.mask;
            }

            fn reset_hit(&mut self, lane: usize) {
                self.ngx[lane] = 0.0;
                self.ngy[lane] = 0.0;
                self.ngz[lane] = 0.0;
                self.u[lane] = 0.0;
                self.v[lane] = 0.0;
                self.geom_id[lane] = INVALID_ID;
                self.prim_id[lane] = INVALID_ID;
                self.inst_id[lane] = INVALID_ID;
            }

            fn hit(&self, lane: usize) -> RawHitLane {
                RawHitLane {
                    tfar: self.tfar[lane],
                    ng: [self.ngx[lane], self.ngy[lane], self.ngz[lane]],
                    u: self.u[lane],
                    v: self.v[lane],
                    geom_id: self.geom_id[lane],
                    prim_id: self.prim_id[lane],
                    inst_id: self.inst_id[lane],
                }
            }

            fn set_hit(&mut self, lane: usize, hit: &RawHitLane) {
                self.tfar[lane] = hit.tfar;
                self.ngx[lane] = hit.ng[0];
                self.ngy[lane] = hit.ng[1];
                self.ngz[lane] = hit.ng[2];
                self.u[lane] = hit.u;
                self.v[lane] = hit.v;
                self.geom_id[lane] = hit.geom_id;
                self.prim_id[lane] = hit.prim_id;
                self.inst_id[lane] = hit.inst_id;
            }

            fn geom_id(&self, lane: usize) -> u32 {
                self.geom_id[lane]
            }

            fn set_geom_id(&mut self, lane: usize, geom_id: u32) {
                self.geom_id[lane] = geom_id;
            }
        }
    };
}

ray_packet!(
    /// Packet of 4 rays, structure-of-arrays, SSE aligned.
    RawRay4, RawMask4, 4, 16
);
ray_packet!(
    /// Packet of 8 rays, structure-of-arrays, AVX aligned.
    RawRay8, RawMask8, 8, 32
);
ray_packet!(
    /// Packet of 16 rays, structure-of-arrays, AVX-512 aligned.
    RawRay16, RawMask16, 16, 64
);
