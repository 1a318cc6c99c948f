//! The native kernel boundary.
//!
//! Everything the interop layer needs from a ray-tracing kernel is expressed by the
//! [`NativeKernel`] trait, whose methods mirror the kernel's C entry points one to one.
//! Handles are opaque integers and every mutating call reports failure only through
//! the kernel's per-thread error flag, read back with [`NativeKernel::device_error`].
//!
//! Two kernels are provided:
//!
//! - [`SoftwareKernel`]: a portable reference implementation of the protocol
//! - [`NativeLibrary`]: a native shared library resolved at runtime

pub mod abi;
pub mod library;
pub mod software;

pub use abi::{
    RayPacket, RawHitLane, RawMask1, RawMask4, RawMask8, RawMask16, RawRay1, RawRay4, RawRay8,
    RawRay16, RawRayLane, ValidMask,
};
pub use library::NativeLibrary;
pub use software::SoftwareKernel;

/// Sentinel for "no geometry / no instance / no hit".
pub const INVALID_ID: u32 = u32::MAX;

pub const ERROR_NONE: u32 = 0;
pub const ERROR_UNKNOWN: u32 = 1;
pub const ERROR_INVALID_ARGUMENT: u32 = 2;
pub const ERROR_INVALID_OPERATION: u32 = 3;
pub const ERROR_OUT_OF_MEMORY: u32 = 4;
pub const ERROR_UNSUPPORTED_CPU: u32 = 5;
pub const ERROR_CANCELLED: u32 = 6;

/// Activity mask lane values.
pub const LANE_ACTIVE: i32 = -1;
pub const LANE_INACTIVE: i32 = 0;

/// Opaque native device handle. Zero is the null handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawDevice(pub usize);

/// Opaque native scene handle. Zero is the null handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawScene(pub usize);

impl RawDevice {
    pub const NULL: Self = Self(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl RawScene {
    pub const NULL: Self = Self(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Buffer selector for map/unmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum BufferKind {
    Index = 0x0100_0000,
    /// Vertices at time 0 (the only vertex buffer of a static mesh)
    Vertex0 = 0x0200_0000,
    /// Vertices at time 1 of a motion-blurred mesh
    Vertex1 = 0x0200_0001,
}

impl BufferKind {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0x0100_0000 => Some(Self::Index),
            0x0200_0000 => Some(Self::Vertex0),
            0x0200_0001 => Some(Self::Vertex1),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Index => "index",
            Self::Vertex0 => "vertex",
            Self::Vertex1 => "vertex (t=1)",
        }
    }
}

/// Memory layout of a 3×4 transform passed to [`NativeKernel::set_transform`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MatrixLayout {
    RowMajor = 0,
    ColumnMajor = 1,
}

/// The native kernel's C interface.
///
/// Methods never return errors directly: failures set the calling thread's error flag,
/// which callers must poll with [`device_error`](Self::device_error) after each call.
/// Query entry points are safe to call concurrently on a committed scene; everything
/// else must be externally serialized.
pub trait NativeKernel: Send + Sync {
    /// Short human-readable kernel name, used in logs.
    fn name(&self) -> &str;

    /// Creates a device. Returns [`RawDevice::NULL`] on failure.
    fn new_device(&self, config: &str) -> RawDevice;
    fn delete_device(&self, device: RawDevice);

    /// Reads and clears the calling thread's error flag. `device` may be null to read
    /// errors raised by a failed [`new_device`](Self::new_device).
    fn device_error(&self, device: RawDevice) -> u32;

    /// `scene_flags` are [`SceneFlags`](crate::SceneFlags) bits, `algorithm_flags`
    /// are [`TraversalWidths`](crate::TraversalWidths) bits.
    fn new_scene(&self, device: RawDevice, scene_flags: u32, algorithm_flags: u32) -> RawScene;
    fn commit(&self, scene: RawScene);
    fn delete_scene(&self, scene: RawScene);

    /// Returns the new geometry id, or [`INVALID_ID`] on failure.
    fn new_triangle_mesh(
        &self,
        scene: RawScene,
        geometry_flags: u32,
        num_triangles: usize,
        num_vertices: usize,
        num_time_steps: usize,
    ) -> u32;

    /// Places `source` into `target`. Returns the new instance id, or [`INVALID_ID`].
    fn new_instance(&self, target: RawScene, source: RawScene) -> u32;
    fn set_transform(&self, scene: RawScene, geom_id: u32, layout: MatrixLayout, xfm: &[f32; 12]);

    /// Returns a writable pointer into kernel-owned storage, or null on failure.
    ///
    /// Index buffers hold three `u32` per triangle, vertex buffers four `f32` per vertex.
    /// The pointer stays valid until [`unmap_buffer`](Self::unmap_buffer).
    fn map_buffer(&self, scene: RawScene, geom_id: u32, kind: BufferKind) -> *mut u8;
    fn unmap_buffer(&self, scene: RawScene, geom_id: u32, kind: BufferKind);

    fn enable(&self, scene: RawScene, geom_id: u32);
    fn disable(&self, scene: RawScene, geom_id: u32);
    fn update(&self, scene: RawScene, geom_id: u32);
    fn delete_geometry(&self, scene: RawScene, geom_id: u32);

    fn intersect1(&self, scene: RawScene, ray: &mut RawRay1);
    fn intersect4(&self, valid: &RawMask4, scene: RawScene, ray: &mut RawRay4);
    fn intersect8(&self, valid: &RawMask8, scene: RawScene, ray: &mut RawRay8);
    fn intersect16(&self, valid: &RawMask16, scene: RawScene, ray: &mut RawRay16);

    fn occluded1(&self, scene: RawScene, ray: &mut RawRay1);
    fn occluded4(&self, valid: &RawMask4, scene: RawScene, ray: &mut RawRay4);
    fn occluded8(&self, valid: &RawMask8, scene: RawScene, ray: &mut RawRay8);
    fn occluded16(&self, valid: &RawMask16, scene: RawScene, ray: &mut RawRay16);
}
