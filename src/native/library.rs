//! Native kernel shared library resolved at runtime.

use super::abi::{RawMask4, RawMask8, RawMask16, RawRay1, RawRay4, RawRay8, RawRay16};
use super::{BufferKind, MatrixLayout, NativeKernel, RawDevice, RawScene};
use crate::error::{RayLinkError, Result};
use libloading::{Library, Symbol};
use std::ffi::{CString, c_char, c_void};
use std::fmt;
use std::path::{Path, PathBuf};

type Handle = *mut c_void;

type NewDeviceFn = unsafe extern "C" fn(*const c_char) -> Handle;
type DeleteDeviceFn = unsafe extern "C" fn(Handle);
type DeviceGetErrorFn = unsafe extern "C" fn(Handle) -> u32;
type NewSceneFn = unsafe extern "C" fn(Handle, u32, u32) -> Handle;
type SceneFn = unsafe extern "C" fn(Handle);
type NewTriangleMeshFn = unsafe extern "C" fn(Handle, u32, usize, usize, usize) -> u32;
type NewInstanceFn = unsafe extern "C" fn(Handle, Handle, usize) -> u32;
type SetTransformFn = unsafe extern "C" fn(Handle, u32, u32, *const f32, usize);
type MapBufferFn = unsafe extern "C" fn(Handle, u32, u32) -> *mut c_void;
type UnmapBufferFn = unsafe extern "C" fn(Handle, u32, u32);
type GeometryFn = unsafe extern "C" fn(Handle, u32);
type Trace1Fn = unsafe extern "C" fn(Handle, *mut RawRay1);
type Trace4Fn = unsafe extern "C" fn(*const c_void, Handle, *mut RawRay4);
type Trace8Fn = unsafe extern "C" fn(*const c_void, Handle, *mut RawRay8);
type Trace16Fn = unsafe extern "C" fn(*const c_void, Handle, *mut RawRay16);

struct Api {
    new_device: NewDeviceFn,
    delete_device: DeleteDeviceFn,
    device_get_error: DeviceGetErrorFn,
    new_scene: NewSceneFn,
    commit: SceneFn,
    delete_scene: SceneFn,
    new_triangle_mesh: NewTriangleMeshFn,
    new_instance: NewInstanceFn,
    set_transform: SetTransformFn,
    map_buffer: MapBufferFn,
    unmap_buffer: UnmapBufferFn,
    enable: GeometryFn,
    disable: GeometryFn,
    update: GeometryFn,
    delete_geometry: GeometryFn,
    intersect1: Trace1Fn,
    intersect4: Trace4Fn,
    intersect8: Trace8Fn,
    intersect16: Trace16Fn,
    occluded1: Trace1Fn,
    occluded4: Trace4Fn,
    occluded8: Trace8Fn,
    occluded16: Trace16Fn,
}

/// Copies a function pointer out of `library`.
///
/// # Safety
/// `T` must be the exact signature of the exported symbol.
unsafe fn symbol<T: Copy>(library: &Library, path: &Path, name: &str) -> Result<T> {
    let symbol: Symbol<T> = unsafe { library.get(name.as_bytes()) }.map_err(|e| {
        RayLinkError::Initialization(format!(
            "symbol '{}' not found in '{}': {}",
            name,
            path.display(),
            e
        ))
    })?;
    Ok(*symbol)
}

impl Api {
    /// # Safety
    /// `library` must export the kernel's C interface.
    unsafe fn resolve(library: &Library, path: &Path) -> Result<Self> {
        unsafe {
            Ok(Self {
                new_device: symbol(library, path, "rtcNewDevice")?,
                delete_device: symbol(library, path, "rtcDeleteDevice")?,
                device_get_error: symbol(library, path, "rtcDeviceGetError")?,
                new_scene: symbol(library, path, "rtcDeviceNewScene")?,
                commit: symbol(library, path, "rtcCommit")?,
                delete_scene: symbol(library, path, "rtcDeleteScene")?,
                new_triangle_mesh: symbol(library, path, "rtcNewTriangleMesh")?,
                new_instance: symbol(library, path, "rtcNewInstance2")?,
                set_transform: symbol(library, path, "rtcSetTransform2")?,
                map_buffer: symbol(library, path, "rtcMapBuffer")?,
                unmap_buffer: symbol(library, path, "rtcUnmapBuffer")?,
                enable: symbol(library, path, "rtcEnable")?,
                disable: symbol(library, path, "rtcDisable")?,
                update: symbol(library, path, "rtcUpdate")?,
                delete_geometry: symbol(library, path, "rtcDeleteGeometry")?,
                intersect1: symbol(library, path, "rtcIntersect")?,
                intersect4: symbol(library, path, "rtcIntersect4")?,
                intersect8: symbol(library, path, "rtcIntersect8")?,
                intersect16: symbol(library, path, "rtcIntersect16")?,
                occluded1: symbol(library, path, "rtcOccluded")?,
                occluded4: symbol(library, path, "rtcOccluded4")?,
                occluded8: symbol(library, path, "rtcOccluded8")?,
                occluded16: symbol(library, path, "rtcOccluded16")?,
            })
        }
    }
}

fn handle(raw: usize) -> Handle {
    raw as Handle
}

/// A native kernel loaded from a shared library.
///
/// The function table is resolved once at load time; the library stays mapped for
/// as long as this value lives.
pub struct NativeLibrary {
    api: Api,
    path: PathBuf,
    /// Must outlive every function pointer in `api`
    _library: Library,
}

impl NativeLibrary {
    /// Platform file name of the native kernel library.
    pub fn default_name() -> &'static str {
        #[cfg(target_os = "windows")]
        {
            "embree.dll"
        }
        #[cfg(target_os = "macos")]
        {
            "libembree.2.dylib"
        }
        #[cfg(not(any(target_os = "windows", target_os = "macos")))]
        {
            "libembree.so.2"
        }
    }

    /// Loads the kernel library at `path` and resolves its entry points.
    ///
    /// # Safety
    /// Loading runs the library's initializers, and the resolved symbols are trusted
    /// to have the kernel's C signatures. `path` must point at a genuine kernel build.
    ///
    /// The native kernel does not synchronize mutation against traversal. A device
    /// backed by this library relies on the caller never running a commit,
    /// [`Geometry::add`](crate::Geometry::add), [`Geometry::remove`](crate::Geometry::remove)
    /// or a `Mesh::modify_*` call on shared objects while queries are in flight.
    ///
    /// # Errors
    /// Returns [`RayLinkError::Initialization`] if the library cannot be loaded or an
    /// entry point is missing.
    pub unsafe fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let library = unsafe { Library::new(path) }.map_err(|e| {
            RayLinkError::Initialization(format!(
                "failed to load kernel library '{}': {}",
                path.display(),
                e
            ))
        })?;
        let api = unsafe { Api::resolve(&library, path)? };

        log::info!("Loaded native kernel from {}", path.display());

        Ok(Self {
            api,
            path: path.to_path_buf(),
            _library: library,
        })
    }

    /// Loads [`default_name`](Self::default_name) through the system search path.
    ///
    /// # Safety
    /// See [`load`](Self::load).
    pub unsafe fn load_default() -> Result<Self> {
        unsafe { Self::load(Self::default_name()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Debug for NativeLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeLibrary")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

// SAFETY (for every call below): the function pointers were resolved from a library
// that is kept loaded by `self`, handles originate from the same library, and ray
// and mask pointers come from live, correctly aligned references.
impl NativeKernel for NativeLibrary {
    fn name(&self) -> &str {
        "native"
    }

    fn new_device(&self, config: &str) -> RawDevice {
        let config = CString::new(config.replace('\0', "")).unwrap_or_default();
        RawDevice(unsafe { (self.api.new_device)(config.as_ptr()) } as usize)
    }

    fn delete_device(&self, device: RawDevice) {
        unsafe { (self.api.delete_device)(handle(device.0)) }
    }

    fn device_error(&self, device: RawDevice) -> u32 {
        unsafe { (self.api.device_get_error)(handle(device.0)) }
    }

    fn new_scene(&self, device: RawDevice, scene_flags: u32, algorithm_flags: u32) -> RawScene {
        RawScene(
            unsafe { (self.api.new_scene)(handle(device.0), scene_flags, algorithm_flags) }
                as usize,
        )
    }

    fn commit(&self, scene: RawScene) {
        unsafe { (self.api.commit)(handle(scene.0)) }
    }

    fn delete_scene(&self, scene: RawScene) {
        unsafe { (self.api.delete_scene)(handle(scene.0)) }
    }

    fn new_triangle_mesh(
        &self,
        scene: RawScene,
        geometry_flags: u32,
        num_triangles: usize,
        num_vertices: usize,
        num_time_steps: usize,
    ) -> u32 {
        unsafe {
            (self.api.new_triangle_mesh)(
                handle(scene.0),
                geometry_flags,
                num_triangles,
                num_vertices,
                num_time_steps,
            )
        }
    }

    fn new_instance(&self, target: RawScene, source: RawScene) -> u32 {
        unsafe { (self.api.new_instance)(handle(target.0), handle(source.0), 1) }
    }

    fn set_transform(&self, scene: RawScene, geom_id: u32, layout: MatrixLayout, xfm: &[f32; 12]) {
        unsafe {
            (self.api.set_transform)(handle(scene.0), geom_id, layout as u32, xfm.as_ptr(), 0)
        }
    }

    fn map_buffer(&self, scene: RawScene, geom_id: u32, kind: BufferKind) -> *mut u8 {
        unsafe { (self.api.map_buffer)(handle(scene.0), geom_id, kind as u32) }.cast()
    }

    fn unmap_buffer(&self, scene: RawScene, geom_id: u32, kind: BufferKind) {
        unsafe { (self.api.unmap_buffer)(handle(scene.0), geom_id, kind as u32) }
    }

    fn enable(&self, scene: RawScene, geom_id: u32) {
        unsafe { (self.api.enable)(handle(scene.0), geom_id) }
    }

    fn disable(&self, scene: RawScene, geom_id: u32) {
        unsafe { (self.api.disable)(handle(scene.0), geom_id) }
    }

    fn update(&self, scene: RawScene, geom_id: u32) {
        unsafe { (self.api.update)(handle(scene.0), geom_id) }
    }

    fn delete_geometry(&self, scene: RawScene, geom_id: u32) {
        unsafe { (self.api.delete_geometry)(handle(scene.0), geom_id) }
    }

    fn intersect1(&self, scene: RawScene, ray: &mut RawRay1) {
        unsafe { (self.api.intersect1)(handle(scene.0), ray) }
    }

    fn intersect4(&self, valid: &RawMask4, scene: RawScene, ray: &mut RawRay4) {
        unsafe { (self.api.intersect4)((valid as *const RawMask4).cast(), handle(scene.0), ray) }
    }

    fn intersect8(&self, valid: &RawMask8, scene: RawScene, ray: &mut RawRay8) {
        unsafe { (self.api.intersect8)((valid as *const RawMask8).cast(), handle(scene.0), ray) }
    }

    fn intersect16(&self, valid: &RawMask16, scene: RawScene, ray: &mut RawRay16) {
        unsafe {
            (self.api.intersect16)((valid as *const RawMask16).cast(), handle(scene.0), ray)
        }
    }

    fn occluded1(&self, scene: RawScene, ray: &mut RawRay1) {
        unsafe { (self.api.occluded1)(handle(scene.0), ray) }
    }

    fn occluded4(&self, valid: &RawMask4, scene: RawScene, ray: &mut RawRay4) {
        unsafe { (self.api.occluded4)((valid as *const RawMask4).cast(), handle(scene.0), ray) }
    }

    fn occluded8(&self, valid: &RawMask8, scene: RawScene, ray: &mut RawRay8) {
        unsafe { (self.api.occluded8)((valid as *const RawMask8).cast(), handle(scene.0), ray) }
    }

    fn occluded16(&self, valid: &RawMask16, scene: RawScene, ray: &mut RawRay16) {
        unsafe {
            (self.api.occluded16)((valid as *const RawMask16).cast(), handle(scene.0), ray)
        }
    }
}
