//! Native device ownership and error polling

use crate::config::{DeviceDesc, KernelSource};
use crate::error::{NativeErrorCode, RayLinkError, Result};
use crate::native::{NativeKernel, NativeLibrary, RawDevice, SoftwareKernel};
use std::fmt;
use std::sync::Arc;

struct DeviceInner {
    kernel: Arc<dyn NativeKernel>,
    raw: RawDevice,
    desc: DeviceDesc,
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        self.kernel.delete_device(self.raw);
        log::info!("{} device {} released", self.kernel.name(), self.raw.0);
    }
}

/// Owns exactly one native kernel context.
///
/// `Device` is a cheap handle: clones share the same context, and every [`Geometry`]
/// and [`Scene`] keeps a clone, so the context always outlives its children. The
/// native context is released when the last handle is dropped.
///
/// [`Geometry`]: crate::Geometry
/// [`Scene`]: crate::Scene
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    /// Creates a device on the built-in software kernel.
    ///
    /// # Arguments
    /// * `verbose` - Ask the kernel to log every call it receives
    pub fn create(verbose: bool) -> Result<Self> {
        Self::new(DeviceDesc::new().verbose(verbose))
    }

    /// Creates a device from a descriptor, loading a native library if requested.
    ///
    /// # Errors
    /// Returns [`RayLinkError::Initialization`] if the kernel library cannot be loaded
    /// or the kernel refuses to create a context (e.g. the CPU lacks the required
    /// SIMD instruction set).
    pub fn new(desc: DeviceDesc) -> Result<Self> {
        let kernel: Arc<dyn NativeKernel> = match &desc.kernel {
            KernelSource::Software => Arc::new(SoftwareKernel::new()),
            // SAFETY: the path was configured explicitly as a kernel library.
            KernelSource::Library(path) => Arc::new(unsafe { NativeLibrary::load(path)? }),
        };
        Self::with_kernel(kernel, desc)
    }

    /// Creates a device from `RAYLINK_KERNEL` / `RAYLINK_VERBOSE`.
    pub fn from_env() -> Result<Self> {
        Self::new(DeviceDesc::from_env())
    }

    /// Creates a device on an already constructed kernel. `desc.kernel` is ignored.
    pub fn with_kernel(kernel: Arc<dyn NativeKernel>, desc: DeviceDesc) -> Result<Self> {
        let config = desc.config_string();
        let raw = kernel.new_device(&config);
        if raw.is_null() {
            let code = NativeErrorCode::from_raw(kernel.device_error(RawDevice::NULL))
                .unwrap_or(NativeErrorCode::Unknown);
            return Err(RayLinkError::Initialization(format!(
                "{} kernel failed to create a device: {}",
                kernel.name(),
                code
            )));
        }

        log::info!(
            "Created {} device {} (config: '{}')",
            kernel.name(),
            raw.0,
            config
        );

        Ok(Self {
            inner: Arc::new(DeviceInner { kernel, raw, desc }),
        })
    }

    /// Reads and clears the calling thread's native error flag.
    ///
    /// # Arguments
    /// * `operation` - Name of the native call being checked, carried in the error
    ///
    /// # Errors
    /// Returns [`RayLinkError::NativeKernel`] if the flag was set.
    pub fn check_error(&self, operation: &'static str) -> Result<()> {
        match NativeErrorCode::from_raw(self.inner.kernel.device_error(self.inner.raw)) {
            None => Ok(()),
            Some(code) => Err(RayLinkError::NativeKernel { code, operation }),
        }
    }

    /// Like [`check_error`](Self::check_error), but also fails if the native call
    /// signalled failure through its return value without raising the flag.
    pub(crate) fn check_result(&self, operation: &'static str, failed: bool) -> Result<()> {
        self.check_error(operation)?;
        if failed {
            return Err(RayLinkError::NativeKernel {
                code: NativeErrorCode::Unknown,
                operation,
            });
        }
        Ok(())
    }

    /// Releases the device explicitly.
    ///
    /// # Errors
    /// Returns [`RayLinkError::DeviceInUse`] with the number of other live handles
    /// (geometries, scenes or clones) if this is not the last one. The device stays
    /// alive in that case and is released when the last handle drops.
    pub fn close(self) -> Result<()> {
        let others = Arc::strong_count(&self.inner) - 1;
        if others > 0 {
            return Err(RayLinkError::DeviceInUse(others));
        }
        Ok(())
    }

    pub fn desc(&self) -> &DeviceDesc {
        &self.inner.desc
    }

    pub fn kernel_name(&self) -> &str {
        self.inner.kernel.name()
    }

    pub(crate) fn kernel(&self) -> &dyn NativeKernel {
        self.inner.kernel.as_ref()
    }

    pub(crate) fn raw(&self) -> RawDevice {
        self.inner.raw
    }

    /// Whether both handles share one native context.
    pub fn same_device(&self, other: &Device) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("kernel", &self.inner.kernel.name())
            .field("raw", &self.inner.raw)
            .field("verbose", &self.inner.desc.verbose)
            .finish()
    }
}
