//! Configuration for raylink devices, scenes and meshes

use std::path::PathBuf;

/// Where the ray-tracing kernel comes from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum KernelSource {
    /// The built-in software kernel (always available).
    #[default]
    Software,
    /// A native kernel shared library loaded at runtime.
    Library(PathBuf),
}

/// Configuration descriptor for a [`Device`](crate::Device)
#[derive(Debug, Clone, Default)]
pub struct DeviceDesc {
    /// Ask the kernel to log every call it receives
    pub verbose: bool,
    /// Kernel implementation backing the device
    pub kernel: KernelSource,
    /// Extra kernel configuration string, appended to the generated one
    pub config: Option<String>,
}

impl DeviceDesc {
    pub const KERNEL_ENV: &'static str = "RAYLINK_KERNEL";
    pub const VERBOSE_ENV: &'static str = "RAYLINK_VERBOSE";

    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a descriptor from `RAYLINK_KERNEL` and `RAYLINK_VERBOSE`.
    ///
    /// `RAYLINK_KERNEL` is a path to a native kernel library; unset, empty or
    /// `software` selects the built-in kernel.
    pub fn from_env() -> Self {
        let kernel = match std::env::var(Self::KERNEL_ENV) {
            Ok(value) => Self::parse_kernel(&value),
            Err(_) => KernelSource::Software,
        };
        let verbose = std::env::var(Self::VERBOSE_ENV)
            .map(|value| Self::parse_flag(&value))
            .unwrap_or(false);

        Self {
            verbose,
            kernel,
            config: None,
        }
    }

    fn parse_kernel(value: &str) -> KernelSource {
        let value = value.trim();
        if value.is_empty() || value.eq_ignore_ascii_case("software") {
            KernelSource::Software
        } else {
            KernelSource::Library(PathBuf::from(value))
        }
    }

    fn parse_flag(value: &str) -> bool {
        matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn kernel(mut self, kernel: KernelSource) -> Self {
        self.kernel = kernel;
        self
    }

    pub fn config(mut self, config: impl Into<String>) -> Self {
        self.config = Some(config.into());
        self
    }

    /// The configuration string handed to the kernel's device constructor.
    pub fn config_string(&self) -> String {
        let mut parts = Vec::new();
        if self.verbose {
            parts.push("verbose=1".to_string());
        }
        if let Some(extra) = self.config.as_deref().filter(|c| !c.is_empty()) {
            parts.push(extra.to_string());
        }
        parts.join(",")
    }
}

bitflags::bitflags! {
    /// Build hints for a native scene. Raw bits are the kernel's scene flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SceneFlags: u32 {
        const DYNAMIC = 1 << 0;
        const COMPACT = 1 << 8;
        const COHERENT = 1 << 9;
        const INCOHERENT = 1 << 10;
        const HIGH_QUALITY = 1 << 11;
        const ROBUST = 1 << 16;
    }
}

impl SceneFlags {
    /// Static scenes have no flag bits set.
    pub const STATIC: Self = Self::empty();

    pub fn is_dynamic(self) -> bool {
        self.contains(Self::DYNAMIC)
    }
}

impl Default for SceneFlags {
    fn default() -> Self {
        Self::STATIC
    }
}

bitflags::bitflags! {
    /// Packet widths a scene can be traversed with. Raw bits are the kernel's
    /// algorithm flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TraversalWidths: u32 {
        const W1 = 1 << 0;
        const W4 = 1 << 1;
        const W8 = 1 << 2;
        const W16 = 1 << 3;
    }
}

impl TraversalWidths {
    /// Flag for a packet width, or `None` if the kernel has no such width.
    pub fn from_width(width: u32) -> Option<Self> {
        match width {
            1 => Some(Self::W1),
            4 => Some(Self::W4),
            8 => Some(Self::W8),
            16 => Some(Self::W16),
            _ => None,
        }
    }

    pub fn supports(self, width: u32) -> bool {
        Self::from_width(width).is_some_and(|flag| self.contains(flag))
    }

    /// Enabled widths in ascending order.
    pub fn widths(self) -> impl Iterator<Item = u32> {
        [1, 4, 8, 16]
            .into_iter()
            .filter(move |width| self.supports(*width))
    }
}

impl Default for TraversalWidths {
    fn default() -> Self {
        Self::W1
    }
}

/// Configuration shared by [`Geometry`](crate::Geometry) and [`Scene`](crate::Scene)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SceneDesc {
    pub flags: SceneFlags,
    pub widths: TraversalWidths,
}

impl SceneDesc {
    pub fn new(flags: SceneFlags, widths: TraversalWidths) -> Self {
        Self { flags, widths }
    }

    pub fn flags(mut self, flags: SceneFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn widths(mut self, widths: TraversalWidths) -> Self {
        self.widths = widths;
        self
    }

    pub fn dynamic(mut self) -> Self {
        self.flags |= SceneFlags::DYNAMIC;
        self
    }

    pub fn is_dynamic(&self) -> bool {
        self.flags.is_dynamic()
    }
}

/// How often a mesh's buffers are expected to change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MeshKind {
    /// Uploaded once; the kernel rejects later re-uploads.
    #[default]
    Static,
    /// Vertices move, topology is fixed.
    Deformable,
    /// Vertices and indices may change.
    Dynamic,
}

impl MeshKind {
    /// Native geometry flag value
    pub fn as_raw(self) -> u32 {
        match self {
            Self::Static => 0,
            Self::Deformable => 1,
            Self::Dynamic => 2,
        }
    }
}
