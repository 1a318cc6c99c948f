//! # raylink
//!
//! A safe scene and geometry layer over SIMD ray-tracing kernels that speak the
//! classic handle-based C protocol: opaque device and scene handles, integer geometry
//! ids, map/unmap buffer uploads, an explicit commit step and aligned ray packets of
//! width 1, 4, 8 and 16.
//!
//! ## Quick Start
//!
//! ```
//! use raylink::*;
//! use std::sync::Arc;
//!
//! // One native context; geometries and scenes keep it alive
//! let device = Device::create(false)?;
//! let desc = SceneDesc::default().widths(TraversalWidths::W1 | TraversalWidths::W4);
//!
//! // Meshes live in a geometry, geometries are placed into a scene by instances
//! let geometry = Arc::new(Geometry::new(&device, desc)?);
//! let mesh = Arc::new(Mesh::new(
//!     vec![0, 1, 2],
//!     vec![Vec3::ZERO, Vec3::X, Vec3::Y],
//! )?);
//! geometry.add(mesh, MeshKind::Static)?;
//!
//! let mut scene = Scene::new(&device, desc)?;
//! let instance = Arc::new(GeometryInstance::new(geometry));
//! scene.add(instance.clone())?;
//!
//! // Nothing reaches the kernel until commit
//! scene.commit()?;
//!
//! // Each worker owns its scratch buffers
//! let mut scratch = QueryScratch::new();
//! let rays = [
//!     Ray::new(Vec3::new(0.25, 0.25, -1.0), Vec3::Z),
//!     Ray::new(Vec3::new(5.0, 5.0, -1.0), Vec3::Z),
//! ];
//! let hits = scene.intersect4(&mut scratch, &rays)?;
//! assert!(hits[0].is_some());
//! assert!(hits[1].is_none());
//!
//! // Move the instance; visible after the next commit
//! instance.set_transform(Affine3A::from_translation(Vec3::new(0.0, 0.0, 1.0)));
//! scene.commit()?;
//! let hit = scene.intersect1(&mut scratch, &rays[0])?.expect("still hit");
//! assert!((hit.distance - 2.0).abs() < 1e-5);
//! # Ok::<(), RayLinkError>(())
//! ```
//!
//! ## Key Components
//!
//! - **[`Device`]**: owns one kernel context
//! - **[`Geometry`]**: a set of [`Mesh`]es in a native sub-scene
//! - **[`Scene`]**: instanced geometries, commit, and the intersect/occlude queries
//! - **[`Instance`]**: trait for anything a scene can place; [`GeometryInstance`] is
//!   the ready-made implementation
//! - **[`QueryScratch`]**: per-thread aligned packet buffers
//! - **[`NativeKernel`](native::NativeKernel)**: the kernel's C interface, implemented
//!   by the built-in [`SoftwareKernel`](native::SoftwareKernel) and by
//!   [`NativeLibrary`](native::NativeLibrary) for shared libraries loaded at runtime
//!
//! ## Ownership and threading
//!
//! Children hold their parents: instances hold geometries and every geometry and
//! scene holds the device. Native objects are released in reverse order of creation
//! as the handles drop. Mutation takes `&mut Scene`, queries take `&Scene`, so a
//! committed scene can be shared across threads for traversal.
//!
//! Geometries and meshes are shared through `Arc` and mutate through `&self`, which
//! the borrow checker can't keep apart from queries. Callers must finish such changes
//! (and any commit of another scene sharing the geometry) before tracing. A scene whose
//! geometries gained or lost meshes refuses queries until it is committed again.

pub mod arena;
pub mod config;
pub mod device;
pub mod error;
pub mod geometry;
pub mod instance;
pub mod math;
pub mod mesh;
pub mod native;
pub mod packet;
pub mod scene;

pub use arena::{GeometryId, InstanceId};
pub use config::{DeviceDesc, KernelSource, MeshKind, SceneDesc, SceneFlags, TraversalWidths};
pub use device::Device;
pub use error::{ErrorKind, NativeErrorCode, RayLinkError, Result};
pub use geometry::Geometry;
pub use instance::{GeometryInstance, Instance};
pub use math::{Affine3A, Vec3};
pub use mesh::Mesh;
pub use packet::{Intersection, PacketBuffer, PacketWidth, QueryScratch, Ray, W1, W4, W8, W16};
pub use scene::Scene;
