use raylink::*;
use rayon::prelude::*;
use std::sync::Arc;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn unit_triangle() -> Arc<Mesh> {
    Arc::new(Mesh::new(vec![0, 1, 2], vec![Vec3::ZERO, Vec3::X, Vec3::Y]).unwrap())
}

fn center_ray() -> Ray {
    Ray::new(Vec3::new(0.25, 0.25, -1.0), Vec3::Z)
}

struct Fixture {
    device: Device,
    geometry: Arc<Geometry>,
    mesh: Arc<Mesh>,
    instance: Arc<GeometryInstance>,
    scene: Scene<GeometryInstance>,
}

fn fixture(desc: SceneDesc, kind: MeshKind) -> Fixture {
    init_logger();
    let device = Device::create(false).unwrap();
    let geometry = Arc::new(Geometry::new(&device, desc).unwrap());
    let mesh = unit_triangle();
    geometry.add(mesh.clone(), kind).unwrap();

    let mut scene = Scene::new(&device, desc).unwrap();
    let instance = Arc::new(GeometryInstance::new(geometry.clone()));
    scene.add(instance.clone()).unwrap();
    scene.commit().unwrap();

    Fixture {
        device,
        geometry,
        mesh,
        instance,
        scene,
    }
}

#[test]
fn test_single_triangle_hit() {
    let f = fixture(SceneDesc::default(), MeshKind::Static);
    let mut scratch = QueryScratch::new();
    let ray = center_ray();

    let hit = f.scene.intersect1(&mut scratch, &ray).unwrap().expect("hit");
    assert!((hit.distance - 1.0).abs() < 1e-5);
    assert!(hit.u >= 0.0 && hit.v >= 0.0 && hit.u + hit.v <= 1.0);
    assert!((hit.u - 0.25).abs() < 1e-5 && (hit.v - 0.25).abs() < 1e-5);
    assert_eq!(hit.primitive, 0);
    assert!(Arc::ptr_eq(&hit.mesh, &f.mesh));
    assert!(Arc::ptr_eq(&hit.instance, &f.instance));
    assert!(hit.hit_point(&ray).abs_diff_eq(Vec3::new(0.25, 0.25, 0.0), 1e-5));
    // raw normal: object space, unnormalized
    assert!(hit.normal.cross(Vec3::Z).length() < 1e-6);
    assert!(hit.normal.length() > 0.0);
}

#[test]
fn test_miss_and_range() {
    let f = fixture(SceneDesc::default(), MeshKind::Static);
    let mut scratch = QueryScratch::new();

    let away = Ray::new(Vec3::new(0.25, 0.25, -1.0), -Vec3::Z);
    assert!(f.scene.intersect1(&mut scratch, &away).unwrap().is_none());

    let short = center_ray().with_range(0.0, 0.5);
    assert!(f.scene.intersect1(&mut scratch, &short).unwrap().is_none());
    assert!(!f.scene.occluded1(&mut scratch, &short).unwrap());

    let beyond = center_ray().with_range(1.5, 10.0);
    assert!(f.scene.intersect1(&mut scratch, &beyond).unwrap().is_none());
}

#[test]
fn test_removed_mesh_no_longer_hit() {
    let mut f = fixture(SceneDesc::default(), MeshKind::Static);
    let mut scratch = QueryScratch::new();
    assert!(f.scene.intersect1(&mut scratch, &center_ray()).unwrap().is_some());

    f.geometry.remove(&f.mesh).unwrap();
    f.scene.commit().unwrap();
    assert!(f.scene.intersect1(&mut scratch, &center_ray()).unwrap().is_none());

    let err = f.geometry.remove(&f.mesh).unwrap_err();
    assert!(matches!(err, RayLinkError::NotFound(_)));
}

#[test]
fn test_commit_is_idempotent() {
    let desc = SceneDesc::default().widths(TraversalWidths::W1 | TraversalWidths::W4);
    let mut f = fixture(desc, MeshKind::Static);
    let mut scratch = QueryScratch::new();
    let rays = [
        center_ray(),
        Ray::new(Vec3::new(0.9, 0.9, -1.0), Vec3::Z),
        Ray::new(Vec3::new(0.1, 0.8, 2.0), -Vec3::Z),
    ];

    let summarize = |hits: Vec<Option<Intersection<GeometryInstance>>>| {
        hits.into_iter()
            .map(|hit| hit.map(|h| (h.distance, h.primitive, h.u, h.v)))
            .collect::<Vec<_>>()
    };

    let first = summarize(f.scene.intersect4(&mut scratch, &rays).unwrap());
    f.scene.commit().unwrap();
    f.scene.commit().unwrap();
    let second = summarize(f.scene.intersect4(&mut scratch, &rays).unwrap());
    assert_eq!(first, second);
    assert!(first[0].is_some());
    assert!(first[1].is_none());
    assert!(first[2].is_some());
}

#[test]
fn test_width4_partial_packet() {
    let f = fixture(SceneDesc::default().widths(TraversalWidths::W4), MeshKind::Static);
    let mut scratch = QueryScratch::new();

    // Every ray would hit; only the first two are active.
    let rays = [
        center_ray(),
        center_ray(),
        center_ray().with_active(false),
        center_ray().with_active(false),
    ];
    let hits = f.scene.intersect4(&mut scratch, &rays).unwrap();
    assert_eq!(hits.len(), 4);
    assert!(hits[0].is_some() && hits[1].is_some());
    assert!(hits[2].is_none() && hits[3].is_none());

    let hits = f.scene.intersect4(&mut scratch, &rays[..2]).unwrap();
    assert_eq!(hits.len(), 2);
    assert!(hits.iter().all(Option::is_some));

    let occluded = f.scene.occluded4(&mut scratch, &rays).unwrap();
    assert_eq!(occluded, vec![true, true, false, false]);
}

#[test]
fn test_wide_packets() {
    let desc = SceneDesc::default().widths(TraversalWidths::W8 | TraversalWidths::W16);
    let f = fixture(desc, MeshKind::Static);
    let mut scratch = QueryScratch::new();

    let rays: Vec<Ray> = (0..16)
        .map(|i| {
            let x = if i % 2 == 0 { 0.25 } else { 3.0 };
            Ray::new(Vec3::new(x, 0.25, -1.0), Vec3::Z)
        })
        .collect();

    let hits = f.scene.intersect16(&mut scratch, &rays).unwrap();
    for (i, hit) in hits.iter().enumerate() {
        assert_eq!(hit.is_some(), i % 2 == 0, "lane {}", i);
    }

    let occluded = f.scene.occluded8(&mut scratch, &rays[..8]).unwrap();
    assert_eq!(occluded, vec![true, false, true, false, true, false, true, false]);

    assert!(matches!(
        f.scene.intersect1(&mut scratch, &center_ray()),
        Err(RayLinkError::UnsupportedTraversalWidth(1))
    ));
    assert!(matches!(
        f.scene.intersect4(&mut scratch, &rays[..4]),
        Err(RayLinkError::UnsupportedTraversalWidth(4))
    ));
}

#[test]
fn test_instance_transform_and_visibility() {
    let mut f = fixture(SceneDesc::default(), MeshKind::Static);
    let mut scratch = QueryScratch::new();

    f.instance.set_transform(Affine3A::from_translation(Vec3::new(10.0, 0.0, 3.0)));
    // staged only
    assert!(f.scene.intersect1(&mut scratch, &center_ray()).unwrap().is_some());

    f.scene.commit().unwrap();
    assert!(f.scene.intersect1(&mut scratch, &center_ray()).unwrap().is_none());
    let moved = Ray::new(Vec3::new(10.25, 0.25, -1.0), Vec3::Z);
    let hit = f.scene.intersect1(&mut scratch, &moved).unwrap().expect("hit");
    assert!((hit.distance - 4.0).abs() < 1e-5);

    f.instance.set_enabled(false);
    f.scene.commit().unwrap();
    assert!(f.scene.intersect1(&mut scratch, &moved).unwrap().is_none());

    f.instance.set_enabled(true);
    f.scene.commit().unwrap();
    assert!(f.scene.intersect1(&mut scratch, &moved).unwrap().is_some());
}

#[test]
fn test_shared_geometry_two_instances() {
    let mut f = fixture(SceneDesc::default(), MeshKind::Static);
    let mut scratch = QueryScratch::new();

    let second = Arc::new(GeometryInstance::with_transform(
        f.geometry.clone(),
        Affine3A::from_translation(Vec3::new(0.0, 0.0, 5.0)),
    ));
    let second_id = f.scene.add(second.clone()).unwrap();
    assert_eq!(f.scene.len(), 2);
    f.scene.commit().unwrap();

    // nearest of the two stacked copies
    let hit = f.scene.intersect1(&mut scratch, &center_ray()).unwrap().unwrap();
    assert!(Arc::ptr_eq(&hit.instance, &f.instance));

    f.scene.delete(&f.instance).unwrap();
    f.scene.commit().unwrap();
    let hit = f.scene.intersect1(&mut scratch, &center_ray()).unwrap().unwrap();
    assert_eq!(hit.instance_id, second_id);
    assert!((hit.distance - 6.0).abs() < 1e-5);
    assert!(matches!(
        f.scene.add(second),
        Err(RayLinkError::AlreadyAdded(_))
    ));
}

#[test]
fn test_motion_blur() {
    init_logger();
    let device = Device::create(false).unwrap();
    let geometry = Arc::new(Geometry::new(&device, SceneDesc::default()).unwrap());
    let t0 = vec![Vec3::ZERO, Vec3::X, Vec3::Y];
    let t1: Vec<Vec3> = t0.iter().map(|v| *v + Vec3::new(0.0, 0.0, 2.0)).collect();
    geometry
        .add(Arc::new(Mesh::with_motion(vec![0, 1, 2], t0, t1).unwrap()), MeshKind::Static)
        .unwrap();

    let mut scene = Scene::new(&device, SceneDesc::default()).unwrap();
    scene.add(Arc::new(GeometryInstance::new(geometry))).unwrap();
    scene.commit().unwrap();

    let mut scratch = QueryScratch::new();
    for (time, expected) in [(0.0, 1.0), (0.5, 2.0), (1.0, 3.0)] {
        let hit = scene
            .intersect1(&mut scratch, &center_ray().at_time(time))
            .unwrap()
            .expect("hit");
        assert!((hit.distance - expected).abs() < 1e-5, "time {}", time);
    }
}

#[test]
fn test_occlusion() {
    let f = fixture(SceneDesc::default(), MeshKind::Static);
    let mut scratch = QueryScratch::new();
    assert!(f.scene.occluded1(&mut scratch, &center_ray()).unwrap());
    let beside = Ray::new(Vec3::new(2.0, 2.0, -1.0), Vec3::Z);
    assert!(!f.scene.occluded1(&mut scratch, &beside).unwrap());
}

#[test]
fn test_dynamic_mesh_reupload() {
    let desc = SceneDesc::default().dynamic();
    let mut f = fixture(desc, MeshKind::Deformable);
    let mut scratch = QueryScratch::new();

    f.mesh.modify_vertices(|vertices| {
        for v in vertices.iter_mut() {
            v.z = 4.0;
        }
    });
    // not visible before commit
    let hit = f.scene.intersect1(&mut scratch, &center_ray()).unwrap().unwrap();
    assert!((hit.distance - 1.0).abs() < 1e-5);

    f.scene.commit().unwrap();
    let hit = f.scene.intersect1(&mut scratch, &center_ray()).unwrap().unwrap();
    assert!((hit.distance - 5.0).abs() < 1e-5);

    f.mesh.modify_vertices(|vertices| vertices.push(Vec3::ONE));
    let err = f.scene.commit().unwrap_err();
    assert!(matches!(
        err,
        RayLinkError::BufferLengthChanged {
            expected: 3,
            actual: 4,
            ..
        }
    ));
    assert_eq!(err.kind(), ErrorKind::Integrity);
    assert!(matches!(
        f.scene.intersect1(&mut scratch, &center_ray()),
        Err(RayLinkError::NotCommitted)
    ));

    f.mesh.modify_vertices(|vertices| vertices.truncate(3));
    f.scene.commit().unwrap();
    assert!(f.scene.intersect1(&mut scratch, &center_ray()).unwrap().is_some());
}

#[test]
fn test_out_of_range_index_rejected_on_commit() {
    let desc = SceneDesc::default().dynamic();
    let mut f = fixture(desc, MeshKind::Deformable);
    let mut scratch = QueryScratch::new();

    f.mesh.modify_indices(|indices| indices[2] = 1_000_000);
    let err = f.scene.commit().unwrap_err();
    assert!(matches!(err, RayLinkError::InvalidMesh(_)));
    assert_eq!(err.kind(), ErrorKind::Integrity);
    assert!(matches!(
        f.scene.intersect1(&mut scratch, &center_ray()),
        Err(RayLinkError::NotCommitted)
    ));

    f.mesh.modify_indices(|indices| indices[2] = 2);
    f.scene.commit().unwrap();
    let hit = f.scene.intersect1(&mut scratch, &center_ray()).unwrap().unwrap();
    assert!((hit.distance - 1.0).abs() < 1e-5);
}

#[test]
fn test_mesh_swap_without_commit_is_refused() {
    let mut f = fixture(SceneDesc::default(), MeshKind::Static);
    let mut scratch = QueryScratch::new();
    let old_id = f.geometry.id_of(&f.mesh).unwrap();

    f.geometry.remove(&f.mesh).unwrap();
    let far = Vec3::new(0.0, 0.0, 50.0);
    let replacement =
        Arc::new(Mesh::new(vec![0, 1, 2], vec![far, far + Vec3::X, far + Vec3::Y]).unwrap());
    let new_id = f.geometry.add(replacement.clone(), MeshKind::Static).unwrap();
    assert_eq!(old_id.raw(), new_id.raw());

    assert!(!f.scene.is_committed());
    assert!(matches!(
        f.scene.intersect1(&mut scratch, &center_ray()),
        Err(RayLinkError::NotCommitted)
    ));

    f.scene.commit().unwrap();
    let hit = f.scene.intersect1(&mut scratch, &center_ray()).unwrap().unwrap();
    assert_eq!(hit.geometry_id, new_id);
    assert!(Arc::ptr_eq(&hit.mesh, &replacement));
    assert!((hit.distance - 51.0).abs() < 1e-4);
}

#[test]
fn test_static_mesh_rejects_reupload() {
    let mut f = fixture(SceneDesc::default(), MeshKind::Static);
    f.mesh.mark_for_upload();
    let err = f.scene.commit().unwrap_err();
    assert_eq!(err.native_code(), Some(NativeErrorCode::InvalidOperation));
}

#[test]
fn test_incompatible_instance_leaves_scene_unchanged() {
    let mut f = fixture(SceneDesc::default(), MeshKind::Static);
    let wide = Arc::new(
        Geometry::new(&f.device, SceneDesc::default().widths(TraversalWidths::all())).unwrap(),
    );
    wide.add(unit_triangle(), MeshKind::Static).unwrap();

    let before: Vec<InstanceId> = f.scene.instances().map(|(id, _)| id).collect();
    let err = f
        .scene
        .add(Arc::new(GeometryInstance::new(wide)))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    let after: Vec<InstanceId> = f.scene.instances().map(|(id, _)| id).collect();
    assert_eq!(before, after);
    assert!(f.scene.is_committed());
}

#[test]
fn test_uncommitted_scene_rejects_queries() {
    init_logger();
    let device = Device::create(false).unwrap();
    let scene: Scene<GeometryInstance> = Scene::new(&device, SceneDesc::default()).unwrap();
    let mut scratch = QueryScratch::new();
    assert!(matches!(
        scene.intersect1(&mut scratch, &center_ray()),
        Err(RayLinkError::NotCommitted)
    ));
}

#[test]
fn test_device_outlives_children() {
    let f = fixture(SceneDesc::default(), MeshKind::Static);
    let Fixture {
        device,
        geometry,
        instance,
        scene,
        ..
    } = f;

    let device = match device.close() {
        Err(RayLinkError::DeviceInUse(n)) => {
            assert!(n >= 2);
            scene.device().clone()
        }
        other => panic!("unexpected close result: {:?}", other),
    };

    drop(scene);
    drop(instance);
    drop(geometry);
    assert!(device.close().is_ok());
}

#[test]
fn test_parallel_queries() {
    let desc = SceneDesc::default().widths(TraversalWidths::W1 | TraversalWidths::W8);
    let f = fixture(desc, MeshKind::Static);
    let scene = &f.scene;

    let hits: usize = (0..64)
        .into_par_iter()
        .map_init(QueryScratch::new, |scratch, tile| {
            let rays: Vec<Ray> = (0..8)
                .map(|i| {
                    let x = (tile * 8 + i) as f32 / 512.0;
                    Ray::new(Vec3::new(x, 0.1, -1.0), Vec3::Z)
                })
                .collect();
            scene
                .intersect8(scratch, &rays)
                .unwrap()
                .iter()
                .filter(|hit| hit.is_some())
                .count()
        })
        .sum();

    // x in [0, 1) at y = 0.1 hits while x + y <= 1
    let expected = (0..512).filter(|i| *i as f32 / 512.0 + 0.1 <= 1.0).count();
    assert_eq!(hits, expected);
}
