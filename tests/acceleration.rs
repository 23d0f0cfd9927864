//! Acceleration structure and shader table integration tests.

mod common;

use glam::{Mat4, Vec3};
use rstest::rstest;

use common::{init_logging, TestBackend};
use raytracing_engine::acceleration::{build_scene, MeshInstance};
use raytracing_engine::backend::{
    AccelerationStructureInputs, Command, CommandList, ResourceBarrier, ResourceId, TextureFormat,
};
use raytracing_engine::resources::Mesh;
use raytracing_engine::shader_table::align_up;
use raytracing_engine::upload::{upload_mesh, Uploader};
use raytracing_engine::{CameraIntent, Scene, SceneObject};

#[rstest]
#[case::dummy(TestBackend::Dummy)]
#[case::vulkan(TestBackend::Vulkan)]
fn test_triangle_builds_one_bottom_and_one_top_level(#[case] backend: TestBackend) {
    init_logging();
    let Some(mut ctx) = backend.context() else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    let mut list = CommandList::new("triangle");
    let mut uploader = Uploader::new();
    let mesh = upload_mesh(&mut ctx, &mut list, &mut uploader, &Mesh::triangle()).unwrap();
    let structures = build_scene(
        &mut ctx,
        &mut list,
        &mut uploader,
        std::slice::from_ref(&mesh),
        &[MeshInstance::identity(0)],
    )
    .unwrap();

    assert_eq!(structures.bottom_level.len(), 1);
    assert_eq!(structures.bottom_level[0].primitive_count, 1);
    assert_eq!(structures.top_level.primitive_count, 1);
    assert_eq!(structures.instances.len(), 1);
    assert_eq!(
        structures.instances[0].blas_address,
        structures.bottom_level[0].address
    );

    let builds: Vec<_> = list
        .commands()
        .iter()
        .filter_map(|c| match c {
            Command::BuildAccelerationStructure(desc) => Some(desc.inputs.kind()),
            _ => None,
        })
        .collect();
    assert_eq!(builds.len(), 2);

    assert!(ctx.pending_retirements() > 0);
    ctx.submit_and_wait(&mut list).unwrap();
    assert_eq!(ctx.pending_retirements(), 0);

    if let Some(dummy) = ctx.backend().as_dummy() {
        assert!(dummy.is_built(structures.bottom_level[0].handle));
        assert!(dummy.is_built(structures.top_level.handle));
    }

    structures.release(&mut ctx);
    mesh.release(&mut ctx);
    ctx.drain().unwrap();
    assert_eq!(ctx.registry().live_buffers(), 0);
}

#[rstest]
#[case::dummy(TestBackend::Dummy)]
#[case::vulkan(TestBackend::Vulkan)]
fn test_every_bottom_level_ordered_before_top_level(#[case] backend: TestBackend) {
    init_logging();
    let Some(mut ctx) = backend.context() else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    let mut list = CommandList::new("three meshes");
    let mut uploader = Uploader::new();
    let meshes = [Mesh::triangle(), Mesh::quad(1.0), Mesh::cube()]
        .iter()
        .map(|mesh| upload_mesh(&mut ctx, &mut list, &mut uploader, mesh).unwrap())
        .collect::<Vec<_>>();
    let instances = (0..3).map(MeshInstance::identity).collect::<Vec<_>>();
    let structures = build_scene(&mut ctx, &mut list, &mut uploader, &meshes, &instances).unwrap();

    let commands = list.commands();
    let top_level_build = commands
        .iter()
        .position(|c| {
            matches!(c, Command::BuildAccelerationStructure(desc)
                if matches!(desc.inputs, AccelerationStructureInputs::TopLevel { .. }))
        })
        .unwrap();

    for blas in &structures.bottom_level {
        let build = commands
            .iter()
            .position(|c| matches!(c, Command::BuildAccelerationStructure(desc) if desc.destination == blas.handle))
            .unwrap();
        assert!(build < top_level_build);
        let ordered = commands[build + 1..top_level_build].iter().any(|c| match c {
            Command::Barriers(barriers) => barriers.iter().any(|b| {
                *b == ResourceBarrier::Uav {
                    resource: Some(ResourceId::AccelerationStructure(blas.handle)),
                }
            }),
            _ => false,
        });
        assert!(ordered, "no barrier between {:?} and the top-level build", blas.handle);
    }

    ctx.submit_and_wait(&mut list).unwrap();
    structures.release(&mut ctx);
    for mesh in meshes {
        mesh.release(&mut ctx);
    }
}

#[test]
fn test_instances_carry_object_transforms() {
    let mut scene = Scene::new();
    scene.add_object(SceneObject::new(Mesh::triangle()));
    scene.add_object(SceneObject::new(Mesh::cube()).with_position(Vec3::new(2.0, 0.0, -1.0)));

    let mut ctx = TestBackend::Dummy.context().unwrap();
    let mut list = CommandList::new("two objects");
    let mut uploader = Uploader::new();
    let meshes = scene
        .meshes()
        .map(|mesh| upload_mesh(&mut ctx, &mut list, &mut uploader, mesh).unwrap())
        .collect::<Vec<_>>();
    let structures = build_scene(&mut ctx, &mut list, &mut uploader, &meshes, &scene.instances()).unwrap();

    assert_eq!(structures.instances.len(), 2);
    assert_eq!(structures.instances[1].instance_id(), 1);
    assert_eq!(
        structures.instances[1].transform(),
        Mat4::from_translation(Vec3::new(2.0, 0.0, -1.0))
    );
    assert_eq!(structures.instances[1].blas_address, structures.bottom_level[1].address);
    ctx.submit_and_wait(&mut list).unwrap();
}

#[rstest]
#[case::dummy(TestBackend::Dummy)]
#[case::vulkan(TestBackend::Vulkan)]
fn test_shader_table_layout(#[case] backend: TestBackend) {
    init_logging();
    let Some(renderer) = backend.renderer(&Scene::triangle()) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    let layout = *renderer.shader_table().unwrap().layout();
    let capabilities = renderer.context().capabilities();
    assert!(layout.record_size >= capabilities.shader_identifier_size as u64);
    for offset in layout.record_offsets() {
        assert_eq!(offset % capabilities.shader_table_alignment as u64, 0);
    }
    assert_eq!(
        layout.record_offsets(),
        vec![0, layout.record_size, 2 * layout.record_size]
    );
    assert_eq!(layout.size, layout.hit_group_offset + layout.record_size);
    assert_eq!(layout.size, align_up(layout.record_size * 3, layout.alignment));
}

#[rstest]
#[case::dummy(TestBackend::Dummy)]
#[case::vulkan(TestBackend::Vulkan)]
fn test_triangle_frame_capture(#[case] backend: TestBackend) {
    init_logging();
    let Some(mut renderer) = backend.renderer(&Scene::triangle()) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    renderer.render_frame(&CameraIntent::default(), 0.016).unwrap();
    let frame = renderer.capture_frame().unwrap();
    let background = TextureFormat::Rgba8Unorm.encode(backend.config().background_color);
    let (width, height) = (frame.width, frame.height);
    assert_eq!((width, height), (common::WIDTH, common::HEIGHT));
    assert_eq!(frame.pixel(0, 0).unwrap(), background);

    match backend {
        // Nothing traces rays on the dummy device, so only the clear is visible
        TestBackend::Dummy => assert_eq!(frame.count_pixels_not(background), 0),
        TestBackend::Vulkan => {
            assert_ne!(frame.pixel(width / 2, height / 2).unwrap(), background);
            assert!(frame.count_pixels_not(background) > 0);
        }
    }

    // Capturing does not disturb the frame loop
    renderer.render_frame(&CameraIntent::default(), 0.016).unwrap();
    renderer.shutdown().unwrap();
}
