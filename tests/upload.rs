//! Upload pipeline integration tests: staged copies read back byte for byte.

mod common;

use glam::Vec3;
use rstest::rstest;

use common::{generate_test_pattern, init_logging, TestBackend};
use raytracing_engine::backend::{BufferUsage, CommandList, ResourceState};
use raytracing_engine::resources::Mesh;
use raytracing_engine::upload::{read_back_buffer, upload_mesh, ConstantBuffer, Uploader};
use raytracing_engine::{RayTracingBackend, RendererError};

#[rstest]
#[case::dummy(TestBackend::Dummy)]
#[case::vulkan(TestBackend::Vulkan)]
fn test_mesh_round_trip(#[case] backend: TestBackend) {
    init_logging();
    let Some(mut ctx) = backend.context() else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    let source = Mesh::new(
        "triangle",
        vec![
            Vec3::new(0.0, 0.5, 0.0),
            Vec3::new(0.5, -0.5, 0.0),
            Vec3::new(-0.5, -0.5, 0.0),
        ],
        vec![0, 1, 2],
    );
    let mut list = CommandList::new("mesh upload");
    let mut uploader = Uploader::new();
    let mut mesh = upload_mesh(&mut ctx, &mut list, &mut uploader, &source).unwrap();
    ctx.submit_and_wait(&mut list).unwrap();

    assert_eq!(mesh.vertex_count, 3);
    assert_eq!(mesh.index_count, 3);
    assert_eq!(uploader.upload_count(), 2);
    assert_eq!(uploader.uploaded_bytes(), 36 + 12);

    let vertices = read_back_buffer(&mut ctx, &mut mesh.vertex_buffer).unwrap();
    let indices = read_back_buffer(&mut ctx, &mut mesh.index_buffer).unwrap();
    assert_eq!(vertices, source.vertex_bytes());
    assert_eq!(indices, source.index_bytes());

    // Readback restores the state the upload left the buffers in
    assert_eq!(mesh.vertex_buffer.state(), ResourceState::ShaderResource);
    mesh.release(&mut ctx);
}

#[rstest]
#[case::dummy(TestBackend::Dummy)]
#[case::vulkan(TestBackend::Vulkan)]
fn test_large_buffer_round_trip(#[case] backend: TestBackend) {
    init_logging();
    let Some(mut ctx) = backend.context() else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    let data = generate_test_pattern(1 << 16);
    let mut list = CommandList::new("pattern upload");
    let mut uploader = Uploader::new();
    let mut buffer = uploader
        .upload_buffer(
            &mut ctx,
            &mut list,
            &data,
            BufferUsage::STORAGE,
            ResourceState::GenericRead,
            "pattern",
        )
        .unwrap();
    assert_eq!(ctx.pending_retirements(), 1);
    ctx.submit_and_wait(&mut list).unwrap();
    assert_eq!(ctx.pending_retirements(), 0);

    assert_eq!(read_back_buffer(&mut ctx, &mut buffer).unwrap(), data);
    ctx.release_buffer(buffer);
    assert_eq!(ctx.registry().live_buffers(), 0);
}

#[rstest]
#[case::dummy(TestBackend::Dummy)]
#[case::vulkan(TestBackend::Vulkan)]
fn test_constant_buffer_overwrite(#[case] backend: TestBackend) {
    init_logging();
    let Some(mut ctx) = backend.context() else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    let constants = ConstantBuffer::new(&mut ctx, "constants", &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
    assert_eq!(constants.size(), 256);
    constants.write(&mut ctx, &[5.0f32, 6.0, 7.0, 8.0]).unwrap();

    let bytes = ctx.backend().read_buffer(constants.handle(), 0, 16).unwrap();
    let values: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    assert_eq!(values, vec![5.0, 6.0, 7.0, 8.0]);
    constants.release(&mut ctx);
}

#[test]
fn test_empty_upload_rejected() {
    let mut ctx = TestBackend::Dummy.context().unwrap();
    let mut list = CommandList::new("empty");
    let result = Uploader::new().upload_buffer(
        &mut ctx,
        &mut list,
        &[],
        BufferUsage::STORAGE,
        ResourceState::GenericRead,
        "empty",
    );
    assert!(matches!(result, Err(RendererError::InvalidScene(_))));
    assert!(list.is_empty());
}

#[test]
fn test_degenerate_mesh_rejected() {
    let mut ctx = TestBackend::Dummy.context().unwrap();
    let mut list = CommandList::new("degenerate");
    let mesh = Mesh::new("bad", vec![Vec3::ZERO; 3], vec![0, 1, 7]);
    assert!(upload_mesh(&mut ctx, &mut list, &mut Uploader::new(), &mesh).is_err());
}
