//! Frame loop integration tests: state closure, barrier skipping, the fence
//! counter and the order of recorded commands.
//!
//! ```bash
//! cargo test --test frame_pipeline
//! RAYTRACING_SHADER_DIR=target/shaders cargo test --test frame_pipeline -- vulkan
//! ```

mod common;

use rstest::rstest;

use common::{init_logging, TestBackend};
use raytracing_engine::backend::{Command, ResourceBarrier, ResourceState};
use raytracing_engine::{
    Backend, CameraIntent, DummyBackend, RayTracingBackend, Renderer, Scene, ShadingMode,
};

fn position(commands: &[Command], pred: impl Fn(&Command) -> bool) -> usize {
    commands
        .iter()
        .position(pred)
        .expect("command missing from frame")
}

#[rstest]
#[case::dummy(TestBackend::Dummy)]
#[case::vulkan(TestBackend::Vulkan)]
fn test_output_state_closes_over_frames(#[case] backend: TestBackend) {
    init_logging();
    let Some(mut renderer) = backend.renderer(&Scene::triangle()) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    for _ in 0..4 {
        renderer.render_frame(&CameraIntent::default(), 0.016).unwrap();
        let output = renderer.ray_output().unwrap();
        assert_eq!(output.state(), ResourceState::UnorderedAccess);
        assert!(renderer
            .frames()
            .surface_states()
            .iter()
            .all(|s| *s == ResourceState::Present));
    }
    renderer.shutdown().unwrap();
}

#[rstest]
#[case::dummy(TestBackend::Dummy)]
#[case::vulkan(TestBackend::Vulkan)]
fn test_fence_advances_by_one_per_frame(#[case] backend: TestBackend) {
    init_logging();
    let Some(mut renderer) = backend.renderer(&Scene::triangle()) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    let mut previous = renderer.context().fence().last_signaled();
    for frame in 0..5 {
        let report = renderer.render_frame(&CameraIntent::default(), 0.016).unwrap();
        assert_eq!(report.frame_index, frame);
        assert_eq!(report.fence_value, previous + 1);
        assert_eq!(renderer.context().fence().last_signaled(), report.fence_value);
        assert!(renderer.context().backend().completed_value() >= report.fence_value);
        previous = report.fence_value;
    }
}

#[rstest]
#[case::dummy(TestBackend::Dummy)]
#[case::vulkan(TestBackend::Vulkan)]
fn test_second_frame_skips_output_transition(#[case] backend: TestBackend) {
    init_logging();
    let Some(mut renderer) = backend.renderer(&Scene::triangle()) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    let first = renderer.render_frame(&CameraIntent::default(), 0.016).unwrap();
    assert_eq!(first.skipped_transitions, 0);
    assert_eq!(
        renderer.ray_output().unwrap().state(),
        ResourceState::UnorderedAccess
    );

    let second = renderer.render_frame(&CameraIntent::default(), 0.016).unwrap();
    assert_eq!(second.skipped_transitions, 1);
    assert_eq!(second.transitions, first.transitions - 1);
    assert_eq!(renderer.frames().skipped_transitions(), 1);
}

#[rstest]
#[case::dummy(TestBackend::Dummy)]
#[case::vulkan(TestBackend::Vulkan)]
fn test_back_buffers_rotate(#[case] backend: TestBackend) {
    init_logging();
    let Some(mut renderer) = backend.renderer(&Scene::triangle()) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    let count = renderer.context().backend().back_buffers().len() as u32;
    let mut expected = renderer.frames().back_buffer_index();
    for _ in 0..4 {
        let report = renderer.render_frame(&CameraIntent::default(), 0.016).unwrap();
        assert_eq!(report.back_buffer_index, expected);
        expected = (expected + 1) % count;
        assert_eq!(report.next_back_buffer_index, expected);
    }
}

#[rstest]
#[case::dummy(TestBackend::Dummy)]
#[case::vulkan(TestBackend::Vulkan)]
fn test_dispatch_recorded_after_binds(#[case] backend: TestBackend) {
    init_logging();
    let Some(mut renderer) = backend.renderer(&Scene::triangle()) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    renderer.render_frame(&CameraIntent::default(), 0.016).unwrap();
    renderer.render_frame(&CameraIntent::default(), 0.016).unwrap();

    let commands = renderer.frames().list().commands();
    let heap = position(commands, |c| matches!(c, Command::SetDescriptorHeap(_)));
    let signature = position(commands, |c| matches!(c, Command::SetRootSignature(_)));
    let table = position(commands, |c| matches!(c, Command::SetDescriptorTable { .. }));
    let pipeline = position(commands, |c| matches!(c, Command::SetPipeline(_)));
    let clear = position(commands, |c| matches!(c, Command::ClearTexture { .. }));
    let dispatch = position(commands, |c| matches!(c, Command::DispatchRays(_)));
    let copy = position(commands, |c| matches!(c, Command::CopyTexture { .. }));

    assert!(heap < signature && signature < table && table < pipeline);
    assert!(pipeline < clear && clear < dispatch && dispatch < copy);
    assert_eq!(
        commands
            .iter()
            .filter(|c| matches!(c, Command::SetConstantBuffer { .. }))
            .count(),
        2
    );
    // The clear and the dispatch are ordered by a UAV barrier
    assert!(matches!(
        &commands[dispatch - 1],
        Command::Barriers(b) if matches!(b.as_slice(), [ResourceBarrier::Uav { .. }])
    ));
    // Frame end leaves the surface presentable
    match commands.last() {
        Some(Command::Barriers(barriers)) => assert!(barriers.iter().any(|b| matches!(
            b,
            ResourceBarrier::Transition {
                after: ResourceState::Present,
                ..
            }
        ))),
        other => panic!("frame ended with {:?}", other),
    }
}

#[test]
fn test_dummy_counts_frame_work() {
    init_logging();
    let backend = TestBackend::Dummy;
    let mut renderer = backend.renderer(&Scene::triangle()).unwrap();
    let before = renderer.context().backend().as_dummy().unwrap().stats().clone();

    for _ in 0..3 {
        renderer.render_frame(&CameraIntent::default(), 0.016).unwrap();
    }

    let stats = renderer.context().backend().as_dummy().unwrap().stats();
    assert_eq!(stats.dispatches - before.dispatches, 3);
    assert_eq!(stats.clears - before.clears, 3);
    assert_eq!(stats.presents - before.presents, 3);
    assert_eq!(stats.texture_copies - before.texture_copies, 3);
    assert_eq!(stats.submits - before.submits, 3);
}

#[test]
fn test_shading_mode_cycles_through_all() {
    init_logging();
    let mut renderer = TestBackend::Dummy.renderer(&Scene::triangle()).unwrap();
    assert_eq!(renderer.shading_mode(), ShadingMode::RandomTriangleColor);

    for expected in ShadingMode::ALL.iter().skip(1) {
        assert_eq!(renderer.cycle_shading_mode(), *expected);
        renderer.render_frame(&CameraIntent::default(), 0.016).unwrap();
    }
    assert_eq!(renderer.cycle_shading_mode(), ShadingMode::RandomTriangleColor);
}

#[test]
fn test_zero_sized_surface_is_an_error() {
    init_logging();
    let backend = TestBackend::Dummy;
    let shaders = backend.shaders().unwrap();
    let result = Renderer::new(
        Backend::Dummy(DummyBackend::new(0, 0)),
        &backend.config(),
        &Scene::triangle(),
        &shaders,
    );
    assert!(result.is_err());
}
