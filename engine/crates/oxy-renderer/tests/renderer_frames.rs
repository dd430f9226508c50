use std::sync::Arc;
use std::time::Duration;

use futures::executor::block_on;
use glam::Vec3;

use oxy_engine::config::EngineConfigFile;
use oxy_engine::engine::Engine;
use oxy_engine::phase::PhaseId;
use oxy_gfx::headless::HeadlessDevice;
use oxy_gfx::queue::QueueKey;
use oxy_render_graph::render_graph::MAX_SUBMIT_RETRIES;
use oxy_render_interface::clock::ManualClock;
use oxy_render_interface::epoch::Epoch;
use oxy_render_interface::phase_error::ErrorClass;
use oxy_render_interface::render_data::{RenderView, ViewDesc, Viewport};
use oxy_renderer::frame_graph::FrameGraphSettings;
use oxy_renderer::geometry_cache::GeometryData;
use oxy_renderer::render_world::RenderWorld;
use oxy_renderer::renderer::{RendererModule, RendererSettings, RendererStats};
use oxy_scene::components::geometry::{BoundingSphere, GeometryAsset};
use oxy_scene::components::material::MaterialAsset;
use oxy_scene::scene::Renderable;

const FRAME: Duration = Duration::from_millis(16);

fn settings() -> RendererSettings {
    RendererSettings {
        width: 64,
        height: 36,
        graph: FrameGraphSettings {
            shadows: true,
            shadow_map_size: 32,
        },
        loader_threads: 1,
        print_execution_plan: false,
    }
}

fn new_engine(clock: &ManualClock) -> (Arc<HeadlessDevice>, Engine) {
    let config = EngineConfigFile::from_toml_str("[renderer]\nupload_queue_key = \"copy\"\n").unwrap();
    let device = HeadlessDevice::new(&[QueueKey::new("graphics"), QueueKey::new("copy")]);
    let engine = Engine::new(&config, device.clone(), Arc::new(clock.clone())).unwrap();
    (device, engine)
}

/// 一个立方体和一个相机
fn populate(world: &mut RenderWorld) {
    let geometry = world
        .scene
        .add_geometry(GeometryAsset::single("cube", BoundingSphere::new(Vec3::ZERO, 1.0), 36));
    let material = world.scene.add_material(MaterialAsset::new("grey"));
    let node = world.scene.create_node("cube", None).unwrap();
    world
        .scene
        .set_renderable(
            node,
            Some(Renderable {
                geometry,
                materials: vec![material],
            }),
        )
        .unwrap();

    let indices: Vec<u32> = (0..36).collect();
    world.stage_geometry(geometry, GeometryData::from_vertices(&[[0.0f32; 3]; 24], &indices));

    let camera = ViewDesc::look_at("main", Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, 1.0, 64.0 / 36.0, 0.1, 100.0);
    world.views.push(RenderView::new(camera, Viewport::new(64.0, 36.0)));
}

fn renderer_stats(engine: &Engine) -> RendererStats {
    engine.context().resource::<RendererStats>().cloned().unwrap()
}

#[test]
fn test_draws_after_geometry_is_resident() -> anyhow::Result<()> {
    let clock = ManualClock::new();
    let (device, mut engine) = new_engine(&clock);
    engine.attach(RendererModule::new(settings()))?;
    populate(engine.context_mut().resource_mut::<RenderWorld>().unwrap());

    // 第一帧只提交上传，几何还没有驻留
    clock.advance(FRAME);
    let report = block_on(engine.run_frame())?;
    assert!(!report.is_failed());
    assert!(report.presented);
    let stats = renderer_stats(&engine);
    assert_eq!(stats.draws, 0);
    assert_eq!(stats.scene_prep.non_resident, 1);
    assert!(stats.upload.submitted >= 2);

    for _ in 0..2 {
        clock.advance(FRAME);
        let report = block_on(engine.run_frame())?;
        assert!(!report.is_failed());
    }

    let stats = renderer_stats(&engine);
    assert_eq!(stats.draws, 1);
    assert_eq!(stats.resident_geometries, 1);
    // 默认材质加上 grey
    assert_eq!(stats.materials, 2);
    // shadow、depth-pre、opaque、composite
    assert_eq!(stats.passes, 4);
    assert_eq!(stats.presented, 3);
    assert_eq!(stats.upload.failed, 0);
    assert_eq!(stats.upload.in_flight, 0);
    assert!(stats.transients_released >= 3 * 2);

    let graphics = device.headless_queue(&QueueKey::new("graphics")).unwrap();
    assert_eq!(graphics.present_count(), 3);
    assert!(engine.graphics().completed_epoch() >= Epoch::new(2));

    engine.shutdown();
    assert_eq!(engine.graphics().reclaimer.pending_count(), 0);
    Ok(())
}

#[test]
fn test_submit_failure_skips_present_and_recovers() -> anyhow::Result<()> {
    let clock = ManualClock::new();
    let (device, mut engine) = new_engine(&clock);
    engine.attach(RendererModule::new(settings()))?;
    populate(engine.context_mut().resource_mut::<RenderWorld>().unwrap());

    clock.advance(FRAME);
    block_on(engine.run_frame())?;

    let graphics = device.headless_queue(&QueueKey::new("graphics")).unwrap();
    // 重试次数用完之后才算失败
    graphics.fail_next_submits(MAX_SUBMIT_RETRIES + 1);
    clock.advance(FRAME);
    let report = block_on(engine.run_frame())?;
    let failure = report.failure.clone().expect("submit should fail");
    assert_eq!(failure.phase, PhaseId::CommandSubmit);
    assert_eq!(failure.module.as_deref(), Some("renderer"));
    assert_ne!(failure.error.class(), ErrorClass::FatalToEngine);
    assert!(!report.presented);
    assert!(report.ran(PhaseId::FrameEnd));
    assert_eq!(graphics.present_count(), 1);
    // 失败的帧同样释放临时资源：第一帧 depth、color，第二帧再加上 shadow map
    assert_eq!(renderer_stats(&engine).transients_released, 2 + 3);

    clock.advance(FRAME);
    let report = block_on(engine.run_frame())?;
    assert!(!report.is_failed());
    assert_eq!(graphics.present_count(), 2);
    assert_eq!(renderer_stats(&engine).draws, 1);
    assert!(!engine.is_shutdown_requested());
    Ok(())
}

#[test]
fn test_retriable_submit_failure_still_presents() -> anyhow::Result<()> {
    let clock = ManualClock::new();
    let (device, mut engine) = new_engine(&clock);
    engine.attach(RendererModule::new(settings()))?;
    populate(engine.context_mut().resource_mut::<RenderWorld>().unwrap());

    clock.advance(FRAME);
    block_on(engine.run_frame())?;

    let graphics = device.headless_queue(&QueueKey::new("graphics")).unwrap();
    let submits_before = graphics.submissions().len();
    graphics.fail_next_submits(1);
    clock.advance(FRAME);
    let report = block_on(engine.run_frame())?;
    assert!(!report.is_failed());
    assert!(report.presented);
    assert_eq!(graphics.present_count(), 2);
    assert_eq!(renderer_stats(&engine).frames_submitted, 2);
    // 失败的那次提交不进入历史
    assert!(graphics.submissions().len() > submits_before);
    Ok(())
}
