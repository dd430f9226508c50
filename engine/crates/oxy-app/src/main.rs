use std::sync::Arc;

use futures::executor::block_on;

use oxy_crate_tools::init_log::init_log;
use oxy_engine::config::EngineConfigFile;
use oxy_engine::engine::Engine;
use oxy_engine::events::{EngineEvent, EventKind};
use oxy_gfx::headless::HeadlessDevice;
use oxy_render_interface::clock::MonotonicClock;
use oxy_renderer::renderer::{RendererModule, RendererSettings};

mod spinning_cube;

use spinning_cube::SpinningCube;

/// 没有提供配置文件时使用
const DEFAULT_CONFIG: &str = r#"
[engine]
target_fps = 60
frame_count = 240

[renderer]
graphics_queue_key = "graphics"
upload_queue_key = "copy"

[platform]
headless = true
thread_pool_size = 2
"#;

fn panic_handler(info: &std::panic::PanicHookInfo) {
    log::error!("{}", info);
}

fn init_env() {
    std::panic::set_hook(Box::new(panic_handler));

    init_log();

    tracy_client::Client::start();
    tracy_client::set_thread_name!("RenderThread");
}

fn main() -> anyhow::Result<()> {
    init_env();

    let config = match std::env::args().nth(1) {
        Some(path) => EngineConfigFile::load(path)?,
        None => EngineConfigFile::from_toml_str(DEFAULT_CONFIG)?,
    };
    if !config.platform.headless {
        log::warn!("only the headless backend is available");
    }

    let strategy = config.renderer.queue_strategy()?;
    let device = HeadlessDevice::new(&strategy.unique_keys());
    let mut engine = Engine::new(&config, device, Arc::new(MonotonicClock::new()))?;

    engine.subscribe(Some(EventKind::FrameFailed), false, |event| {
        if let EngineEvent::FrameFailed { epoch, phase, .. } = event {
            log::warn!("frame {:?} dropped at {:?}", epoch, phase);
        }
    });

    engine.attach(RendererModule::new(RendererSettings {
        loader_threads: config.platform.thread_pool_size as usize,
        ..Default::default()
    }))?;
    engine.attach(SpinningCube::new(1.5))?;

    block_on(engine.run())?;
    log::info!("{} frames run", engine.frames_run());
    Ok(())
}
