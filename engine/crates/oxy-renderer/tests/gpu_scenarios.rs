use std::sync::Arc;
use std::time::Duration;

use oxy_asset::upload::{UploadContext, UploadCoordinator, UploadPolicy, UploadRequest, UploadStatus};
use oxy_engine::config::EngineConfigFile;
use oxy_engine::engine::Engine;
use oxy_gfx::device::ViewKind;
use oxy_gfx::headless::HeadlessDevice;
use oxy_gfx::queue::{QueueKey, QueueRole};
use oxy_gfx::resource_state::ResourceState;
use oxy_gfx::resources::{BufferDesc, BufferUsage, MemoryLocation, TextureDesc, TextureFormat, TextureUsage};
use oxy_render_graph::render_graph::{GraphBuildContext, RenderGraphBuilder, RgPass, RgPassBuilder, RgResourceHandle};
use oxy_render_graph::render_context::RenderContext;
use oxy_render_interface::bindless_manager::{BindlessError, BindlessKey};
use oxy_render_interface::clock::ManualClock;
use oxy_render_interface::descriptor::{DescriptorDomain, DescriptorError};
use oxy_render_interface::epoch::Epoch;
use oxy_render_interface::phase_error::PhaseError;
use oxy_render_interface::render_data::PreparedFrame;

fn new_engine(config: &str, queues: &[&str]) -> Engine {
    let config = EngineConfigFile::from_toml_str(config).unwrap();
    let keys: Vec<QueueKey> = queues.iter().map(|q| QueueKey::new(*q)).collect();
    let device = HeadlessDevice::new(&keys);
    Engine::new(&config, device, Arc::new(ManualClock::new())).unwrap()
}

/// 只读取一个纹理的 pass
struct SampleTexture {
    texture: RgResourceHandle,
}

impl RgPass for SampleTexture {
    fn declare(&mut self, builder: &mut RgPassBuilder) {
        builder.read(self.texture, ResourceState::SHADER_RESOURCE);
    }

    fn execute(&self, _ctx: &mut RenderContext<'_, '_>) -> Result<(), PhaseError> {
        Ok(())
    }
}

#[test]
fn test_single_queue_upload_of_one_kib() -> anyhow::Result<()> {
    let mut engine = new_engine("[renderer]\nupload_queue_key = \"graphics\"\n", &["graphics"]);
    let graphics = &mut engine.context_mut().graphics;
    assert!(graphics.strategy.is_single_queue());

    let mut upload =
        UploadCoordinator::with_per_request_staging(graphics.device.clone(), UploadPolicy::from_strategy(&graphics.strategy))?;
    let buffer = graphics.device.create_buffer(BufferDesc::new(
        "target",
        1024,
        BufferUsage::STORAGE | BufferUsage::COPY_DST,
        MemoryLocation::DeviceLocal,
    ))?;
    let data: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
    let ticket = upload.submit(UploadRequest::buffer("one-kib", &buffer, 0, data.clone()));

    let mut ctx = UploadContext {
        tracker: &mut graphics.tracker,
        reclaimer: &mut graphics.reclaimer,
        pool: graphics.pools.pool_mut(QueueRole::Transfer),
        epoch: Epoch::new(1),
    };
    let batch = upload.flush(&mut ctx)?.expect("one batch");
    assert_eq!(batch.queue_key, QueueKey::new("graphics"));
    assert_eq!(batch.bytes, 1024);

    let stats = upload.stats();
    assert_eq!(stats.submitted, 1);
    assert_eq!(stats.bytes_submitted, 1024);

    upload.wait_blocking(batch.fence, Some(Duration::from_secs(1)))?;
    let stats = upload.stats();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.bytes_completed, 1024);
    assert_eq!(stats.in_flight, 0);
    assert!(matches!(upload.result(ticket), Some(UploadStatus::Complete { bytes: 1024, .. })));
    assert_eq!(buffer.read(0, 1024)?, data);
    assert_eq!(graphics.tracker.state_of(buffer.handle(), None), Some(ResourceState::SHADER_RESOURCE));
    Ok(())
}

#[test]
fn test_sampler_heap_exhaustion() {
    let mut engine = new_engine("[renderer]\nupload_queue_key = \"graphics\"\n", &["graphics"]);
    let graphics = &mut engine.context_mut().graphics;
    let capacity = DescriptorDomain::Samplers.capacity();
    assert_eq!(capacity, 256);

    let mut indices = Vec::new();
    for id in 0..capacity {
        let index = graphics
            .bindless
            .register(&*graphics.device, &mut graphics.descriptors, BindlessKey::Sampler(id), DescriptorDomain::Samplers)
            .unwrap();
        indices.push(index);
    }

    let err = graphics
        .bindless
        .register(
            &*graphics.device,
            &mut graphics.descriptors,
            BindlessKey::Sampler(capacity),
            DescriptorDomain::Samplers,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        BindlessError::Descriptor(DescriptorError::HeapExhausted {
            domain: DescriptorDomain::Samplers,
            ..
        })
    ));

    // 之前的 handle 依然有效
    for (id, index) in indices.iter().enumerate() {
        assert_eq!(graphics.bindless.lookup(&BindlessKey::Sampler(id as u32)), Some(*index));
    }
    assert_eq!(graphics.descriptors.stats(DescriptorDomain::Samplers).allocated, capacity);
}

#[test]
fn test_two_shader_reads_need_no_barrier() {
    let mut engine = new_engine("[renderer]\nupload_queue_key = \"graphics\"\n", &["graphics"]);
    let graphics = &mut engine.context_mut().graphics;
    let texture = graphics
        .device
        .create_texture(TextureDesc::new_2d(
            "albedo",
            16,
            16,
            TextureFormat::Rgba8Unorm,
            TextureUsage::SAMPLED,
        ))
        .unwrap();

    let mut builder = RenderGraphBuilder::new();
    let handle = builder.import_texture("albedo", &texture, ResourceState::SHADER_RESOURCE);
    builder.add_pass("first", SampleTexture { texture: handle });
    builder.add_pass("second", SampleTexture { texture: handle });

    let frame = PreparedFrame::default();
    let mut ctx = GraphBuildContext {
        device: &*graphics.device,
        strategy: &graphics.strategy,
        tracker: &mut graphics.tracker,
        descriptors: &mut graphics.descriptors,
        bindless: &mut graphics.bindless,
        frame: &frame,
    };
    let graph = builder.build(&mut ctx).unwrap();
    assert_eq!(graph.total_barrier_count(), 0);
    assert_eq!(graph.ordered_pass_names(), vec!["first", "second"]);
    assert!(graphics.bindless.lookup(&BindlessKey::View(texture.handle(), ViewKind::Srv)).is_none());
}
