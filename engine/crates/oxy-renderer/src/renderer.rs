use std::sync::Arc;

use futures::future::LocalBoxFuture;

use oxy_asset::asset_hub::{AssetHub, AssetHubUpdate};
use oxy_asset::upload::{UploadContext, UploadCoordinator, UploadPolicy, UploadStats};
use oxy_engine::frame_context::FrameContext;
use oxy_engine::module::EngineModule;
use oxy_engine::phase::{PhaseId, PhaseMask};
use oxy_gfx::commands::command::GfxCommand;
use oxy_gfx::commands::command_list::CommandList;
use oxy_gfx::commands::submit_info::GfxSubmitInfo;
use oxy_gfx::fence::FenceValue;
use oxy_gfx::queue::{QueueKey, QueueRole};
use oxy_gfx::resource_state::ResourceState;
use oxy_gfx::resources::{GfxTexture, TextureDesc, TextureFormat, TextureUsage};
use oxy_render_graph::render_graph::{
    CompiledGraph, GraphBuildContext, GraphRecordContext, RecordedGraph, RenderGraphBuilder, SubmittedBatch,
};
use oxy_render_interface::phase_error::{ErrorClass, PhaseError};
use oxy_render_interface::reclaimer::Reclaimable;
use oxy_render_interface::render_data::PreparedFrame;
use oxy_render_interface::state_tracker::ResourceUsage;
use oxy_scene::scene_prep::{ScenePrep, ScenePrepStats};

use crate::frame_graph::{FrameGraphSettings, build_frame_graph};
use crate::geometry_cache::GeometryCache;
use crate::material_table::{MaterialFlushContext, MaterialResolver, MaterialTable};
use crate::render_world::RenderWorld;

/// 后台加载线程的结果队列长度
const LOADER_INBOX_CAPACITY: usize = 64;

#[derive(Clone, Debug)]
pub struct RendererSettings {
    pub width: u32,
    pub height: u32,
    pub graph: FrameGraphSettings,
    pub loader_threads: usize,
    /// 第一帧打印渲染图的执行计划
    pub print_execution_plan: bool,
}

impl Default for RendererSettings {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            graph: FrameGraphSettings::default(),
            loader_threads: 2,
            print_execution_plan: true,
        }
    }
}

/// 渲染统计，每帧 FrameEnd 时写入 `FrameContext` 的资源
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RendererStats {
    pub frames_submitted: u64,
    pub presented: u64,
    pub draws: usize,
    pub passes: usize,
    pub barriers: usize,
    pub batches: usize,
    pub transients_released: u64,
    pub resident_geometries: usize,
    pub materials: usize,
    pub scene_prep: ScenePrepStats,
    pub upload: UploadStats,
    pub assets: AssetHubUpdate,
}

/// attach 之后才存在的 GPU 对象
struct RendererGpu {
    upload: UploadCoordinator,
    hub: AssetHub,
    geometry: GeometryCache,
    materials: MaterialTable,
    backbuffer: Arc<GfxTexture>,
}

/// 一帧内在阶段之间传递的数据
#[derive(Default)]
struct RendererFrame {
    scene_prep: ScenePrep,
    prepared: PreparedFrame,
    graph: Option<CompiledGraph<'static>>,
    recorded: Option<RecordedGraph>,
    /// backbuffer 转换到 PRESENT 的 list 及其资源用法，提交成功后才写入跟踪器
    present_list: Option<(CommandList, ResourceUsage)>,
    /// 本帧的上传，graph 的批次需要等待
    external_waits: Vec<(QueueKey, FenceValue)>,
    plan_printed: bool,
}

/// 渲染模块
///
/// 从 `RenderWorld` 资源读取场景和 view，经过 scene-prep、渲染图构建、录制和提交，
/// 最后把 backbuffer 转换到 PRESENT 并呈现。
pub struct RendererModule {
    settings: RendererSettings,
    gpu: Option<RendererGpu>,
    frame: RendererFrame,
    stats: RendererStats,
}

// new & init
impl RendererModule {
    pub fn new(settings: RendererSettings) -> Self {
        Self {
            settings,
            gpu: None,
            frame: RendererFrame::default(),
            stats: RendererStats::default(),
        }
    }
}

// getters
impl RendererModule {
    #[inline]
    pub fn settings(&self) -> &RendererSettings {
        &self.settings
    }

    #[inline]
    pub fn stats(&self) -> &RendererStats {
        &self.stats
    }
}

impl EngineModule for RendererModule {
    fn name(&self) -> &str {
        "renderer"
    }

    fn phases(&self) -> PhaseMask {
        PhaseMask::FRAME_START
            | PhaseMask::TRANSFORM_PROPAGATION
            | PhaseMask::SCENE_PREP
            | PhaseMask::FRAME_GRAPH
            | PhaseMask::COMMAND_RECORD
            | PhaseMask::COMMAND_SUBMIT
            | PhaseMask::PRESENT
            | PhaseMask::FRAME_END
    }

    fn on_attach(&mut self, ctx: &mut FrameContext) -> Result<(), PhaseError> {
        let graphics = &mut ctx.graphics;
        let device = graphics.device.clone();

        let mut policy = UploadPolicy::from_strategy(&graphics.strategy);
        if let Some(timeout) = graphics.fence_timeout {
            policy = policy.with_timeout(timeout);
        }
        let mut upload = UploadCoordinator::with_per_request_staging(device.clone(), policy)?;
        let hub = AssetHub::new(&*device, &mut upload, self.settings.loader_threads, LOADER_INBOX_CAPACITY)
            .map_err(|err| PhaseError::with_class(ErrorClass::FatalToEngine, format!("asset hub: {err}")))?;

        let backbuffer = graphics.check(device.create_texture(TextureDesc::new_2d(
            "backbuffer",
            self.settings.width,
            self.settings.height,
            TextureFormat::Rgba8Unorm,
            TextureUsage::RENDER_TARGET | TextureUsage::COPY_SRC,
        )))?;
        graphics.tracker.register_texture(backbuffer.handle(), backbuffer.desc(), ResourceState::PRESENT);

        log::info!(
            "renderer attached: {}x{}, upload queue {}",
            self.settings.width,
            self.settings.height,
            upload.queue_key()
        );
        self.gpu = Some(RendererGpu {
            upload,
            hub,
            geometry: GeometryCache::new(),
            materials: MaterialTable::new(),
            backbuffer,
        });

        if ctx.resource::<RenderWorld>().is_none() {
            ctx.insert_resource(RenderWorld::new("main"));
        }
        ctx.insert_resource(RendererStats::default());
        Ok(())
    }

    fn on_phase<'a>(&'a mut self, phase: PhaseId, ctx: &'a mut FrameContext) -> LocalBoxFuture<'a, Result<(), PhaseError>> {
        Box::pin(async move {
            let Self {
                settings,
                gpu,
                frame,
                stats,
            } = self;
            let Some(gpu) = gpu.as_mut() else {
                return Err(PhaseError::new("renderer is not attached"));
            };

            match phase {
                PhaseId::FrameStart => frame.begin(gpu, ctx, stats),
                PhaseId::TransformPropagation => {
                    if let Some(world) = ctx.resource_mut::<RenderWorld>() {
                        world.scene.propagate_transforms();
                    }
                    Ok(())
                }
                PhaseId::ScenePrep => frame.prepare_scene(gpu, ctx, stats),
                PhaseId::FrameGraph => frame.build_graph(gpu, ctx, settings),
                PhaseId::CommandRecord => frame.record(gpu, ctx),
                PhaseId::CommandSubmit => frame.submit(ctx, stats),
                PhaseId::Present => {
                    ctx.graphics.present()?;
                    stats.presented += 1;
                    Ok(())
                }
                PhaseId::FrameEnd => {
                    frame.end(gpu, ctx, stats);
                    Ok(())
                }
                _ => Ok(()),
            }
        })
    }

    fn on_shutdown(&mut self, ctx: &mut FrameContext) {
        let Some(gpu) = self.gpu.take() else {
            return;
        };
        let RendererGpu {
            upload,
            hub,
            mut geometry,
            mut materials,
            backbuffer,
        } = gpu;

        let epoch = ctx.epoch;
        let graphics = &mut ctx.graphics;
        if let Some(mut graph) = self.frame.graph.take() {
            graph.release_transients(&mut graphics.tracker, &mut graphics.bindless, &mut graphics.reclaimer, epoch);
        }
        self.frame.discard_lists();

        geometry.clear(&mut graphics.tracker, &mut graphics.bindless, &mut graphics.reclaimer, epoch);
        materials.release(&mut MaterialFlushContext {
            device: &*graphics.device,
            tracker: &mut graphics.tracker,
            descriptors: &mut graphics.descriptors,
            bindless: &mut graphics.bindless,
            reclaimer: &mut graphics.reclaimer,
            epoch,
        });

        graphics.tracker.unregister(backbuffer.handle());
        drop(graphics.bindless.unregister_resource(backbuffer.handle()));
        graphics.reclaimer.register_deferred_release(Reclaimable::Texture(backbuffer), epoch);

        log::info!("renderer detached, upload stats: {:?}", upload.stats());
        // 后台加载线程在 hub drop 时退出
        drop(hub);
        drop(upload);
    }
}

// phase call
impl RendererFrame {
    /// 接收新的几何与加载请求，推进上传和资产状态
    fn begin(&mut self, gpu: &mut RendererGpu, ctx: &mut FrameContext, stats: &mut RendererStats) -> Result<(), PhaseError> {
        let _span = tracy_client::span!("RendererModule::begin");
        let epoch = ctx.epoch;

        gpu.upload.retire();
        let Some((world, graphics)) = ctx.resource_and_graphics::<RenderWorld>() else {
            return Ok(());
        };

        for (handle, data) in world.take_pending_geometry() {
            if gpu.geometry.residency(handle).is_some() {
                gpu.geometry.remove(handle, &mut graphics.tracker, &mut graphics.bindless, &mut graphics.reclaimer, epoch);
                self.scene_prep.invalidate_geometry(handle);
            }
            let result = gpu.geometry.register(&*graphics.device, &mut gpu.upload, handle, data);
            graphics.check(result)?;
        }
        for load in world.take_pending_loads() {
            gpu.hub.load(load.label, load.kind, load.source);
        }

        stats.assets = gpu.hub.update(&*graphics.device, &mut gpu.upload);
        let promoted = gpu.geometry.poll(
            &*graphics.device,
            &mut gpu.upload,
            &mut graphics.descriptors,
            &mut graphics.bindless,
        )?;
        if promoted > 0 {
            log::debug!("{} geometries became resident at {}", promoted, epoch);
        }
        Ok(())
    }

    fn prepare_scene(
        &mut self,
        gpu: &mut RendererGpu,
        ctx: &mut FrameContext,
        stats: &mut RendererStats,
    ) -> Result<(), PhaseError> {
        let epoch = ctx.epoch;
        let Some((world, graphics)) = ctx.resource_and_graphics::<RenderWorld>() else {
            self.prepared = PreparedFrame::default();
            return Ok(());
        };

        let mut binder = MaterialResolver {
            table: &mut gpu.materials,
            hub: &gpu.hub,
            device: &*graphics.device,
            descriptors: &mut graphics.descriptors,
            bindless: &mut graphics.bindless,
        };
        self.prepared = self.scene_prep.prepare(&world.scene, &world.views, &mut gpu.geometry, &mut binder);

        let mut flush_ctx = MaterialFlushContext {
            device: &*graphics.device,
            tracker: &mut graphics.tracker,
            descriptors: &mut graphics.descriptors,
            bindless: &mut graphics.bindless,
            reclaimer: &mut graphics.reclaimer,
            epoch,
        };
        gpu.materials.flush(&mut flush_ctx, &mut gpu.upload)?;

        stats.scene_prep = self.scene_prep.stats();
        stats.draws = self.prepared.draw_count();
        Ok(())
    }

    /// 构建渲染图
    fn build_graph(
        &mut self,
        gpu: &mut RendererGpu,
        ctx: &mut FrameContext,
        settings: &RendererSettings,
    ) -> Result<(), PhaseError> {
        let _span = tracy_client::span!("RendererModule::build_graph");
        let epoch = ctx.epoch;
        let graphics = &mut ctx.graphics;

        let mut builder = RenderGraphBuilder::new();
        let backbuffer = builder.import_texture("backbuffer", &gpu.backbuffer, ResourceState::PRESENT);
        build_frame_graph(&mut builder, &self.prepared, backbuffer, &settings.graph);

        let mut build_ctx = GraphBuildContext {
            device: &*graphics.device,
            strategy: &graphics.strategy,
            tracker: &mut graphics.tracker,
            descriptors: &mut graphics.descriptors,
            bindless: &mut graphics.bindless,
            frame: &self.prepared,
        };
        let graph = builder.build(&mut build_ctx)?;
        if settings.print_execution_plan && !self.plan_printed {
            graph.print_execution_plan();
            self.plan_printed = true;
        }
        self.graph = Some(graph);
        Ok(())
    }

    /// 先提交本帧的上传，再录制渲染图以及把 backbuffer 转换到 PRESENT 的 list
    fn record(&mut self, gpu: &mut RendererGpu, ctx: &mut FrameContext) -> Result<(), PhaseError> {
        let _span = tracy_client::span!("RendererModule::record");
        let epoch = ctx.epoch;
        let Some(graph) = self.graph.as_ref() else {
            return Err(PhaseError::new("frame graph was not built"));
        };
        let graphics = &mut ctx.graphics;

        let mut upload_ctx = UploadContext {
            tracker: &mut graphics.tracker,
            reclaimer: &mut graphics.reclaimer,
            pool: graphics.pools.pool_mut(QueueRole::Transfer),
            epoch,
        };
        if let Some(batch) = gpu.upload.flush(&mut upload_ctx)? {
            log::debug!("{} uploads ({} bytes) on {} -> {}", batch.tickets.len(), batch.bytes, batch.queue_key, batch.fence);
            graphics.record_submission(&batch.queue_key, batch.fence);
            self.external_waits.push((batch.queue_key, batch.fence));
        }

        let mut record_ctx = GraphRecordContext {
            pools: &mut graphics.pools,
            tracker: &mut graphics.tracker,
            frame: &self.prepared,
            epoch,
        };
        let recorded = graph.record(&mut record_ctx)?;

        // 按图执行完之后的状态规划
        let present = ResourceUsage::whole(gpu.backbuffer.handle(), ResourceState::PRESENT);
        let barriers = match recorded.planned_states().plan(std::slice::from_ref(&present)) {
            Ok(barriers) => barriers,
            Err(err) => {
                recorded.discard();
                return Err(err.into());
            }
        };
        self.recorded = Some(recorded);
        if !barriers.is_empty() {
            let mut recorder = graphics.pools.pool_mut(QueueRole::Present).recorder("present-transition")?;
            recorder.record(GfxCommand::Barriers(barriers))?;
            self.present_list = Some((recorder.finish()?, present));
        }
        Ok(())
    }

    /// 提交渲染图和 present 转换
    ///
    /// 失败时已经提交的批次仍然记录到当前 epoch，没有提交的 list 在 FrameEnd 丢弃。
    fn submit(&mut self, ctx: &mut FrameContext, stats: &mut RendererStats) -> Result<(), PhaseError> {
        let _span = tracy_client::span!("RendererModule::submit");
        let (Some(graph), Some(recorded)) = (self.graph.as_ref(), self.recorded.take()) else {
            return Err(PhaseError::new("frame was not recorded"));
        };
        let graphics = &mut ctx.graphics;

        let mut record_ctx = GraphRecordContext {
            pools: &mut graphics.pools,
            tracker: &mut graphics.tracker,
            frame: &self.prepared,
            epoch: ctx.epoch,
        };
        let submitted = match graph.submit(recorded, &*graphics.device, &mut record_ctx, &self.external_waits) {
            Ok(submitted) => submitted,
            Err(err) => {
                for (key, fence) in SubmittedBatch::last_fences(&err.submitted) {
                    graphics.record_submission(&key, fence);
                }
                if err.error.is_fatal_to_engine() {
                    log::error!("device \"{}\" lost during graph submit", graphics.device.name());
                }
                return Err(err.error);
            }
        };
        let last_fences = SubmittedBatch::last_fences(&submitted);
        for (key, fence) in &last_fences {
            graphics.record_submission(key, *fence);
        }

        if let Some((list, present)) = self.present_list.take() {
            let key = graphics.strategy.key_for(QueueRole::Present).clone();
            let mut info = GfxSubmitInfo::new(vec![list]);
            for (other, fence) in &last_fences {
                if *other != key {
                    info = info.wait(other.clone(), *fence);
                }
            }
            let queue = graphics.queue(&key)?.clone();
            let fence = graphics.check(queue.submit(info))?;
            graphics.record_submission(&key, fence);
            graphics.tracker.commit(&[present])?;
        }

        stats.frames_submitted += 1;
        stats.batches = submitted.len();
        Ok(())
    }

    /// 释放临时资源，丢弃没有提交的 list，更新统计
    fn end(&mut self, gpu: &mut RendererGpu, ctx: &mut FrameContext, stats: &mut RendererStats) {
        let epoch = ctx.epoch;
        let graphics = &mut ctx.graphics;

        if let Some(mut graph) = self.graph.take() {
            stats.passes = graph.pass_count();
            stats.barriers = graph.total_barrier_count();
            let released =
                graph.release_transients(&mut graphics.tracker, &mut graphics.bindless, &mut graphics.reclaimer, epoch);
            stats.transients_released += released as u64;
        }
        self.discard_lists();
        self.external_waits.clear();

        stats.upload = gpu.upload.stats();
        stats.resident_geometries = gpu.geometry.resident_count();
        stats.materials = gpu.materials.len();
        if let Some(shared) = ctx.resource_mut::<RendererStats>() {
            *shared = stats.clone();
        }
    }
}

// tools
impl RendererFrame {
    fn discard_lists(&mut self) {
        if let Some(recorded) = self.recorded.take() {
            recorded.discard();
        }
        if let Some((list, _)) = self.present_list.take() {
            list.discard();
        }
    }
}
