//! RenderGraph 构建器
//!
//! `RenderGraphBuilder` 收集资源和 Pass，`build` 依次执行构建阶段得到 `CompiledGraph`。

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use itertools::Itertools;

use oxy_gfx::device::{GfxDevice, ViewKind};
use oxy_gfx::queue::{QueueKey, QueueRole, QueueStrategy};
use oxy_gfx::resource_state::ResourceState;
use oxy_gfx::resources::{BufferDesc, GfxBuffer, GfxTexture, TextureDesc};
use oxy_render_interface::bindless_manager::{BindlessKey, BindlessManager};
use oxy_render_interface::descriptor::{DescriptorAllocator, DescriptorDomain, ShaderVisibleIndex};
use oxy_render_interface::epoch::Epoch;
use oxy_render_interface::phase_error::PhaseError;
use oxy_render_interface::reclaimer::{DeferredReclaimer, Reclaimable};
use oxy_render_interface::render_data::{PreparedFrame, ViewTargets};
use oxy_render_interface::state_tracker::{ResourceStateTracker, ResourceUsage};

use crate::render_graph::barrier::{AliasDecl, PassBarriers, insert_barriers};
use crate::render_graph::error::GraphError;
use crate::render_graph::graph::{DependencyAnalyzer, DependencyGraph, DependencyKind};
use crate::render_graph::pass::{RgPass, RgPassBuilder, RgPassId, RgPassNode};
use crate::render_graph::resource::{
    RgPhysical, RgResource, RgResourceDesc, RgResourceHandle, RgResourceRegistry, RgResourceSource,
};
use crate::view_constants::ViewConstants;

/// 渲染图的构建阶段，按执行顺序排列
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BuildPhase {
    DeclareResources,
    DeclarePasses,
    Validate,
    OrderPasses,
    BindViews,
    InsertBarriers,
    Finalize,
}

impl BuildPhase {
    pub const ALL: [BuildPhase; 7] = [
        BuildPhase::DeclareResources,
        BuildPhase::DeclarePasses,
        BuildPhase::Validate,
        BuildPhase::OrderPasses,
        BuildPhase::BindViews,
        BuildPhase::InsertBarriers,
        BuildPhase::Finalize,
    ];
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// 构建时需要的渲染线程状态
pub struct GraphBuildContext<'a> {
    pub device: &'a dyn GfxDevice,
    pub strategy: &'a QueueStrategy,
    pub tracker: &'a mut ResourceStateTracker,
    pub descriptors: &'a mut DescriptorAllocator,
    pub bindless: &'a mut BindlessManager,
    pub frame: &'a PreparedFrame,
}

/// 一个 view 的渲染目标
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ViewTargetsDesc {
    pub depth: Option<RgResourceHandle>,
    pub color: Option<RgResourceHandle>,
    pub composite: Option<RgResourceHandle>,
}

/// 同一个队列上连续执行的 pass，录制到一个 command list
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PassBatch {
    pub role: QueueRole,
    pub queue_key: QueueKey,
    /// pass 索引，按执行顺序
    pub passes: Vec<usize>,
    /// 依赖的其他队列上的批次，提交时转换成 fence 等待
    pub depends_on: Vec<usize>,
}

/// RenderGraph 构建器
///
/// # 使用流程
///
/// 1. 创建 builder: `RenderGraphBuilder::new()`
/// 2. 导入外部资源或创建临时资源: `builder.import_texture(...)` / `builder.create_texture(...)`
/// 3. 添加 Pass: `builder.add_pass("name", pass)`
/// 4. 构建: `builder.build(&mut ctx)`
///
/// # 生命周期
///
/// `'a` 是 Pass 可以借用的外部资源的生命周期。
pub struct RenderGraphBuilder<'a> {
    resources: RgResourceRegistry,
    passes: Vec<RgPassNode<'a>>,
    explicit: Vec<(RgPassId, RgPassId)>,
    aliasing: Vec<(Option<RgResourceHandle>, RgResourceHandle)>,
    view_bindings: IndexMap<u32, ViewTargetsDesc>,
}

impl Default for RenderGraphBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

// new & init
impl<'a> RenderGraphBuilder<'a> {
    pub fn new() -> Self {
        Self {
            resources: RgResourceRegistry::new(),
            passes: Vec::new(),
            explicit: Vec::new(),
            aliasing: Vec::new(),
            view_bindings: IndexMap::new(),
        }
    }
}

// register
impl<'a> RenderGraphBuilder<'a> {
    /// 导入外部纹理
    ///
    /// 纹理没有被状态跟踪器记录时，以 `initial_state` 登记。
    pub fn import_texture(
        &mut self,
        name: impl Into<String>,
        texture: &Arc<GfxTexture>,
        initial_state: ResourceState,
    ) -> RgResourceHandle {
        self.resources.register(RgResource::imported_texture(name, texture, initial_state))
    }

    pub fn import_buffer(
        &mut self,
        name: impl Into<String>,
        buffer: &Arc<GfxBuffer>,
        initial_state: ResourceState,
    ) -> RgResourceHandle {
        self.resources.register(RgResource::imported_buffer(name, buffer, initial_state))
    }

    /// 创建临时纹理，在 DeclareResources 阶段分配
    pub fn create_texture(&mut self, desc: TextureDesc) -> RgResourceHandle {
        let name = desc.name.clone();
        self.resources.register(RgResource::transient(name, RgResourceDesc::Texture(desc)))
    }

    pub fn create_buffer(&mut self, desc: BufferDesc) -> RgResourceHandle {
        let name = desc.name.clone();
        self.resources.register(RgResource::transient(name, RgResourceDesc::Buffer(desc)))
    }

    /// 添加 Pass，资源依赖在 DeclarePasses 阶段收集
    pub fn add_pass<P: RgPass + 'a>(&mut self, name: impl Into<String>, pass: P) -> RgPassId {
        let id = RgPassId(self.passes.len());
        self.passes.push(RgPassNode {
            name: name.into(),
            reads: Vec::new(),
            writes: Vec::new(),
            queue: QueueRole::Graphics,
            declared: false,
            pass: Box::new(pass),
        });
        id
    }

    /// `after` 必须在 `before` 之后执行
    pub fn add_dependency(&mut self, before: RgPassId, after: RgPassId) {
        self.explicit.push((before, after));
    }

    /// `after` 与 `before` 共享内存，第一次使用 `after` 之前插入 aliasing barrier
    pub fn declare_aliasing(&mut self, before: Option<RgResourceHandle>, after: RgResourceHandle) {
        self.aliasing.push((before, after));
    }

    /// 为 view 指定渲染目标，BindViews 阶段生成它们的 bindless 下标
    pub fn bind_view(&mut self, view: u32, targets: ViewTargetsDesc) {
        self.view_bindings.insert(view, targets);
    }

    #[inline]
    pub fn resources(&self) -> &RgResourceRegistry {
        &self.resources
    }
}

// build
impl<'a> RenderGraphBuilder<'a> {
    /// 依次执行构建阶段
    ///
    /// 某个阶段失败时跳过剩下的阶段，已经创建的临时资源随之释放。
    pub fn build(self, ctx: &mut GraphBuildContext<'_>) -> Result<CompiledGraph<'a>, PhaseError> {
        let _span = tracy_client::span!("RenderGraphBuilder::build");

        let mut graph = CompiledGraph {
            resources: self.resources,
            passes: self.passes,
            explicit: self.explicit,
            aliasing: self.aliasing,
            view_bindings: self.view_bindings,
            completed_phases: Vec::with_capacity(BuildPhase::ALL.len()),
            usages: Vec::new(),
            dep_graph: DependencyGraph::new(0),
            execution_order: Vec::new(),
            view_constants: Vec::new(),
            alias_decls: Vec::new(),
            barriers: Vec::new(),
            batches: Vec::new(),
        };

        for phase in BuildPhase::ALL {
            let _span = tracy_client::span!("RenderGraph build phase");
            if let Err(err) = graph.run_phase(phase, ctx) {
                log::debug!("render graph phase {} failed: {}", phase, err);
                graph.abort(ctx.tracker);
                return Err(err.into());
            }
            graph.completed_phases.push(phase);
        }
        Ok(graph)
    }
}

/// 构建后的渲染图
///
/// 包含执行顺序、预计算的 barriers 和按队列划分的批次。
pub struct CompiledGraph<'a> {
    pub(crate) resources: RgResourceRegistry,
    pub(crate) passes: Vec<RgPassNode<'a>>,
    explicit: Vec<(RgPassId, RgPassId)>,
    aliasing: Vec<(Option<RgResourceHandle>, RgResourceHandle)>,
    view_bindings: IndexMap<u32, ViewTargetsDesc>,

    completed_phases: Vec<BuildPhase>,
    /// 每个 pass 合并后的资源使用（物理句柄），按 pass 索引
    pub(crate) usages: Vec<Vec<ResourceUsage>>,
    dep_graph: DependencyGraph,
    execution_order: Vec<usize>,
    pub(crate) view_constants: Vec<ViewConstants>,
    alias_decls: Vec<AliasDecl>,
    /// 按 pass 索引
    pub(crate) barriers: Vec<PassBarriers>,
    pub(crate) batches: Vec<PassBatch>,
}

// build phases
impl CompiledGraph<'_> {
    fn run_phase(&mut self, phase: BuildPhase, ctx: &mut GraphBuildContext<'_>) -> Result<(), GraphError> {
        match phase {
            BuildPhase::DeclareResources => self.declare_resources(ctx),
            BuildPhase::DeclarePasses => {
                self.declare_passes();
                Ok(())
            }
            BuildPhase::Validate => self.validate(),
            BuildPhase::OrderPasses => self.order_passes(),
            BuildPhase::BindViews => self.bind_views(ctx),
            BuildPhase::InsertBarriers => self.insert_barriers(ctx.tracker),
            BuildPhase::Finalize => {
                self.finalize(ctx.strategy);
                Ok(())
            }
        }
    }

    /// 分配临时资源，把所有资源登记到状态跟踪器
    fn declare_resources(&mut self, ctx: &mut GraphBuildContext<'_>) -> Result<(), GraphError> {
        for (_, resource) in self.resources.iter_mut() {
            match resource.source.clone() {
                RgResourceSource::Imported { initial_state } => {
                    let Some(physical) = resource.physical() else {
                        return Err(GraphError::NotRealized(resource.name.clone()));
                    };
                    register_untracked(ctx.tracker, physical, initial_state);
                }
                RgResourceSource::Transient(desc) => {
                    let physical = match desc {
                        RgResourceDesc::Buffer(desc) => RgPhysical::Buffer(ctx.device.create_buffer(desc)?),
                        RgResourceDesc::Texture(desc) => RgPhysical::Texture(ctx.device.create_texture(desc)?),
                    };
                    // 临时资源的内容未定义
                    register_untracked(ctx.tracker, &physical, ResourceState::COMMON);
                    resource.realize(physical);
                }
            }
        }
        Ok(())
    }

    fn declare_passes(&mut self) {
        for node in &mut self.passes {
            let mut builder = RgPassBuilder::new();
            node.pass.declare(&mut builder);
            node.reads = builder.reads;
            node.writes = builder.writes;
            node.queue = builder.queue;
            node.declared = true;
        }
    }

    fn validate(&mut self) -> Result<(), GraphError> {
        debug_assert!(self.passes.iter().all(|p| p.declared));

        let mut names = HashSet::new();
        for node in &self.passes {
            if !names.insert(node.name.as_str()) {
                return Err(GraphError::DuplicatePassName(node.name.clone()));
            }
        }

        for &(before, after) in &self.explicit {
            for id in [before, after] {
                if id.0 >= self.passes.len() {
                    return Err(GraphError::UnknownPass(id.0));
                }
            }
        }

        for (index, node) in self.passes.iter().enumerate() {
            for access in node.accesses() {
                if !self.resources.contains(access.resource) {
                    return Err(GraphError::UnknownResource {
                        pass: node.name.clone(),
                        resource: format!("{:?}", access.resource),
                    });
                }
                if !access.state.is_valid_combination() {
                    return Err(GraphError::InvalidState {
                        pass: node.name.clone(),
                        state: format!("{:?}", access.state),
                    });
                }
            }

            // 临时资源必须先被本 pass 或更早注册的 pass 写入
            for read in &node.reads {
                let transient = self.resources.get(read.resource).is_some_and(RgResource::is_transient);
                let written = self.passes[..=index]
                    .iter()
                    .any(|p| p.writes.iter().any(|w| w.resource == read.resource));
                if transient && !written {
                    return Err(GraphError::UninitializedRead {
                        pass: node.name.clone(),
                        resource: self.resources.name_of(read.resource).to_string(),
                    });
                }
            }
        }

        self.usages = self.passes.iter().map(|node| self.merge_usages(node)).collect::<Result<_, _>>()?;
        Ok(())
    }

    fn order_passes(&mut self) -> Result<(), GraphError> {
        let reads = self.passes.iter().map(|p| p.reads.iter().map(|a| a.resource).collect_vec()).collect_vec();
        let writes = self.passes.iter().map(|p| p.writes.iter().map(|a| a.resource).collect_vec()).collect_vec();

        let mut dep_graph = DependencyAnalyzer::analyze(&reads, &writes);
        for &(before, after) in &self.explicit {
            dep_graph.add_edge(before.0, after.0, DependencyKind::Explicit);
        }

        self.execution_order = dep_graph.topological_sort().map_err(|cycle| {
            GraphError::Cycle(cycle.iter().map(|&i| self.passes[i].name.clone()).collect())
        })?;
        self.dep_graph = dep_graph;
        Ok(())
    }

    /// 为每个 view 生成目标的 bindless 下标和 constant block
    fn bind_views(&mut self, ctx: &mut GraphBuildContext<'_>) -> Result<(), GraphError> {
        let frame = ctx.frame;
        let count = frame.packets.len();
        if let Some(&view) = self.view_bindings.keys().find(|&&v| v as usize >= count) {
            return Err(GraphError::ViewOutOfRange { view, count });
        }

        let mut constants = Vec::with_capacity(count);
        for (index, packet) in frame.packets.iter().enumerate() {
            let view = index as u32;
            let mut targets = ViewTargets::default();
            if let Some(desc) = self.view_bindings.get(&view).copied() {
                targets.depth = self.bind_target(ctx, desc.depth)?;
                targets.color = self.bind_target(ctx, desc.color)?;
                targets.composite = self.bind_target(ctx, desc.composite)?;
            }
            constants.push(ViewConstants::new(view, packet, targets));
        }
        self.view_constants = constants;
        Ok(())
    }

    fn insert_barriers(&mut self, tracker: &ResourceStateTracker) -> Result<(), GraphError> {
        self.alias_decls = self
            .aliasing
            .iter()
            .map(|&(before, after)| {
                let after = self
                    .resources
                    .physical_handle(after)
                    .ok_or_else(|| GraphError::NotRealized(self.resources.name_of(after).to_string()))?;
                let before = before.and_then(|b| self.resources.physical_handle(b));
                Ok(AliasDecl { before, after })
            })
            .collect::<Result<_, GraphError>>()?;

        insert_barriers(tracker, &self.execution_order, &self.usages, &self.alias_decls, &mut self.barriers)?;
        Ok(())
    }

    /// 把执行顺序切分成按队列的批次，并找出跨队列的依赖
    fn finalize(&mut self, strategy: &QueueStrategy) {
        let mut batches: Vec<PassBatch> = Vec::new();
        let mut batch_of = vec![0; self.passes.len()];

        for &pass in &self.execution_order {
            let role = self.passes[pass].queue;
            let key = strategy.key_for(role);
            match batches.last_mut() {
                Some(batch) if batch.queue_key == *key => batch.passes.push(pass),
                _ => batches.push(PassBatch {
                    role,
                    queue_key: key.clone(),
                    passes: vec![pass],
                    depends_on: Vec::new(),
                }),
            }
            batch_of[pass] = batches.len() - 1;
        }

        for index in 0..batches.len() {
            let mut depends_on = Vec::new();
            for &pass in &batches[index].passes {
                for pred in self.dep_graph.predecessors(pass) {
                    let other = batch_of[pred];
                    if batches[other].queue_key != batches[index].queue_key && !depends_on.contains(&other) {
                        depends_on.push(other);
                    }
                }
            }
            depends_on.sort_unstable();
            batches[index].depends_on = depends_on;
        }

        log::trace!(
            "render graph finalized: {} passes in {} batches",
            self.execution_order.len(),
            batches.len()
        );
        self.batches = batches;
    }
}

// tools
impl CompiledGraph<'_> {
    /// 合并一个 pass 对同一资源的多次声明，写入的状态优先
    fn merge_usages(&self, node: &RgPassNode<'_>) -> Result<Vec<ResourceUsage>, GraphError> {
        let mut merged: IndexMap<(RgResourceHandle, Option<oxy_gfx::resources::Subresource>), ResourceState> =
            IndexMap::new();
        for access in &node.reads {
            merged.entry((access.resource, access.subresource)).or_insert(access.state);
        }
        for access in &node.writes {
            merged.insert((access.resource, access.subresource), access.state);
        }

        merged
            .into_iter()
            .map(|((resource, subresource), state)| {
                let handle = self
                    .resources
                    .physical_handle(resource)
                    .ok_or_else(|| GraphError::NotRealized(self.resources.name_of(resource).to_string()))?;
                Ok(ResourceUsage {
                    resource: handle,
                    subresource,
                    state,
                })
            })
            .collect()
    }

    fn bind_target(
        &self,
        ctx: &mut GraphBuildContext<'_>,
        target: Option<RgResourceHandle>,
    ) -> Result<ShaderVisibleIndex, GraphError> {
        let Some(target) = target else {
            return Ok(ShaderVisibleIndex::INVALID);
        };
        let handle = self.resources.physical_handle(target).ok_or_else(|| GraphError::UnknownResource {
            pass: "<view binding>".to_string(),
            resource: format!("{:?}", target),
        })?;
        let index = ctx.bindless.register(
            ctx.device,
            ctx.descriptors,
            BindlessKey::View(handle, ViewKind::Srv),
            DescriptorDomain::Textures,
        )?;
        Ok(index)
    }

    /// 构建失败时撤销临时资源在跟踪器中的登记
    fn abort(&mut self, tracker: &mut ResourceStateTracker) {
        for (_, resource) in self.resources.iter_mut() {
            if resource.is_transient()
                && let Some(physical) = resource.take_physical()
            {
                tracker.unregister(physical.handle());
            }
        }
    }
}

fn register_untracked(tracker: &mut ResourceStateTracker, physical: &RgPhysical, state: ResourceState) {
    if tracker.is_tracked(physical.handle()) {
        return;
    }
    match physical {
        RgPhysical::Buffer(buffer) => tracker.register_buffer(buffer.handle(), state),
        RgPhysical::Texture(texture) => tracker.register_texture(texture.handle(), texture.desc(), state),
    }
}

// getters
impl CompiledGraph<'_> {
    #[inline]
    pub fn execution_order(&self) -> &[usize] {
        &self.execution_order
    }

    #[inline]
    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    #[inline]
    pub fn pass_name(&self, index: usize) -> &str {
        &self.passes[index].name
    }

    /// 按执行顺序排列的 pass 名字
    pub fn ordered_pass_names(&self) -> Vec<&str> {
        self.execution_order.iter().map(|&i| self.passes[i].name.as_str()).collect()
    }

    #[inline]
    pub fn pass_barriers(&self, index: usize) -> &PassBarriers {
        &self.barriers[index]
    }

    pub fn total_barrier_count(&self) -> usize {
        self.barriers.iter().map(PassBarriers::len).sum()
    }

    #[inline]
    pub fn completed_phases(&self) -> &[BuildPhase] {
        &self.completed_phases
    }

    #[inline]
    pub fn batches(&self) -> &[PassBatch] {
        &self.batches
    }

    #[inline]
    pub fn dependency_graph(&self) -> &DependencyGraph {
        &self.dep_graph
    }

    #[inline]
    pub fn view_constants(&self, view: u32) -> Option<&ViewConstants> {
        self.view_constants.get(view as usize)
    }

    #[inline]
    pub fn resources(&self) -> &RgResourceRegistry {
        &self.resources
    }

    pub fn physical(&self, handle: RgResourceHandle) -> Option<&RgPhysical> {
        self.resources.get(handle)?.physical()
    }
}

// update
impl CompiledGraph<'_> {
    /// 在当前跟踪器状态上重新执行 barrier 插入，返回 barrier 总数
    pub fn reinsert_barriers(&mut self, tracker: &ResourceStateTracker) -> Result<usize, PhaseError> {
        let total = insert_barriers(tracker, &self.execution_order, &self.usages, &self.alias_decls, &mut self.barriers)?;
        Ok(total)
    }

    /// 帧提交之后释放临时资源
    ///
    /// 资源从跟踪器和 bindless 表中移除，登记到 `epoch` 上延迟回收。返回释放的数量。
    pub fn release_transients(
        &mut self,
        tracker: &mut ResourceStateTracker,
        bindless: &mut BindlessManager,
        reclaimer: &mut DeferredReclaimer,
        epoch: Epoch,
    ) -> usize {
        let mut released = 0;
        for (_, resource) in self.resources.iter_mut() {
            if !resource.is_transient() {
                continue;
            }
            let Some(physical) = resource.take_physical() else {
                continue;
            };
            let handle = physical.handle();
            tracker.unregister(handle);
            // descriptor handle drop 之后进入延迟回收
            drop(bindless.unregister_resource(handle));
            let item = match physical {
                RgPhysical::Buffer(buffer) => Reclaimable::Buffer(buffer),
                RgPhysical::Texture(texture) => Reclaimable::Texture(texture),
            };
            reclaimer.register_deferred_release(item, epoch);
            released += 1;
        }
        released
    }
}

// 调试方法
impl CompiledGraph<'_> {
    /// 打印执行计划（用于调试）
    ///
    /// 输出每个 Pass 的执行顺序、队列、资源读写和 barrier。
    pub fn print_execution_plan(&self) {
        log::info!("╔══════════════════════════════════════════════════════════════════╗");
        log::info!("║              RenderGraph Execution Plan                          ║");
        log::info!("╠══════════════════════════════════════════════════════════════════╣");
        log::info!(
            "║ Total Passes: {}  |  Execution Order: [{}]",
            self.passes.len(),
            self.ordered_pass_names().join(" → ")
        );
        log::info!("║ Batches: {}", self.batches.iter().map(|b| format!("{}({})", b.queue_key, b.passes.len())).join(", "));
        log::info!("╚══════════════════════════════════════════════════════════════════╝");

        for (order, &pass_idx) in self.execution_order.iter().enumerate() {
            let pass = &self.passes[pass_idx];
            let barriers = &self.barriers[pass_idx];

            log::info!("┌─────────────────────────────────────────────────────────────────┐");
            log::info!("│ [{}/{}] Pass: \"{}\" on {}", order + 1, self.execution_order.len(), pass.name, pass.queue);
            log::info!("├─────────────────────────────────────────────────────────────────┤");

            if !pass.reads.is_empty() {
                log::info!("│ Reads:");
                for access in &pass.reads {
                    log::info!("│   \"{}\" @ {:?}", self.resources.name_of(access.resource), access.state);
                }
            }
            if !pass.writes.is_empty() {
                log::info!("│ Writes:");
                for access in &pass.writes {
                    log::info!("│   \"{}\" @ {:?}", self.resources.name_of(access.resource), access.state);
                }
            }

            if barriers.has_barriers() {
                log::info!(
                    "│ Barriers: {} transition, {} uav, {} aliasing",
                    barriers.transition_count(),
                    barriers.uav_count(),
                    barriers.aliasing_count()
                );
                for barrier in &barriers.barriers {
                    log::info!("│   {}", barrier.describe());
                }
            } else {
                log::info!("│ No barriers required");
            }
            log::info!("└─────────────────────────────────────────────────────────────────┘");
        }
        log::info!("═══════════════════════ End of Execution Plan ═══════════════════════");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_passes::{CorePass, NullPass};
    use crate::render_context::RenderContext;
    use crate::render_graph::{GraphRecordContext, GraphSubmitError, MAX_SUBMIT_RETRIES, RecordedGraph, SubmittedBatch};
    use glam::Vec3;
    use oxy_gfx::commands::command::GfxCommand;
    use oxy_gfx::commands::pool::CommandListPools;
    use oxy_gfx::fence::FenceValue;
    use oxy_gfx::headless::HeadlessDevice;
    use oxy_gfx::resources::{BufferUsage, MemoryLocation, TextureFormat, TextureUsage};
    use oxy_render_interface::phase_error::ErrorClass;
    use oxy_render_interface::render_data::{FrameViewPacket, PassBuckets, ViewDesc, Viewport};

    struct Fixture {
        device: Arc<HeadlessDevice>,
        strategy: QueueStrategy,
        tracker: ResourceStateTracker,
        descriptors: DescriptorAllocator,
        bindless: BindlessManager,
        pools: CommandListPools,
        frame: PreparedFrame,
    }

    impl Fixture {
        fn new(strategy: QueueStrategy) -> Self {
            let camera = ViewDesc::look_at("main", Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, 1.0, 1.0, 0.1, 100.0);
            let packet = FrameViewPacket {
                view: camera,
                viewport: Viewport::new(64.0, 64.0),
                opacity: 1.0,
                composite_target: None,
                draw_range: 0..4,
                buckets: PassBuckets {
                    opaque: vec![0, 1],
                    masked: vec![2],
                    transparent: vec![3],
                    shadow: vec![0, 2],
                },
            };
            Self {
                device: HeadlessDevice::from_strategy(&strategy),
                strategy,
                tracker: ResourceStateTracker::new(),
                descriptors: DescriptorAllocator::new(),
                bindless: BindlessManager::new(),
                pools: CommandListPools::new(),
                frame: PreparedFrame {
                    packets: vec![packet],
                    ..Default::default()
                },
            }
        }

        fn build<'a>(&mut self, builder: RenderGraphBuilder<'a>) -> Result<CompiledGraph<'a>, PhaseError> {
            let mut ctx = GraphBuildContext {
                device: &*self.device,
                strategy: &self.strategy,
                tracker: &mut self.tracker,
                descriptors: &mut self.descriptors,
                bindless: &mut self.bindless,
                frame: &self.frame,
            };
            builder.build(&mut ctx)
        }

        fn record(&mut self, graph: &CompiledGraph<'_>) -> Result<RecordedGraph, PhaseError> {
            let mut ctx = GraphRecordContext {
                pools: &mut self.pools,
                tracker: &mut self.tracker,
                frame: &self.frame,
                epoch: Epoch::new(1),
            };
            graph.record(&mut ctx)
        }

        fn submit(
            &mut self,
            graph: &CompiledGraph<'_>,
            recorded: RecordedGraph,
            external_waits: &[(QueueKey, FenceValue)],
        ) -> Result<Vec<SubmittedBatch>, GraphSubmitError> {
            let mut ctx = GraphRecordContext {
                pools: &mut self.pools,
                tracker: &mut self.tracker,
                frame: &self.frame,
                epoch: Epoch::new(1),
            };
            graph.submit(recorded, &*self.device, &mut ctx, external_waits)
        }

        fn texture(&self, name: &str, format: TextureFormat) -> Arc<GfxTexture> {
            let usage = TextureUsage::SAMPLED | TextureUsage::RENDER_TARGET | TextureUsage::DEPTH_STENCIL;
            self.device.create_texture(TextureDesc::new_2d(name, 64, 64, format, usage)).unwrap()
        }
    }

    /// 测试用 pass：按声明读写，可以让 execute 失败
    struct TestPass {
        reads: Vec<(RgResourceHandle, ResourceState)>,
        writes: Vec<(RgResourceHandle, ResourceState)>,
        queue: QueueRole,
        fail: bool,
    }

    impl TestPass {
        fn new() -> Self {
            Self {
                reads: Vec::new(),
                writes: Vec::new(),
                queue: QueueRole::Graphics,
                fail: false,
            }
        }

        fn read(mut self, handle: RgResourceHandle, state: ResourceState) -> Self {
            self.reads.push((handle, state));
            self
        }

        fn write(mut self, handle: RgResourceHandle, state: ResourceState) -> Self {
            self.writes.push((handle, state));
            self
        }

        fn on(mut self, queue: QueueRole) -> Self {
            self.queue = queue;
            self
        }

        fn failing(mut self) -> Self {
            self.fail = true;
            self
        }
    }

    impl RgPass for TestPass {
        fn declare(&mut self, builder: &mut RgPassBuilder) {
            for &(handle, state) in &self.reads {
                builder.read(handle, state);
            }
            for &(handle, state) in &self.writes {
                builder.write(handle, state);
            }
            builder.queue(self.queue);
        }

        fn execute(&self, ctx: &mut RenderContext<'_, '_>) -> Result<(), PhaseError> {
            if self.fail {
                return Err(PhaseError::new("boom"));
            }
            ctx.record(GfxCommand::Dispatch { x: 1, y: 1, z: 1 })
        }
    }

    #[test]
    fn test_core_passes_end_to_end() {
        let mut fx = Fixture::new(QueueStrategy::single_queue("main"));
        let backbuffer = fx.texture("backbuffer", TextureFormat::Rgba8Unorm);

        let mut builder = RenderGraphBuilder::new();
        let target = builder.import_texture("backbuffer", &backbuffer, ResourceState::PRESENT);
        let depth = builder.create_texture(TextureDesc::new_2d(
            "depth",
            64,
            64,
            TextureFormat::Depth32Float,
            TextureUsage::DEPTH_STENCIL | TextureUsage::SAMPLED,
        ));
        let color = builder.create_texture(TextureDesc::new_2d(
            "color",
            64,
            64,
            TextureFormat::Rgba16Float,
            TextureUsage::RENDER_TARGET | TextureUsage::SAMPLED,
        ));
        builder.add_pass("depth-pre", CorePass::DepthPrePass { view: 0, depth });
        builder.add_pass(
            "opaque",
            CorePass::Opaque {
                view: 0,
                depth,
                color,
                shadow_map: None,
            },
        );
        builder.add_pass("transparent", CorePass::Transparent { view: 0, depth, color });
        builder.add_pass("composite", CorePass::Composite { view: 0, color, target });
        builder.bind_view(
            0,
            ViewTargetsDesc {
                depth: Some(depth),
                color: Some(color),
                composite: Some(target),
            },
        );

        let mut graph = fx.build(builder).unwrap();
        assert_eq!(graph.completed_phases(), &BuildPhase::ALL);
        assert_eq!(graph.ordered_pass_names(), vec!["depth-pre", "opaque", "transparent", "composite"]);
        // depth: COMMON->DEPTH_WRITE | depth->DEPTH_READ, color->RT | 无 | color->SRV, backbuffer->RT
        assert_eq!(graph.pass_barriers(0).len(), 1);
        assert_eq!(graph.pass_barriers(1).len(), 2);
        assert_eq!(graph.pass_barriers(2).len(), 0);
        assert_eq!(graph.pass_barriers(3).len(), 2);
        assert_eq!(graph.total_barrier_count(), 5);
        assert_eq!(graph.batches().len(), 1);

        let constants = graph.view_constants(0).unwrap();
        assert_eq!(constants.draw_count, 4);
        assert!(ShaderVisibleIndex::new(constants.composite_index).is_valid());
        assert_ne!(constants.depth_index, constants.color_index);
        assert_eq!(fx.device.descriptor_write_count(), 3);

        let recorded = fx.record(&graph).unwrap();
        assert_eq!(recorded.batch_count(), 1);
        let commands = recorded.batches[0].list.commands();
        let begins = commands.iter().filter(|c| matches!(c, GfxCommand::BeginEvent(_))).count();
        let ends = commands.iter().filter(|c| matches!(c, GfxCommand::EndEvent)).count();
        assert_eq!((begins, ends), (4, 4));
        assert!(commands.iter().any(|c| matches!(c, GfxCommand::Dispatch { x: 8, y: 8, z: 1 })));
        assert_eq!(
            recorded.planned_states().state_of(backbuffer.handle(), None),
            Some(ResourceState::RENDER_TARGET)
        );
        // 提交之前跟踪器不变
        assert_eq!(fx.tracker.state_of(backbuffer.handle(), None), Some(ResourceState::PRESENT));

        let submitted = fx.submit(&graph, recorded, &[]).unwrap();
        assert_eq!(submitted.len(), 1);
        assert_eq!(
            fx.tracker.state_of(backbuffer.handle(), None),
            Some(ResourceState::RENDER_TARGET)
        );
        assert_eq!(submitted[0].passes.len(), 4);

        let mut reclaimer = DeferredReclaimer::new();
        let released = graph.release_transients(&mut fx.tracker, &mut fx.bindless, &mut reclaimer, Epoch::new(1));
        assert_eq!(released, 2);
        assert_eq!(reclaimer.pending_count(), 2);
        assert_eq!(fx.tracker.tracked_count(), 1);
    }

    #[test]
    fn test_shader_resource_reads_need_no_barriers() {
        let mut fx = Fixture::new(QueueStrategy::single_queue("main"));
        let texture = fx.texture("albedo", TextureFormat::Rgba8Unorm);

        let mut builder = RenderGraphBuilder::new();
        let albedo = builder.import_texture("albedo", &texture, ResourceState::SHADER_RESOURCE);
        builder.add_pass("a", TestPass::new().read(albedo, ResourceState::SHADER_RESOURCE));
        builder.add_pass("b", TestPass::new().read(albedo, ResourceState::SHADER_RESOURCE));

        let mut graph = fx.build(builder).unwrap();
        assert_eq!(graph.total_barrier_count(), 0);
        // 第二次插入得到相同的结果
        assert_eq!(graph.reinsert_barriers(&fx.tracker).unwrap(), 0);
    }

    #[test]
    fn test_barrier_reinsertion_is_idempotent() {
        let mut fx = Fixture::new(QueueStrategy::single_queue("main"));
        let mut builder = RenderGraphBuilder::new();
        let color = builder.create_texture(TextureDesc::new_2d(
            "color",
            32,
            32,
            TextureFormat::Rgba8Unorm,
            TextureUsage::RENDER_TARGET | TextureUsage::SAMPLED,
        ));
        builder.add_pass("draw", TestPass::new().write(color, ResourceState::RENDER_TARGET));
        builder.add_pass("sample", TestPass::new().read(color, ResourceState::SHADER_RESOURCE));

        let mut graph = fx.build(builder).unwrap();
        let first = graph.total_barrier_count();
        let plans: Vec<_> = (0..graph.pass_count()).map(|i| graph.pass_barriers(i).clone()).collect();
        assert_eq!(graph.reinsert_barriers(&fx.tracker).unwrap(), first);
        for (i, plan) in plans.iter().enumerate() {
            assert_eq!(graph.pass_barriers(i), plan);
        }
    }

    #[test]
    fn test_validation_errors() {
        let mut fx = Fixture::new(QueueStrategy::single_queue("main"));

        let mut builder = RenderGraphBuilder::new();
        builder.create_texture(TextureDesc::new_2d("t", 8, 8, TextureFormat::Rgba8Unorm, TextureUsage::SAMPLED));
        builder.add_pass("same", NullPass);
        builder.add_pass("same", NullPass);
        let err = fx.build(builder).err().unwrap();
        assert!(err.message().contains("duplicate pass name"));
        // 失败时临时资源的登记被撤销
        assert_eq!(fx.tracker.tracked_count(), 0);

        let mut builder = RenderGraphBuilder::new();
        let never_written = builder.create_texture(TextureDesc::new_2d(
            "never-written",
            8,
            8,
            TextureFormat::Rgba8Unorm,
            TextureUsage::SAMPLED,
        ));
        builder.add_pass("reader", TestPass::new().read(never_written, ResourceState::SHADER_RESOURCE));
        let err = fx.build(builder).err().unwrap();
        assert!(err.message().contains("before any pass wrote it"));

        let mut builder = RenderGraphBuilder::new();
        builder.add_pass("dangling", TestPass::new().read(RgResourceHandle::default(), ResourceState::SHADER_RESOURCE));
        let err = fx.build(builder).err().unwrap();
        assert!(err.message().contains("unknown resource"));

        let mut builder = RenderGraphBuilder::new();
        builder.bind_view(3, ViewTargetsDesc::default());
        let err = fx.build(builder).err().unwrap();
        assert!(err.message().contains("view 3"));
    }

    #[test]
    fn test_cycle_is_reported() {
        let mut fx = Fixture::new(QueueStrategy::single_queue("main"));
        let mut builder = RenderGraphBuilder::new();
        let a = builder.add_pass("a", NullPass);
        let b = builder.add_pass("b", NullPass);
        builder.add_pass("c", NullPass);
        builder.add_dependency(a, b);
        builder.add_dependency(b, a);

        let err = fx.build(builder).err().unwrap();
        assert!(!err.is_fatal_to_engine());
        assert!(err.message().contains("cycle"));
        assert!(err.message().contains("\"a\""));
        assert!(!err.message().contains("\"c\""));
    }

    #[test]
    fn test_cross_queue_batches_wait_on_each_other() {
        let strategy = QueueStrategy::dedicated("gfx", "async-compute", "copy", "gfx");
        let mut fx = Fixture::new(strategy);

        let mut builder = RenderGraphBuilder::new();
        let particles = builder.create_buffer(BufferDesc::new(
            "particles",
            4096,
            BufferUsage::STORAGE,
            MemoryLocation::DeviceLocal,
        ));
        builder.add_pass(
            "simulate",
            TestPass::new()
                .write(particles, ResourceState::UNORDERED_ACCESS)
                .on(QueueRole::Compute),
        );
        builder.add_pass("draw", TestPass::new().read(particles, ResourceState::SHADER_RESOURCE));

        let graph = fx.build(builder).unwrap();
        assert_eq!(graph.batches().len(), 2);
        assert_eq!(graph.batches()[0].queue_key, QueueKey::new("async-compute"));
        assert_eq!(graph.batches()[1].depends_on, vec![0]);

        let recorded = fx.record(&graph).unwrap();
        let upload_fence = FenceValue::new(7);
        let submitted = fx
            .submit(&graph, recorded, &[(QueueKey::new("copy"), upload_fence)])
            .unwrap();
        assert_eq!(submitted.len(), 2);

        let gfx = fx.device.headless_queue(&QueueKey::new("gfx")).unwrap();
        let waits = &gfx.submissions()[0].waits;
        assert!(waits.contains(&(QueueKey::new("async-compute"), submitted[0].fence)));
        assert!(waits.contains(&(QueueKey::new("copy"), upload_fence)));

        let fences = SubmittedBatch::last_fences(&submitted);
        assert_eq!(fences.len(), 2);
    }

    #[test]
    fn test_failed_pass_keeps_tracker() {
        let mut fx = Fixture::new(QueueStrategy::single_queue("main"));
        let texture = fx.texture("target", TextureFormat::Rgba8Unorm);

        let mut builder = RenderGraphBuilder::new();
        let target = builder.import_texture("target", &texture, ResourceState::COMMON);
        builder.add_pass("ok", TestPass::new().write(target, ResourceState::RENDER_TARGET));
        builder.add_pass("bad", TestPass::new().read(target, ResourceState::SHADER_RESOURCE).failing());

        let graph = fx.build(builder).unwrap();
        let err = fx.record(&graph).err().unwrap();
        assert_eq!(err.message(), "boom");
        assert_eq!(fx.tracker.state_of(texture.handle(), None), Some(ResourceState::COMMON));
    }

    #[test]
    fn test_failed_submit_keeps_tracker() {
        let mut fx = Fixture::new(QueueStrategy::single_queue("main"));
        let texture = fx.texture("target", TextureFormat::Rgba8Unorm);

        let mut builder = RenderGraphBuilder::new();
        let target = builder.import_texture("target", &texture, ResourceState::COMMON);
        builder.add_pass("draw", TestPass::new().write(target, ResourceState::RENDER_TARGET));
        let graph = fx.build(builder).unwrap();

        let recorded = fx.record(&graph).unwrap();
        let queue = fx.device.headless_queue(&QueueKey::new("main")).unwrap();
        queue.fail_next_submits(MAX_SUBMIT_RETRIES + 1);

        let err = fx.submit(&graph, recorded, &[]).unwrap_err();
        assert!(err.submitted.is_empty());
        assert_eq!(err.error.class(), ErrorClass::Retriable);
        assert!(queue.submissions().is_empty());
        assert_eq!(fx.tracker.state_of(texture.handle(), None), Some(ResourceState::COMMON));
    }

    #[test]
    fn test_retriable_submit_is_rerecorded() {
        let mut fx = Fixture::new(QueueStrategy::single_queue("main"));
        let texture = fx.texture("target", TextureFormat::Rgba8Unorm);

        let mut builder = RenderGraphBuilder::new();
        let target = builder.import_texture("target", &texture, ResourceState::COMMON);
        builder.add_pass("draw", TestPass::new().write(target, ResourceState::RENDER_TARGET));
        let graph = fx.build(builder).unwrap();

        let recorded = fx.record(&graph).unwrap();
        let queue = fx.device.headless_queue(&QueueKey::new("main")).unwrap();
        queue.fail_next_submits(MAX_SUBMIT_RETRIES);

        let submitted = fx.submit(&graph, recorded, &[]).unwrap();
        assert_eq!(submitted.len(), 1);
        assert_eq!(queue.submissions().len(), 1);
        assert_eq!(fx.tracker.state_of(texture.handle(), None), Some(ResourceState::RENDER_TARGET));
    }
}
