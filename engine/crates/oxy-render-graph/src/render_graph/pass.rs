//! Pass 定义和构建器
//!
//! `RgPass` 用于声明式定义渲染 Pass，`RgPassBuilder` 在 `declare` 阶段收集资源读写。

use oxy_gfx::queue::QueueRole;
use oxy_gfx::resource_state::ResourceState;
use oxy_gfx::resources::Subresource;
use oxy_render_interface::phase_error::PhaseError;

use crate::render_context::RenderContext;
use crate::render_graph::resource::RgResourceHandle;

/// `add_pass` 返回的 pass 编号，即注册顺序
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RgPassId(pub(crate) usize);

impl RgPassId {
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

/// pass 对一个资源的一次访问
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RgAccess {
    pub resource: RgResourceHandle,
    /// None 表示整个资源
    pub subresource: Option<Subresource>,
    pub state: ResourceState,
}

/// Pass 构建器
///
/// 在 `RgPass::declare()` 中使用，声明 Pass 的资源依赖和运行的队列。
pub struct RgPassBuilder {
    pub(crate) reads: Vec<RgAccess>,
    pub(crate) writes: Vec<RgAccess>,
    pub(crate) queue: QueueRole,
}

impl RgPassBuilder {
    pub(crate) fn new() -> Self {
        Self {
            reads: Vec::new(),
            writes: Vec::new(),
            queue: QueueRole::Graphics,
        }
    }

    /// 声明读取资源
    ///
    /// # 参数
    /// - `handle`: 要读取的资源句柄
    /// - `state`: 读取时资源需要处于的状态（用于生成 barrier）
    #[inline]
    pub fn read(&mut self, handle: RgResourceHandle, state: ResourceState) -> RgResourceHandle {
        self.reads.push(RgAccess {
            resource: handle,
            subresource: None,
            state,
        });
        handle
    }

    /// 声明写入资源
    #[inline]
    pub fn write(&mut self, handle: RgResourceHandle, state: ResourceState) -> RgResourceHandle {
        self.writes.push(RgAccess {
            resource: handle,
            subresource: None,
            state,
        });
        handle
    }

    /// 声明读写资源（同时读取和写入）
    ///
    /// 常用于累积操作
    pub fn read_write(&mut self, handle: RgResourceHandle, state: ResourceState) -> RgResourceHandle {
        self.read(handle, state);
        self.write(handle, state)
    }

    pub fn read_sub(&mut self, handle: RgResourceHandle, subresource: Subresource, state: ResourceState) {
        self.reads.push(RgAccess {
            resource: handle,
            subresource: Some(subresource),
            state,
        });
    }

    pub fn write_sub(&mut self, handle: RgResourceHandle, subresource: Subresource, state: ResourceState) {
        self.writes.push(RgAccess {
            resource: handle,
            subresource: Some(subresource),
            state,
        });
    }

    /// 设置 pass 运行的队列，默认 Graphics
    #[inline]
    pub fn queue(&mut self, role: QueueRole) {
        self.queue = role;
    }
}

/// RgPass trait
///
/// 定义渲染图中的一个 Pass。
///
/// # 示例
///
/// ```ignore
/// struct BlurPass {
///     input: RgResourceHandle,
///     output: RgResourceHandle,
/// }
///
/// impl RgPass for BlurPass {
///     fn declare(&mut self, builder: &mut RgPassBuilder) {
///         builder.read(self.input, ResourceState::SHADER_RESOURCE);
///         builder.write(self.output, ResourceState::UNORDERED_ACCESS);
///         builder.queue(QueueRole::Compute);
///     }
///
///     fn execute(&self, ctx: &mut RenderContext<'_, '_>) -> Result<(), PhaseError> {
///         ctx.record(GfxCommand::Dispatch { x: 8, y: 8, z: 1 })
///     }
/// }
/// ```
///
/// # 线程安全
///
/// Pass 不需要是 Send + Sync，渲染图只在渲染线程上构建和录制。
pub trait RgPass {
    /// 声明 Pass 的资源依赖
    fn declare(&mut self, builder: &mut RgPassBuilder);

    /// 录制 Pass 的命令
    ///
    /// 进入时 barrier 已经录制，debug event 已经打开。
    fn execute(&self, ctx: &mut RenderContext<'_, '_>) -> Result<(), PhaseError>;

    /// 使用的 view，录制前会写入该 view 的 constant block
    fn view(&self) -> Option<u32> {
        None
    }
}

/// Pass 节点数据（构建后使用）
pub struct RgPassNode<'a> {
    pub name: String,
    pub reads: Vec<RgAccess>,
    pub writes: Vec<RgAccess>,
    pub queue: QueueRole,

    /// DeclarePasses 阶段之后为 true
    pub(crate) declared: bool,
    pub(crate) pass: Box<dyn RgPass + 'a>,
}

impl RgPassNode<'_> {
    /// 读和写涉及的所有资源
    pub fn accesses(&self) -> impl Iterator<Item = &RgAccess> {
        self.reads.iter().chain(self.writes.iter())
    }
}
