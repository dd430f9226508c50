//! 图形后端的契约
//!
//! 渲染核心只通过这里的 trait 访问后端：创建资源、查找队列、提交、查询 fence、写 descriptor。

use std::sync::Arc;
use std::task::Waker;
use std::time::Duration;

use crate::commands::command_list::CommandList;
use crate::commands::submit_info::GfxSubmitInfo;
use crate::error::GfxResult;
use crate::fence::FenceValue;
use crate::handles::ResourceHandle;
use crate::queue::QueueKey;
use crate::resources::{BufferDesc, GfxBuffer, GfxTexture, TextureDesc};

/// shader 可见的 descriptor heap
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DescriptorHeapKind {
    CbvSrvUav,
    Sampler,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ViewKind {
    Srv,
    Uav,
    Cbv,
    Sampler,
}

/// 一次 descriptor 写入
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorWrite {
    /// sampler 没有对应的资源
    pub resource: Option<ResourceHandle>,
    pub view: ViewKind,
}

pub trait GfxDevice: Send + Sync {
    fn name(&self) -> &str;

    fn create_buffer(&self, desc: BufferDesc) -> GfxResult<Arc<GfxBuffer>>;

    fn create_texture(&self, desc: TextureDesc) -> GfxResult<Arc<GfxTexture>>;

    fn queue(&self, key: &QueueKey) -> GfxResult<Arc<dyn GfxQueue>>;

    /// buffer 拷贝的偏移对齐要求
    fn copy_alignment(&self) -> u64;

    fn write_descriptor(&self, heap: DescriptorHeapKind, index: u32, write: &DescriptorWrite) -> GfxResult<()>;

    fn is_lost(&self) -> bool;
}

pub trait GfxQueue: Send + Sync {
    fn key(&self) -> &QueueKey;

    /// 提交并 signal 下一个 fence 值
    ///
    /// 提交的 command list 必须处于 Recorded 状态。
    fn submit(&self, info: GfxSubmitInfo) -> GfxResult<FenceValue>;

    /// GPU 已经完成的 fence 值
    fn completed_value(&self) -> FenceValue;

    /// 最近一次提交 signal 的值
    fn last_submitted_value(&self) -> FenceValue;

    /// 阻塞等待；超时返回 `GfxError::FenceWaitTimeout`
    fn wait_cpu(&self, value: FenceValue, timeout: Option<Duration>) -> GfxResult<()>;

    /// `value` 完成或者设备丢失时唤醒 `waker`，已经满足时立即唤醒
    fn register_waker(&self, value: FenceValue, waker: Waker);

    fn present(&self) -> GfxResult<()>;

    /// 执行完成、已经回到 Free 的 command list
    fn collect_retired(&self) -> Vec<CommandList>;

    fn is_lost(&self) -> bool;
}
