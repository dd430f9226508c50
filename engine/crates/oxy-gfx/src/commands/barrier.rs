use crate::handles::ResourceHandle;
use crate::resource_state::ResourceState;
use crate::resources::Subresource;

/// 录制到 command list 里的 barrier
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum GfxBarrier {
    /// 状态转换；`subresource` 为 None 表示整个资源
    Transition {
        resource: ResourceHandle,
        subresource: Option<Subresource>,
        before: ResourceState,
        after: ResourceState,
    },
    /// 同一资源连续的 UAV 访问之间
    Uav { resource: ResourceHandle },
    /// 共享内存的两个资源之间切换
    Aliasing {
        before: Option<ResourceHandle>,
        after: ResourceHandle,
    },
}

impl GfxBarrier {
    pub fn transition(resource: ResourceHandle, before: ResourceState, after: ResourceState) -> Self {
        GfxBarrier::Transition {
            resource,
            subresource: None,
            before,
            after,
        }
    }

    pub fn transition_sub(
        resource: ResourceHandle,
        subresource: Subresource,
        before: ResourceState,
        after: ResourceState,
    ) -> Self {
        GfxBarrier::Transition {
            resource,
            subresource: Some(subresource),
            before,
            after,
        }
    }

    /// barrier 作用的资源（aliasing 取目标资源）
    pub fn resource(&self) -> ResourceHandle {
        match self {
            GfxBarrier::Transition { resource, .. } | GfxBarrier::Uav { resource } => *resource,
            GfxBarrier::Aliasing { after, .. } => *after,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            GfxBarrier::Transition {
                resource,
                subresource: None,
                before,
                after,
            } => format!("transition {resource} {before} -> {after}"),
            GfxBarrier::Transition {
                resource,
                subresource: Some(sub),
                before,
                after,
            } => format!("transition {resource}[mip {} layer {}] {before} -> {after}", sub.mip, sub.layer),
            GfxBarrier::Uav { resource } => format!("uav {resource}"),
            GfxBarrier::Aliasing { before: Some(before), after } => format!("aliasing {before} -> {after}"),
            GfxBarrier::Aliasing { before: None, after } => format!("aliasing * -> {after}"),
        }
    }
}
