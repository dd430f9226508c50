//! 资源状态跟踪
//!
//! 记录每个 buffer / texture 最后一次观察到的状态，由此计算 pass 之间最少的 barrier。
//! texture 按 (mip, layer) 子资源分别记录。

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use thiserror::Error;

use oxy_gfx::commands::barrier::GfxBarrier;
use oxy_gfx::handles::ResourceHandle;
use oxy_gfx::resource_state::ResourceState;
use oxy_gfx::resources::{Subresource, TextureDesc};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateTrackerError {
    #[error("resource {0} is not tracked")]
    Untracked(ResourceHandle),

    #[error("resource {resource} has no subresource mip {} layer {}", subresource.mip, subresource.layer)]
    InvalidSubresource {
        resource: ResourceHandle,
        subresource: Subresource,
    },
}

/// pass 对一个资源（或子资源）的使用
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ResourceUsage {
    pub resource: ResourceHandle,
    /// None 表示整个资源
    pub subresource: Option<Subresource>,
    pub state: ResourceState,
}

impl ResourceUsage {
    pub fn whole(resource: ResourceHandle, state: ResourceState) -> Self {
        Self {
            resource,
            subresource: None,
            state,
        }
    }

    pub fn sub(resource: ResourceHandle, subresource: Subresource, state: ResourceState) -> Self {
        Self {
            resource,
            subresource: Some(subresource),
            state,
        }
    }
}

#[derive(Clone, Debug)]
enum Tracked {
    Buffer(ResourceState),
    Texture {
        mip_levels: u32,
        array_layers: u32,
        /// layer 为主序
        states: Vec<ResourceState>,
    },
}

/// 两个状态之间需要的 barrier
fn barrier_between(
    resource: ResourceHandle,
    subresource: Option<Subresource>,
    before: ResourceState,
    after: ResourceState,
) -> Option<GfxBarrier> {
    if before == after {
        // 连续的 UAV 访问需要 UAV barrier，其余相同状态不需要 barrier
        return after.is_uav().then_some(GfxBarrier::Uav { resource });
    }
    Some(GfxBarrier::Transition {
        resource,
        subresource,
        before,
        after,
    })
}

impl Tracked {
    fn apply(&mut self, usage: &ResourceUsage, barriers: &mut Vec<GfxBarrier>) -> Result<(), StateTrackerError> {
        let resource = usage.resource;
        let after = usage.state;
        match self {
            Tracked::Buffer(state) => {
                barriers.extend(barrier_between(resource, None, *state, after));
                *state = after;
            }
            Tracked::Texture {
                mip_levels,
                array_layers,
                states,
            } => match usage.subresource {
                Some(sub) => {
                    if sub.mip >= *mip_levels || sub.layer >= *array_layers {
                        return Err(StateTrackerError::InvalidSubresource {
                            resource,
                            subresource: sub,
                        });
                    }
                    let index = (sub.layer * *mip_levels + sub.mip) as usize;
                    let sub_opt = if states.len() == 1 { None } else { Some(sub) };
                    barriers.extend(barrier_between(resource, sub_opt, states[index], after));
                    states[index] = after;
                }
                None => {
                    let uniform = states.iter().all(|s| *s == states[0]);
                    if uniform {
                        barriers.extend(barrier_between(resource, None, states[0], after));
                    } else {
                        // 子资源状态不一致时逐个转换
                        let mut uav_emitted = false;
                        for layer in 0..*array_layers {
                            for mip in 0..*mip_levels {
                                let index = (layer * *mip_levels + mip) as usize;
                                match barrier_between(resource, Some(Subresource::new(mip, layer)), states[index], after) {
                                    Some(GfxBarrier::Uav { .. }) if uav_emitted => {}
                                    Some(barrier @ GfxBarrier::Uav { .. }) => {
                                        uav_emitted = true;
                                        barriers.push(barrier);
                                    }
                                    Some(barrier) => barriers.push(barrier),
                                    None => {}
                                }
                            }
                        }
                    }
                    states.iter_mut().for_each(|s| *s = after);
                }
            },
        }
        Ok(())
    }

    fn state_of(&self, subresource: Option<Subresource>) -> Option<ResourceState> {
        match self {
            Tracked::Buffer(state) => Some(*state),
            Tracked::Texture {
                mip_levels,
                array_layers,
                states,
            } => match subresource {
                Some(sub) if sub.mip < *mip_levels && sub.layer < *array_layers => {
                    Some(states[(sub.layer * *mip_levels + sub.mip) as usize])
                }
                Some(_) => None,
                // 整个资源的状态只在所有子资源一致时有意义
                None => states.iter().all(|s| *s == states[0]).then(|| states[0]),
            },
        }
    }
}

/// 资源状态跟踪器
///
/// `plan` 只计算 barrier，不修改状态；pass 录制完成后调用 `commit` 更新观察到的状态。
/// 只在渲染线程上访问。
#[derive(Clone, Default)]
pub struct ResourceStateTracker {
    tracked: HashMap<ResourceHandle, Tracked>,
}

// new & init
impl ResourceStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_buffer(&mut self, resource: ResourceHandle, initial: ResourceState) {
        self.tracked.insert(resource, Tracked::Buffer(initial));
    }

    pub fn register_texture(&mut self, resource: ResourceHandle, desc: &TextureDesc, initial: ResourceState) {
        self.tracked.insert(
            resource,
            Tracked::Texture {
                mip_levels: desc.mip_levels,
                array_layers: desc.array_layers,
                states: vec![initial; desc.subresource_count() as usize],
            },
        );
    }

    pub fn unregister(&mut self, resource: ResourceHandle) -> bool {
        self.tracked.remove(&resource).is_some()
    }
}

// getters
impl ResourceStateTracker {
    #[inline]
    pub fn is_tracked(&self, resource: ResourceHandle) -> bool {
        self.tracked.contains_key(&resource)
    }

    #[inline]
    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    /// 资源当前的状态；texture 子资源状态不一致时整体查询返回 None
    pub fn state_of(&self, resource: ResourceHandle, subresource: Option<Subresource>) -> Option<ResourceState> {
        self.tracked.get(&resource).and_then(|t| t.state_of(subresource))
    }
}

// update
impl ResourceStateTracker {
    /// 计算执行 `usages` 之前需要的 barrier，不修改任何状态
    pub fn plan(&self, usages: &[ResourceUsage]) -> Result<Vec<GfxBarrier>, StateTrackerError> {
        let mut scratch: HashMap<ResourceHandle, Tracked> = HashMap::new();
        let mut barriers = Vec::new();
        for usage in usages {
            let tracked = match scratch.entry(usage.resource) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    let original =
                        self.tracked.get(&usage.resource).ok_or(StateTrackerError::Untracked(usage.resource))?;
                    entry.insert(original.clone())
                }
            };
            tracked.apply(usage, &mut barriers)?;
        }
        Ok(barriers)
    }

    /// pass 录制完成后更新观察到的状态
    ///
    /// 失败时不修改任何状态。
    pub fn commit(&mut self, usages: &[ResourceUsage]) -> Result<(), StateTrackerError> {
        // 先检查，保证失败时状态不变
        self.plan(usages)?;
        let mut discard = Vec::new();
        for usage in usages {
            if let Some(tracked) = self.tracked.get_mut(&usage.resource) {
                tracked.apply(usage, &mut discard)?;
            }
        }
        Ok(())
    }

    /// 声明两个共享内存的资源之间的切换
    ///
    /// 新资源的内容未定义，状态重置为 `initial`。
    pub fn declare_aliasing(
        &mut self,
        before: Option<ResourceHandle>,
        after: ResourceHandle,
        initial: ResourceState,
    ) -> Result<GfxBarrier, StateTrackerError> {
        let tracked = self.tracked.get_mut(&after).ok_or(StateTrackerError::Untracked(after))?;
        match tracked {
            Tracked::Buffer(state) => *state = initial,
            Tracked::Texture { states, .. } => states.iter_mut().for_each(|s| *s = initial),
        }
        Ok(GfxBarrier::Aliasing { before, after })
    }
}
