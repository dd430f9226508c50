//! Barrier 计算
//!
//! 在状态跟踪器的副本上按执行顺序模拟每个 pass，得到每个 pass 之前需要的 barrier。

use itertools::Itertools;

use oxy_gfx::commands::barrier::GfxBarrier;
use oxy_gfx::handles::ResourceHandle;
use oxy_gfx::resource_state::ResourceState;
use oxy_render_interface::state_tracker::{ResourceStateTracker, ResourceUsage, StateTrackerError};

/// 两个共享内存的资源之间的切换
///
/// 在第一个使用 `after` 的 pass 之前插入 aliasing barrier。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AliasDecl {
    pub before: Option<ResourceHandle>,
    pub after: ResourceHandle,
}

/// Pass 执行前需要的 Barrier 集合
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PassBarriers {
    pub barriers: Vec<GfxBarrier>,
}

impl PassBarriers {
    #[inline]
    pub fn has_barriers(&self) -> bool {
        !self.barriers.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.barriers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.barriers.is_empty()
    }

    pub fn transition_count(&self) -> usize {
        self.barriers.iter().filter(|b| matches!(b, GfxBarrier::Transition { .. })).count()
    }

    pub fn uav_count(&self) -> usize {
        self.barriers.iter().filter(|b| matches!(b, GfxBarrier::Uav { .. })).count()
    }

    pub fn aliasing_count(&self) -> usize {
        self.barriers.iter().filter(|b| matches!(b, GfxBarrier::Aliasing { .. })).count()
    }

    pub fn describe(&self) -> String {
        self.barriers.iter().map(GfxBarrier::describe).join(", ")
    }
}

/// 计算每个 pass 的 barrier
///
/// `usages[i]` 是 pass i 的资源使用，`plans` 按 pass 索引保存结果。
/// 结果总是替换 `plans` 中原有的内容，重复调用得到相同的计划。
/// `tracker` 不会被修改，真正的状态在录制时提交。
///
/// 返回 barrier 总数。
pub fn insert_barriers(
    tracker: &ResourceStateTracker,
    order: &[usize],
    usages: &[Vec<ResourceUsage>],
    aliasing: &[AliasDecl],
    plans: &mut Vec<PassBarriers>,
) -> Result<usize, StateTrackerError> {
    let _span = tracy_client::span!("insert_barriers");

    let mut scratch = tracker.clone();
    let mut alias_emitted = vec![false; aliasing.len()];
    plans.clear();
    plans.resize(usages.len(), PassBarriers::default());

    let mut total = 0;
    for &pass in order {
        let pass_usages = &usages[pass];
        let mut barriers = Vec::new();

        for (decl, emitted) in aliasing.iter().zip(alias_emitted.iter_mut()) {
            if !*emitted && pass_usages.iter().any(|u| u.resource == decl.after) {
                // aliasing 之后资源内容未定义，从 COMMON 开始
                barriers.push(scratch.declare_aliasing(decl.before, decl.after, ResourceState::COMMON)?);
                *emitted = true;
            }
        }

        barriers.extend(scratch.plan(pass_usages)?);
        scratch.commit(pass_usages)?;

        total += barriers.len();
        plans[pass] = PassBarriers { barriers };
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxy_gfx::handles::ResourceKind;
    use oxy_gfx::resources::{TextureDesc, TextureFormat, TextureUsage};

    fn texture(index: u32) -> ResourceHandle {
        ResourceHandle::new(ResourceKind::Texture, index, 1)
    }

    fn tracker_with(resources: &[ResourceHandle], state: ResourceState) -> ResourceStateTracker {
        let mut tracker = ResourceStateTracker::new();
        let desc = TextureDesc::new_2d("t", 8, 8, TextureFormat::Rgba8Unorm, TextureUsage::SAMPLED);
        for &r in resources {
            tracker.register_texture(r, &desc, state);
        }
        tracker
    }

    #[test]
    fn test_read_read_no_barrier() {
        let r = texture(0);
        let tracker = tracker_with(&[r], ResourceState::SHADER_RESOURCE);
        let usages = vec![
            vec![ResourceUsage::whole(r, ResourceState::SHADER_RESOURCE)],
            vec![ResourceUsage::whole(r, ResourceState::SHADER_RESOURCE)],
        ];
        let mut plans = Vec::new();
        let total = insert_barriers(&tracker, &[0, 1], &usages, &[], &mut plans).unwrap();
        assert_eq!(total, 0);
        assert!(plans.iter().all(PassBarriers::is_empty));
    }

    #[test]
    fn test_insertion_is_idempotent() {
        let a = texture(0);
        let b = texture(1);
        let tracker = tracker_with(&[a, b], ResourceState::COMMON);
        let usages = vec![
            vec![ResourceUsage::whole(a, ResourceState::RENDER_TARGET)],
            vec![
                ResourceUsage::whole(a, ResourceState::SHADER_RESOURCE),
                ResourceUsage::whole(b, ResourceState::UNORDERED_ACCESS),
            ],
            vec![ResourceUsage::whole(b, ResourceState::UNORDERED_ACCESS)],
        ];
        let mut plans = Vec::new();
        let first = insert_barriers(&tracker, &[0, 1, 2], &usages, &[], &mut plans).unwrap();
        let snapshot = plans.clone();
        assert_eq!(first, 4);
        assert_eq!(plans[2].uav_count(), 1);

        // 第二次插入不会追加新的 barrier
        let second = insert_barriers(&tracker, &[0, 1, 2], &usages, &[], &mut plans).unwrap();
        assert_eq!(second, first);
        assert_eq!(plans, snapshot);
        // 原跟踪器没有被修改
        assert_eq!(tracker.state_of(a, None), Some(ResourceState::COMMON));
    }

    #[test]
    fn test_aliasing_barrier() {
        let old = texture(0);
        let new = texture(1);
        let tracker = tracker_with(&[old, new], ResourceState::SHADER_RESOURCE);
        let usages = vec![
            vec![ResourceUsage::whole(old, ResourceState::SHADER_RESOURCE)],
            vec![ResourceUsage::whole(new, ResourceState::RENDER_TARGET)],
        ];
        let aliasing = [AliasDecl {
            before: Some(old),
            after: new,
        }];
        let mut plans = Vec::new();
        insert_barriers(&tracker, &[0, 1], &usages, &aliasing, &mut plans).unwrap();

        assert_eq!(plans[0].len(), 0);
        assert_eq!(plans[1].aliasing_count(), 1);
        assert_eq!(
            plans[1].barriers[1],
            GfxBarrier::transition(new, ResourceState::COMMON, ResourceState::RENDER_TARGET)
        );
    }
}
