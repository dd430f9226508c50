//! shader 可见的 descriptor slot 分配
//!
//! 每个 domain 在所属 heap 中占据固定的 `[base, base + capacity)` 区间，这些常量是 shader 的 ABI。
//! Materials 与 GlobalSrv 在 `[1000, 2049)` 上重叠，因此占用情况按 heap 统一记录。

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use thiserror::Error;

use oxy_gfx::device::DescriptorHeapKind;

use crate::epoch::Epoch;
use crate::reclaimer::{DeferredReclaimer, Reclaimable};

/// heap 中的 bindless 下标
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShaderVisibleIndex(u32);

impl ShaderVisibleIndex {
    pub const INVALID: ShaderVisibleIndex = ShaderVisibleIndex(0xFFFF_FFFF);

    #[inline]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    #[inline]
    pub const fn value(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }
}

impl Default for ShaderVisibleIndex {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Debug for ShaderVisibleIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() { write!(f, "#{}", self.0) } else { f.write_str("#INVALID") }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DescriptorDomain {
    Scene,
    GlobalSrv,
    Materials,
    Textures,
    Samplers,
}

impl DescriptorDomain {
    pub const ALL: [DescriptorDomain; 5] = [
        DescriptorDomain::Scene,
        DescriptorDomain::GlobalSrv,
        DescriptorDomain::Materials,
        DescriptorDomain::Textures,
        DescriptorDomain::Samplers,
    ];

    #[inline]
    pub const fn base(self) -> u32 {
        match self {
            DescriptorDomain::Scene => 0,
            DescriptorDomain::GlobalSrv => 1,
            DescriptorDomain::Materials => 1000,
            DescriptorDomain::Textures => 5096,
            DescriptorDomain::Samplers => 0,
        }
    }

    #[inline]
    pub const fn capacity(self) -> u32 {
        match self {
            DescriptorDomain::Scene => 1,
            DescriptorDomain::GlobalSrv => 2048,
            DescriptorDomain::Materials => 4096,
            DescriptorDomain::Textures => 65536,
            DescriptorDomain::Samplers => 256,
        }
    }

    #[inline]
    pub const fn end(self) -> u32 {
        self.base() + self.capacity()
    }

    #[inline]
    pub const fn heap(self) -> DescriptorHeapKind {
        match self {
            DescriptorDomain::Samplers => DescriptorHeapKind::Sampler,
            _ => DescriptorHeapKind::CbvSrvUav,
        }
    }

    #[inline]
    pub const fn contains(self, index: u32) -> bool {
        index >= self.base() && index < self.end()
    }

    #[inline]
    const fn ordinal(self) -> usize {
        self as usize
    }

    /// heap 的总大小，取其中所有 domain 的最大上界
    pub fn heap_size(heap: DescriptorHeapKind) -> u32 {
        Self::ALL.iter().filter(|d| d.heap() == heap).map(|d| d.end()).max().unwrap_or(0)
    }
}

/// 一个 descriptor slot：所属的 domain 和 heap 中的下标
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorSlot {
    domain: DescriptorDomain,
    index: u32,
}

impl DescriptorSlot {
    pub const fn new(domain: DescriptorDomain, index: u32) -> Self {
        Self { domain, index }
    }

    #[inline]
    pub const fn domain(self) -> DescriptorDomain {
        self.domain
    }

    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[inline]
    pub const fn shader_index(self) -> ShaderVisibleIndex {
        ShaderVisibleIndex::new(self.index)
    }
}

impl fmt::Display for DescriptorSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}[{}]", self.domain, self.index)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("descriptor heap exhausted: domain {domain:?} (capacity {capacity})")]
    HeapExhausted { domain: DescriptorDomain, capacity: u32 },

    #[error("descriptor slot {0} is not allocated")]
    NotAllocated(DescriptorSlot),
}

/// 独占一个 descriptor slot
///
/// 不可复制；drop 时 slot 进入分配器的释放队列，
/// 随后在 `DescriptorAllocator::flush_releases` 中登记到延迟回收器。
pub struct DescriptorHandle {
    slot: DescriptorSlot,
    releases: Weak<Mutex<Vec<DescriptorSlot>>>,
}

impl DescriptorHandle {
    #[inline]
    pub fn slot(&self) -> DescriptorSlot {
        self.slot
    }

    #[inline]
    pub fn domain(&self) -> DescriptorDomain {
        self.slot.domain
    }

    #[inline]
    pub fn index(&self) -> ShaderVisibleIndex {
        self.slot.shader_index()
    }
}

impl fmt::Debug for DescriptorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DescriptorHandle({})", self.slot)
    }
}

impl Drop for DescriptorHandle {
    fn drop(&mut self) {
        // 分配器已经销毁时 slot 随之消失
        if let Some(releases) = self.releases.upgrade() {
            releases.lock().push(self.slot);
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DescriptorStats {
    pub allocated: u32,
    pub capacity: u32,
    pub pending_release: u32,
}

#[derive(Default)]
struct DomainState {
    /// 下一个从未分配过的 slot（相对 base 的偏移）
    next_fresh: u32,
    /// 已经回收的 slot，按回收顺序复用
    recycled: VecDeque<u32>,
    allocated: u32,
    pending_release: u32,
}

/// 按 domain 分配 descriptor slot
///
/// 先按升序分配从未用过的 slot，用完之后按 FIFO 复用已回收的 slot。
/// 释放的 slot 只有在登记的 epoch 被 GPU 完成后才会回到空闲列表。
pub struct DescriptorAllocator {
    domains: [DomainState; 5],
    srv_occupied: Vec<bool>,
    sampler_occupied: Vec<bool>,
    releases: Arc<Mutex<Vec<DescriptorSlot>>>,
}

// new & init
impl DescriptorAllocator {
    pub fn new() -> Self {
        Self {
            domains: Default::default(),
            srv_occupied: vec![false; DescriptorDomain::heap_size(DescriptorHeapKind::CbvSrvUav) as usize],
            sampler_occupied: vec![false; DescriptorDomain::heap_size(DescriptorHeapKind::Sampler) as usize],
            releases: Arc::new(Mutex::new(Vec::new())),
        }
    }
}
impl Default for DescriptorAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// tools
impl DescriptorAllocator {
    fn occupancy(&mut self, heap: DescriptorHeapKind) -> &mut Vec<bool> {
        match heap {
            DescriptorHeapKind::CbvSrvUav => &mut self.srv_occupied,
            DescriptorHeapKind::Sampler => &mut self.sampler_occupied,
        }
    }

    fn take_fresh(&mut self, domain: DescriptorDomain) -> Option<u32> {
        let base = domain.base();
        let capacity = domain.capacity();
        let heap = domain.heap();
        while self.domains[domain.ordinal()].next_fresh < capacity {
            let index = base + self.domains[domain.ordinal()].next_fresh;
            self.domains[domain.ordinal()].next_fresh += 1;
            // 可能已经被重叠的 domain 占用
            if !self.occupancy(heap)[index as usize] {
                return Some(index);
            }
        }
        None
    }

    fn take_recycled(&mut self, domain: DescriptorDomain) -> Option<u32> {
        let heap = domain.heap();
        while let Some(index) = self.domains[domain.ordinal()].recycled.pop_front() {
            if !self.occupancy(heap)[index as usize] {
                return Some(index);
            }
        }
        None
    }
}

// update
impl DescriptorAllocator {
    pub fn allocate(&mut self, domain: DescriptorDomain) -> Result<DescriptorHandle, DescriptorError> {
        let index = self
            .take_fresh(domain)
            .or_else(|| self.take_recycled(domain))
            .ok_or(DescriptorError::HeapExhausted {
                domain,
                capacity: domain.capacity(),
            })?;

        self.occupancy(domain.heap())[index as usize] = true;
        self.domains[domain.ordinal()].allocated += 1;

        Ok(DescriptorHandle {
            slot: DescriptorSlot::new(domain, index),
            releases: Arc::downgrade(&self.releases),
        })
    }

    /// 把 drop 掉的 handle 登记到延迟回收器，登记在 `epoch` 上
    ///
    /// 返回本次登记的数量
    pub fn flush_releases(&mut self, reclaimer: &mut DeferredReclaimer, epoch: Epoch) -> usize {
        let released = std::mem::take(&mut *self.releases.lock());
        for slot in &released {
            self.domains[slot.domain.ordinal()].pending_release += 1;
            reclaimer.register_deferred_release(Reclaimable::Descriptor(*slot), epoch);
        }
        released.len()
    }

    /// 延迟回收器确认 GPU 已经不再使用后，slot 回到空闲列表
    ///
    /// 重叠区间内的 slot 会同时回到覆盖它的所有 domain。
    pub fn free_retired(&mut self, slot: DescriptorSlot) -> Result<(), DescriptorError> {
        let heap = slot.domain.heap();
        let occupied = self.occupancy(heap);
        if !occupied.get(slot.index as usize).copied().unwrap_or(false) {
            return Err(DescriptorError::NotAllocated(slot));
        }
        occupied[slot.index as usize] = false;

        let state = &mut self.domains[slot.domain.ordinal()];
        state.allocated = state.allocated.saturating_sub(1);
        state.pending_release = state.pending_release.saturating_sub(1);

        for domain in DescriptorDomain::ALL {
            if domain.heap() == heap && domain.contains(slot.index) {
                let state = &mut self.domains[domain.ordinal()];
                // 还没被 fresh 游标扫到的 slot 不需要进入回收列表
                if slot.index - domain.base() < state.next_fresh {
                    state.recycled.push_back(slot.index);
                }
            }
        }
        Ok(())
    }
}

// getters
impl DescriptorAllocator {
    pub fn stats(&self, domain: DescriptorDomain) -> DescriptorStats {
        let state = &self.domains[domain.ordinal()];
        DescriptorStats {
            allocated: state.allocated,
            capacity: domain.capacity(),
            pending_release: state.pending_release,
        }
    }

    /// 已经 drop 但还没有 flush 的 handle 数量
    pub fn queued_releases(&self) -> usize {
        self.releases.lock().len()
    }

    pub fn is_occupied(&self, heap: DescriptorHeapKind, index: u32) -> bool {
        let occupied = match heap {
            DescriptorHeapKind::CbvSrvUav => &self.srv_occupied,
            DescriptorHeapKind::Sampler => &self.sampler_occupied,
        };
        occupied.get(index as usize).copied().unwrap_or(false)
    }
}
