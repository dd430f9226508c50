use std::collections::VecDeque;
use std::fmt;

/// 资源的类型标签，存放在 handle 的最高 8 位
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ResourceKind {
    Buffer = 1,
    Texture = 2,
}

impl ResourceKind {
    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(ResourceKind::Buffer),
            2 => Some(ResourceKind::Texture),
            _ => None,
        }
    }
}

/// 打包成 u64 的资源句柄
///
/// 布局：`[tag: 8 | generation: 24 | index: 32]`。
/// slot 复用时 generation 递增，旧 handle 不会命中新资源。
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceHandle(u64);

impl ResourceHandle {
    pub const INVALID: ResourceHandle = ResourceHandle(0);

    const GENERATION_BITS: u32 = 24;
    const GENERATION_MASK: u32 = (1 << Self::GENERATION_BITS) - 1;

    pub fn new(kind: ResourceKind, index: u32, generation: u32) -> Self {
        let tag = (kind as u64) << 56;
        let generation = ((generation & Self::GENERATION_MASK) as u64) << 32;
        Self(tag | generation | index as u64)
    }

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn kind(self) -> Option<ResourceKind> {
        ResourceKind::from_tag((self.0 >> 56) as u8)
    }

    #[inline]
    pub const fn index(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub const fn generation(self) -> u32 {
        ((self.0 >> 32) as u32) & Self::GENERATION_MASK
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        self.kind().is_some()
    }
}

impl Default for ResourceHandle {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            Some(kind) => write!(f, "{:?}#{}v{}", kind, self.index(), self.generation()),
            None => f.write_str("Invalid"),
        }
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

struct SlotEntry {
    generation: u32,
    kind: ResourceKind,
    alive: bool,
}

/// 带 generation 的 handle 分配器
///
/// 释放的 slot 按 FIFO 复用，拉长同一个 slot 两次复用之间的间隔。
#[derive(Default)]
pub struct ResourceHandleAllocator {
    slots: Vec<SlotEntry>,
    free: VecDeque<u32>,
    live: usize,
}

impl ResourceHandleAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self, kind: ResourceKind) -> ResourceHandle {
        self.live += 1;
        if let Some(index) = self.free.pop_front() {
            let slot = &mut self.slots[index as usize];
            slot.kind = kind;
            slot.alive = true;
            return ResourceHandle::new(kind, index, slot.generation);
        }

        let index = self.slots.len() as u32;
        self.slots.push(SlotEntry {
            generation: 1,
            kind,
            alive: true,
        });
        ResourceHandle::new(kind, index, 1)
    }

    /// 释放 handle；过期或重复释放返回 false
    pub fn release(&mut self, handle: ResourceHandle) -> bool {
        if !self.is_alive(handle) {
            return false;
        }
        let slot = &mut self.slots[handle.index() as usize];
        slot.alive = false;
        // generation 在 24 位内回绕，跳过 0
        slot.generation = (slot.generation + 1) & ResourceHandle::GENERATION_MASK;
        if slot.generation == 0 {
            slot.generation = 1;
        }
        self.free.push_back(handle.index());
        self.live -= 1;
        true
    }

    pub fn is_alive(&self, handle: ResourceHandle) -> bool {
        let Some(kind) = handle.kind() else {
            return false;
        };
        self.slots
            .get(handle.index() as usize)
            .is_some_and(|slot| slot.alive && slot.kind == kind && slot.generation == handle.generation())
    }

    #[inline]
    pub fn live_count(&self) -> usize {
        self.live
    }
}
