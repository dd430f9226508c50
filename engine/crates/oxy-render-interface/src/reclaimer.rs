use std::any::Any;
use std::fmt;
use std::sync::Arc;

use oxy_gfx::resources::{GfxBuffer, GfxTexture};

use crate::descriptor::DescriptorSlot;
use crate::epoch::Epoch;

/// 等待 GPU 完成后才能释放的对象
pub enum Reclaimable {
    Buffer(Arc<GfxBuffer>),
    Texture(Arc<GfxTexture>),
    /// descriptor slot，回收后需要还给 DescriptorAllocator
    Descriptor(DescriptorSlot),
    /// 其他需要延迟析构的对象，例如 staging 分配
    Object { label: String, object: Box<dyn Any + Send> },
}

impl Reclaimable {
    pub fn object(label: impl Into<String>, object: impl Any + Send) -> Self {
        Reclaimable::Object {
            label: label.into(),
            object: Box::new(object),
        }
    }

    pub fn label(&self) -> String {
        match self {
            Reclaimable::Buffer(buffer) => format!("buffer \"{}\"", buffer.name()),
            Reclaimable::Texture(texture) => format!("texture \"{}\"", texture.name()),
            Reclaimable::Descriptor(slot) => format!("descriptor {slot}"),
            Reclaimable::Object { label, .. } => label.clone(),
        }
    }
}

impl fmt::Debug for Reclaimable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// 延迟回收器
///
/// 对象登记在最后一次可能被使用的 epoch 上，
/// GPU 完成的 epoch 追上之后按登记顺序释放。
#[derive(Default)]
pub struct DeferredReclaimer {
    pending: Vec<(Reclaimable, Epoch)>,
    released_total: u64,
}

// new & init
impl DeferredReclaimer {
    pub fn new() -> Self {
        Self::default()
    }
}

// update
impl DeferredReclaimer {
    pub fn register_deferred_release(&mut self, item: Reclaimable, epoch: Epoch) {
        log::trace!("deferred release of {} at {}", item.label(), epoch);
        self.pending.push((item, epoch));
    }

    /// 取出所有 epoch <= completed 的对象，顺序与登记顺序一致
    ///
    /// 返回的对象由调用者释放：descriptor 还给分配器，其余的直接 drop。
    pub fn retire(&mut self, completed: Epoch) -> Vec<Reclaimable> {
        let _span = tracy_client::span!("DeferredReclaimer::retire");

        let mut retired = Vec::new();
        let mut kept = Vec::with_capacity(self.pending.len());
        for (item, epoch) in self.pending.drain(..) {
            if epoch <= completed {
                retired.push(item);
            } else {
                kept.push((item, epoch));
            }
        }
        self.pending = kept;
        self.released_total += retired.len() as u64;
        retired
    }

    /// 关闭时使用：GPU 已经空闲，全部释放
    pub fn drain_all(&mut self) -> Vec<Reclaimable> {
        self.released_total += self.pending.len() as u64;
        self.pending.drain(..).map(|(item, _)| item).collect()
    }
}

// getters
impl DeferredReclaimer {
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    #[inline]
    pub fn released_total(&self) -> u64 {
        self.released_total
    }

    /// 最早仍在等待的 epoch
    pub fn oldest_pending_epoch(&self) -> Option<Epoch> {
        self.pending.iter().map(|(_, epoch)| *epoch).min()
    }
}

impl Drop for DeferredReclaimer {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            log::warn!("DeferredReclaimer dropped with {} pending releases", self.pending.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::DescriptorDomain;

    fn slot(index: u32) -> Reclaimable {
        Reclaimable::Descriptor(DescriptorSlot::new(DescriptorDomain::Textures, index))
    }

    fn indices(items: &[Reclaimable]) -> Vec<u32> {
        items
            .iter()
            .filter_map(|item| match item {
                Reclaimable::Descriptor(slot) => Some(slot.index()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_retire_in_registration_order() {
        let mut reclaimer = DeferredReclaimer::new();
        reclaimer.register_deferred_release(slot(5100), Epoch::new(3));
        reclaimer.register_deferred_release(slot(5101), Epoch::new(1));
        reclaimer.register_deferred_release(slot(5102), Epoch::new(2));
        reclaimer.register_deferred_release(slot(5103), Epoch::new(5));

        assert!(reclaimer.retire(Epoch::ZERO).is_empty());

        let retired = reclaimer.retire(Epoch::new(3));
        assert_eq!(indices(&retired), vec![5100, 5101, 5102]);
        assert_eq!(reclaimer.pending_count(), 1);
        assert_eq!(reclaimer.oldest_pending_epoch(), Some(Epoch::new(5)));

        let rest = reclaimer.drain_all();
        assert_eq!(indices(&rest), vec![5103]);
        assert_eq!(reclaimer.released_total(), 4);
    }

    #[test]
    fn test_object_dropped_on_retire() {
        let marker = Arc::new(());
        let mut reclaimer = DeferredReclaimer::new();
        reclaimer.register_deferred_release(Reclaimable::object("marker", marker.clone()), Epoch::new(1));
        assert_eq!(Arc::strong_count(&marker), 2);

        drop(reclaimer.retire(Epoch::new(1)));
        assert_eq!(Arc::strong_count(&marker), 1);
    }
}
