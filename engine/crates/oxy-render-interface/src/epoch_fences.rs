use std::collections::VecDeque;

use oxy_gfx::fence::FenceValue;
use oxy_gfx::queue::QueueKey;

use crate::epoch::Epoch;

/// 每个 epoch 在各个队列上 signal 的最后一个 fence 值
///
/// 用于把队列的完成值映射回 GPU 已完成的 epoch。
/// 没有任何提交的 epoch 在它前面的 epoch 都完成后即视为完成。
#[derive(Default)]
pub struct EpochFenceTable {
    entries: VecDeque<(Epoch, Vec<(QueueKey, FenceValue)>)>,
}

// new & init
impl EpochFenceTable {
    pub fn new() -> Self {
        Self::default()
    }
}

// update
impl EpochFenceTable {
    /// 记录 epoch 在某个队列上 signal 的 fence 值，同一个队列只保留最大值
    pub fn record(&mut self, epoch: Epoch, queue: &QueueKey, value: FenceValue) {
        if !value.is_valid() {
            return;
        }

        let fences = match self.entries.iter_mut().rev().find(|(e, _)| *e == epoch) {
            Some((_, fences)) => fences,
            None => {
                debug_assert!(
                    self.entries.back().is_none_or(|(last, _)| *last < epoch),
                    "fence recorded for an old epoch {epoch}"
                );
                self.entries.push_back((epoch, Vec::new()));
                let Some((_, fences)) = self.entries.back_mut() else {
                    return;
                };
                fences
            }
        };

        match fences.iter_mut().find(|(key, _)| key == queue) {
            Some((_, existing)) => *existing = (*existing).max(value),
            None => fences.push((queue.clone(), value)),
        }
    }

    /// 计算 GPU 已经完成的最大 epoch，并丢弃已完成的记录
    ///
    /// `completed_of` 返回某个队列当前的完成值。
    /// 第一个仍有未完成 fence 的 epoch 之前的那个 epoch 即为结果；全部完成时返回 `submitted`。
    pub fn resolve_completed(&mut self, submitted: Epoch, completed_of: impl Fn(&QueueKey) -> FenceValue) -> Epoch {
        let _span = tracy_client::span!("EpochFenceTable::resolve_completed");

        while let Some((epoch, fences)) = self.entries.front() {
            if *epoch > submitted {
                break;
            }
            let done = fences.iter().all(|(key, value)| completed_of(key) >= *value);
            if !done {
                return epoch.prev();
            }
            self.entries.pop_front();
        }
        submitted
    }
}

// getters
impl EpochFenceTable {
    /// epoch 在某个队列上 signal 的 fence 值
    pub fn fence_of(&self, epoch: Epoch, queue: &QueueKey) -> FenceValue {
        self.entries
            .iter()
            .find(|(e, _)| *e == epoch)
            .and_then(|(_, fences)| fences.iter().find(|(key, _)| key == queue))
            .map_or(FenceValue::INVALID, |(_, value)| *value)
    }

    #[inline]
    pub fn pending_epochs(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_resolve_in_order() {
        let gfx = QueueKey::new("gfx");
        let copy = QueueKey::new("copy");

        let mut table = EpochFenceTable::new();
        table.record(Epoch::new(1), &gfx, FenceValue::new(1));
        table.record(Epoch::new(1), &copy, FenceValue::new(1));
        table.record(Epoch::new(2), &gfx, FenceValue::new(2));
        table.record(Epoch::new(3), &gfx, FenceValue::new(3));
        assert_eq!(table.fence_of(Epoch::new(1), &copy), FenceValue::new(1));

        let mut completed = HashMap::new();
        completed.insert(gfx.clone(), FenceValue::new(2));
        completed.insert(copy.clone(), FenceValue::ZERO);
        let lookup = |completed: &HashMap<QueueKey, FenceValue>, key: &QueueKey| completed[key];

        // copy 队列还没完成，epoch 1 阻塞后面所有 epoch
        let epoch = table.resolve_completed(Epoch::new(3), |key| lookup(&completed, key));
        assert_eq!(epoch, Epoch::ZERO);

        completed.insert(copy.clone(), FenceValue::new(1));
        let epoch = table.resolve_completed(Epoch::new(3), |key| lookup(&completed, key));
        assert_eq!(epoch, Epoch::new(2));
        assert_eq!(table.pending_epochs(), 1);
    }

    #[test]
    fn test_epoch_without_submissions_completes() {
        let gfx = QueueKey::new("gfx");
        let mut table = EpochFenceTable::new();
        table.record(Epoch::new(1), &gfx, FenceValue::new(1));
        // epoch 2 没有提交
        let epoch = table.resolve_completed(Epoch::new(2), |_| FenceValue::new(1));
        assert_eq!(epoch, Epoch::new(2));
    }

    #[test]
    fn test_keeps_max_per_queue() {
        let gfx = QueueKey::new("gfx");
        let mut table = EpochFenceTable::new();
        table.record(Epoch::new(4), &gfx, FenceValue::new(7));
        table.record(Epoch::new(4), &gfx, FenceValue::new(5));
        table.record(Epoch::new(4), &gfx, FenceValue::INVALID);
        assert_eq!(table.fence_of(Epoch::new(4), &gfx), FenceValue::new(7));
    }
}
