use crate::commands::command_list::CommandList;
use crate::fence::FenceValue;
use crate::queue::QueueKey;

/// 一次队列提交
///
/// 提交完成后队列 signal 一个新的 fence 值；`waits` 是跨队列的依赖，
/// 生产者队列 signal V，消费者队列在读取之前等待 V。
pub struct GfxSubmitInfo {
    pub command_lists: Vec<CommandList>,
    pub waits: Vec<(QueueKey, FenceValue)>,
}

impl GfxSubmitInfo {
    #[inline]
    pub fn new(command_lists: Vec<CommandList>) -> Self {
        Self {
            command_lists,
            waits: Vec::new(),
        }
    }

    /// 等待另一个队列的 fence 值，同一个队列只保留最大的值
    #[inline]
    pub fn wait(mut self, queue: QueueKey, value: FenceValue) -> Self {
        if !value.is_valid() {
            return self;
        }
        match self.waits.iter_mut().find(|(key, _)| *key == queue) {
            Some((_, existing)) => *existing = (*existing).max(value),
            None => self.waits.push((queue, value)),
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_waits_keep_max_per_queue() {
        let info = GfxSubmitInfo::new(Vec::new())
            .wait(QueueKey::new("copy"), FenceValue::new(3))
            .wait(QueueKey::new("copy"), FenceValue::new(2))
            .wait(QueueKey::new("compute"), FenceValue::new(1))
            .wait(QueueKey::new("copy"), FenceValue::INVALID);
        assert_eq!(
            info.waits,
            vec![(QueueKey::new("copy"), FenceValue::new(3)), (QueueKey::new("compute"), FenceValue::new(1))]
        );
    }
}
