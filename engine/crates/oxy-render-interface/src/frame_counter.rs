use std::fmt;

use crate::epoch::Epoch;

/// frames in flight 的标签
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameLabel {
    A,
    B,
    C,
}

impl FrameLabel {
    #[inline]
    pub fn from_usize(index: usize) -> Self {
        match index % 3 {
            0 => FrameLabel::A,
            1 => FrameLabel::B,
            _ => FrameLabel::C,
        }
    }
}

impl fmt::Display for FrameLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FrameLabel::A => "A",
            FrameLabel::B => "B",
            FrameLabel::C => "C",
        };
        f.write_str(label)
    }
}

/// 帧计数以及提交、完成的 epoch
///
/// 始终满足 `completed <= submitted <= current`，且三者单调不减。
pub struct FrameCounter {
    /// 当前帧的 epoch，一直累加
    current: Epoch,
    submitted: Epoch,
    completed: Epoch,
    frame_limit: f32,
}

// new & init
impl FrameCounter {
    pub fn new(frame_limit: f32) -> Self {
        Self {
            current: Epoch::ZERO,
            submitted: Epoch::ZERO,
            completed: Epoch::ZERO,
            frame_limit,
        }
    }
}

// update
impl FrameCounter {
    /// 进入下一帧
    #[inline]
    pub fn begin_frame(&mut self) -> Epoch {
        self.current = self.current.next();
        self.current
    }

    /// 当前帧的工作已经全部交给队列（失败的帧也会被标记，没有工作的帧可以直接完成）
    pub fn mark_submitted(&mut self, epoch: Epoch) {
        debug_assert!(epoch <= self.current, "submitted {} beyond current {}", epoch, self.current);
        self.submitted = self.submitted.max(epoch.min(self.current));
    }

    /// 更新 GPU 完成的 epoch，超出 submitted 的部分会被截断
    pub fn set_completed(&mut self, epoch: Epoch) {
        if epoch > self.submitted {
            log::warn!("completed epoch {} beyond submitted {}, clamped", epoch, self.submitted);
        }
        self.completed = self.completed.max(epoch.min(self.submitted));
    }
}

// getters
impl FrameCounter {
    const FIF_COUNT: usize = 3;

    #[inline]
    pub fn current_epoch(&self) -> Epoch {
        self.current
    }

    #[inline]
    pub fn submitted_epoch(&self) -> Epoch {
        self.submitted
    }

    #[inline]
    pub fn completed_epoch(&self) -> Epoch {
        self.completed
    }

    #[inline]
    pub fn frame_limit(&self) -> f32 {
        self.frame_limit
    }

    #[inline]
    pub const fn fif_count() -> usize {
        Self::FIF_COUNT
    }

    #[inline]
    pub const fn frame_labels() -> [FrameLabel; Self::FIF_COUNT] {
        [FrameLabel::A, FrameLabel::B, FrameLabel::C]
    }

    #[inline]
    pub fn frame_label(&self) -> FrameLabel {
        FrameLabel::from_usize(self.current.value() as usize % Self::fif_count())
    }

    #[inline]
    pub fn frame_name(&self) -> String {
        format!("[F{}{}]", self.current.value(), self.frame_label())
    }

    /// 已提交但 GPU 尚未完成的帧数
    #[inline]
    pub fn frames_in_flight(&self) -> u64 {
        self.submitted.value() - self.completed.value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epochs_monotonic() {
        let mut counter = FrameCounter::new(60.0);
        let e1 = counter.begin_frame();
        assert_eq!(e1, Epoch::new(1));
        counter.mark_submitted(e1);

        // 回退的值不会生效
        counter.set_completed(e1);
        counter.set_completed(Epoch::ZERO);
        assert_eq!(counter.completed_epoch(), e1);

        let e2 = counter.begin_frame();
        counter.mark_submitted(e2);
        counter.mark_submitted(e1);
        assert_eq!(counter.submitted_epoch(), e2);
        assert_eq!(counter.frames_in_flight(), 1);
    }

    #[test]
    fn test_completed_clamped_to_submitted() {
        let mut counter = FrameCounter::new(60.0);
        counter.begin_frame();
        counter.begin_frame();
        counter.mark_submitted(Epoch::new(1));
        counter.set_completed(Epoch::new(2));
        assert_eq!(counter.completed_epoch(), Epoch::new(1));
        assert!(counter.completed_epoch() <= counter.submitted_epoch());
    }

    #[test]
    fn test_frame_label_rotates() {
        let mut counter = FrameCounter::new(60.0);
        counter.begin_frame();
        assert_eq!(counter.frame_label(), FrameLabel::B);
        assert_eq!(counter.frame_name(), "[F1B]");
        counter.begin_frame();
        counter.begin_frame();
        assert_eq!(counter.frame_label(), FrameLabel::A);
    }
}
