use std::time::Duration;

/// 一帧中 fixed update 的执行计划
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FixedStepPlan {
    pub steps: u32,
    /// 超出上限被丢弃的时间，为零表示没有丢弃
    pub dropped: Duration,
}

/// 固定步长累加器
///
/// 每帧的 fixed update 总时长不超过 `max_duration`，多出来的整步被丢弃，
/// 不足一步的余量留到下一帧。
#[derive(Clone, Debug)]
pub struct FixedTimestep {
    step: Duration,
    max_steps: u32,
    accumulator: Duration,
}

// new & init
impl FixedTimestep {
    /// `step` 必须大于零，由配置校验保证
    pub fn new(step: Duration, max_duration: Duration) -> Self {
        debug_assert!(!step.is_zero());
        let step = step.max(Duration::from_nanos(1));
        Self {
            step,
            max_steps: saturating_steps(max_duration, step),
            accumulator: Duration::ZERO,
        }
    }
}

// update
impl FixedTimestep {
    pub fn advance(&mut self, delta: Duration) -> FixedStepPlan {
        self.accumulator += delta;

        let available = saturating_steps(self.accumulator, self.step);
        let steps = available.min(self.max_steps);
        self.accumulator -= self.step * steps;

        let mut dropped = Duration::ZERO;
        if available > steps {
            dropped = self.step * (available - steps);
            self.accumulator -= dropped;
        }
        FixedStepPlan { steps, dropped }
    }

    pub fn reset(&mut self) {
        self.accumulator = Duration::ZERO;
    }
}

// getters
impl FixedTimestep {
    #[inline]
    pub fn step(&self) -> Duration {
        self.step
    }

    #[inline]
    pub fn max_steps(&self) -> u32 {
        self.max_steps
    }

    /// 不足一步的剩余时间
    #[inline]
    pub fn accumulator(&self) -> Duration {
        self.accumulator
    }
}

fn saturating_steps(duration: Duration, step: Duration) -> u32 {
    u32::try_from(duration.as_nanos() / step.as_nanos()).unwrap_or(u32::MAX)
}
