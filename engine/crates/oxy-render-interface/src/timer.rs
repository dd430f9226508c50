use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;

/// 帧计时器
pub struct Timer {
    clock: Arc<dyn Clock>,
    start_time: Duration,
    last_tick: Duration,
    delta: Duration,
    total_frame: u64,
}

// new & init
impl Timer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            clock,
            start_time: now,
            last_tick: now,
            delta: Duration::ZERO,
            total_frame: 0,
        }
    }

    pub fn reset(&mut self) {
        let now = self.clock.now();
        self.start_time = now;
        self.last_tick = now;
        self.delta = Duration::ZERO;
        self.total_frame = 0;
    }
}

// update
impl Timer {
    /// 进入新的一帧，返回和上一帧的间隔
    pub fn tick(&mut self) -> Duration {
        let now = self.clock.now();
        self.delta = now.saturating_sub(self.last_tick);
        self.last_tick = now;
        self.total_frame += 1;
        self.delta
    }
}

// getters
impl Timer {
    #[inline]
    pub fn delta_time(&self) -> Duration {
        self.delta
    }

    #[inline]
    pub fn delta_time_s(&self) -> f32 {
        self.delta.as_secs_f32()
    }

    #[inline]
    pub fn total_time(&self) -> Duration {
        self.clock.now().saturating_sub(self.start_time)
    }

    #[inline]
    pub fn total_frame(&self) -> u64 {
        self.total_frame
    }

    #[inline]
    pub fn fps(&self) -> f32 {
        if self.delta.is_zero() { 0.0 } else { 1.0 / self.delta.as_secs_f32() }
    }

    #[inline]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}
