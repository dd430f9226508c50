use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::device::GfxQueue;
use crate::error::{GfxError, GfxResult};

/// 每个队列单调递增的 fence 值
///
/// `u64::MAX` 是无效值。
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FenceValue(u64);

impl FenceValue {
    pub const INVALID: FenceValue = FenceValue(u64::MAX);
    /// 队列创建时的初始值，视为已完成
    pub const ZERO: FenceValue = FenceValue(0);

    #[inline]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != u64::MAX
    }

    #[inline]
    pub fn next(self) -> Self {
        debug_assert!(self.is_valid());
        Self(self.0 + 1)
    }
}

impl Default for FenceValue {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Debug for FenceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() { write!(f, "Fence({})", self.0) } else { f.write_str("Fence(INVALID)") }
    }
}

impl fmt::Display for FenceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// 等待某个队列到达指定 fence 值的 awaitable
///
/// 未完成时把 waker 注册到队列上，fence 完成或者设备丢失时由队列唤醒。
/// 有超时的等待另外启动一个计时线程，到期时唤醒一次。
/// INVALID 视为没有需要等待的工作。
pub struct FenceWait {
    queue: Arc<dyn GfxQueue>,
    value: FenceValue,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    /// 计时线程到期时唤醒的 waker，每次 poll 更新
    timer: Option<Arc<Mutex<Waker>>>,
}

impl FenceWait {
    pub fn new(queue: Arc<dyn GfxQueue>, value: FenceValue, timeout: Option<Duration>) -> Self {
        Self {
            queue,
            value,
            timeout,
            deadline: None,
            timer: None,
        }
    }

    #[inline]
    pub fn value(&self) -> FenceValue {
        self.value
    }
}

impl Future for FenceWait {
    type Output = GfxResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if !self.value.is_valid() || self.queue.completed_value() >= self.value {
            return Poll::Ready(Ok(()));
        }
        if self.queue.is_lost() {
            return Poll::Ready(Err(GfxError::DeviceLost));
        }

        let now = Instant::now();
        let timeout = self.timeout;
        let deadline = *self.deadline.get_or_insert_with(|| timeout.map_or(now, |t| now + t));
        if timeout.is_some() && now >= deadline {
            return Poll::Ready(Err(GfxError::FenceWaitTimeout {
                queue: self.queue.key().to_string(),
                value: self.value.value(),
            }));
        }

        self.queue.register_waker(self.value, cx.waker().clone());
        if timeout.is_some() {
            self.arm_timer(deadline - now, cx.waker());
        }
        Poll::Pending
    }
}

// tools
impl FenceWait {
    fn arm_timer(&mut self, remaining: Duration, waker: &Waker) {
        if let Some(timer) = &self.timer {
            let mut current = timer.lock();
            if !current.will_wake(waker) {
                *current = waker.clone();
            }
            return;
        }

        let shared = Arc::new(Mutex::new(waker.clone()));
        let timer = shared.clone();
        let spawned = std::thread::Builder::new().name("fence-timeout".to_string()).spawn(move || {
            std::thread::sleep(remaining);
            timer.lock().wake_by_ref();
        });
        match spawned {
            Ok(_) => self.timer = Some(shared),
            Err(e) => {
                // 没有计时线程时退化为轮询
                log::warn!("failed to spawn fence timer: {}", e);
                waker.wake_by_ref();
            }
        }
    }
}
