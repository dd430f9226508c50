use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures::future::{AbortHandle, Abortable, Aborted};
use parking_lot::Mutex;

use oxy_render_interface::phase_error::PhaseError;

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    next_id: AtomicU64,
    /// 正在等待的 awaitable
    pending: Mutex<Vec<(u64, AbortHandle)>>,
}

/// 关闭引擎时的取消信号
///
/// clone 之后共享同一个信号。`cancel` 之后所有通过 `run` 等待的 future 立即返回
/// `OperationCancelled`，之后再调用 `run` 也会直接返回。
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let pending = std::mem::take(&mut *self.inner.pending.lock());
        log::debug!("cancellation requested, aborting {} pending awaitables", pending.len());
        for (_, handle) in pending {
            handle.abort();
        }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// 可以被取消地等待 `fut`
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, PhaseError> {
        if self.is_cancelled() {
            return Err(PhaseError::cancelled());
        }

        let (handle, registration) = AbortHandle::new_pair();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.pending.lock().push((id, handle));
        // 注册和 cancel 之间的竞争
        if self.is_cancelled() {
            self.inner.pending.lock().retain(|(i, _)| *i != id);
            return Err(PhaseError::cancelled());
        }

        let result = Abortable::new(fut, registration).await;
        self.inner.pending.lock().retain(|(i, _)| *i != id);
        result.map_err(|Aborted| PhaseError::cancelled())
    }

    /// 正在等待的 awaitable 数量
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::LocalPool;
    use futures::task::LocalSpawnExt;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_run_completes() {
        let token = CancellationToken::new();
        let value = futures::executor::block_on(token.run(async { 7 }));
        assert_eq!(value, Ok(7));
        assert_eq!(token.pending_count(), 0);
    }

    #[test]
    fn test_cancel_pending() {
        let token = CancellationToken::new();
        let result = Rc::new(RefCell::new(None));

        let mut pool = LocalPool::new();
        {
            let token = token.clone();
            let result = result.clone();
            pool.spawner()
                .spawn_local(async move {
                    let r = token.run(futures::future::pending::<()>()).await;
                    *result.borrow_mut() = Some(r);
                })
                .unwrap();
        }
        pool.run_until_stalled();
        assert_eq!(token.pending_count(), 1);
        assert!(result.borrow().is_none());

        token.cancel();
        pool.run_until_stalled();
        let r = result.borrow_mut().take().unwrap();
        assert!(r.unwrap_err().is_cancelled());

        // 取消之后的等待直接返回
        let late = futures::executor::block_on(token.run(async {}));
        assert!(late.unwrap_err().is_cancelled());
    }
}
