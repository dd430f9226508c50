use std::sync::{Arc, Weak};
use std::time::Duration;

use indexmap::IndexMap;

use oxy_gfx::commands::pool::CommandListPools;
use oxy_gfx::device::{GfxDevice, GfxQueue};
use oxy_gfx::error::{GfxError, GfxResult};
use oxy_gfx::fence::{FenceValue, FenceWait};
use oxy_gfx::queue::{QueueKey, QueueRole, QueueStrategy};
use oxy_render_interface::bindless_manager::BindlessManager;
use oxy_render_interface::descriptor::DescriptorAllocator;
use oxy_render_interface::epoch::Epoch;
use oxy_render_interface::epoch_fences::EpochFenceTable;
use oxy_render_interface::frame_counter::FrameCounter;
use oxy_render_interface::phase_error::PhaseError;
use oxy_render_interface::reclaimer::{DeferredReclaimer, Reclaimable};
use oxy_render_interface::state_tracker::ResourceStateTracker;

use crate::cancellation::CancellationToken;
use crate::engine::EngineShared;

/// 帧在 GPU 上的生命周期
///
/// 持有设备、队列以及只在渲染线程上访问的共享状态：descriptor 分配器、
/// 资源状态追踪、延迟回收器和 command list 池。
/// 每帧开始时等待 frames in flight 降到上限以下并回收，结束时记录提交的 epoch。
pub struct GraphicsLayer {
    pub device: Arc<dyn GfxDevice>,
    pub strategy: QueueStrategy,

    pub frame_counter: FrameCounter,
    pub epoch_fences: EpochFenceTable,
    pub reclaimer: DeferredReclaimer,
    pub descriptors: DescriptorAllocator,
    pub bindless: BindlessManager,
    pub tracker: ResourceStateTracker,
    pub pools: CommandListPools,

    /// 等待 fence 的超时，None 表示一直等待
    pub fence_timeout: Option<Duration>,

    queues: IndexMap<QueueKey, Arc<dyn GfxQueue>>,

    /// 设备丢失时通知引擎关闭
    engine: Weak<EngineShared>,
}

// new & init
impl GraphicsLayer {
    pub fn new(
        device: Arc<dyn GfxDevice>,
        strategy: QueueStrategy,
        frame_limit: f32,
        fence_timeout: Option<Duration>,
    ) -> Result<Self, PhaseError> {
        let mut queues = IndexMap::new();
        for key in strategy.unique_keys() {
            let queue = device.queue(&key)?;
            queues.insert(key, queue);
        }
        log::info!(
            "graphics layer on device \"{}\", queues: [{}]",
            device.name(),
            queues.keys().map(QueueKey::as_str).collect::<Vec<_>>().join(", ")
        );

        Ok(Self {
            device,
            strategy,
            frame_counter: FrameCounter::new(frame_limit),
            epoch_fences: EpochFenceTable::new(),
            reclaimer: DeferredReclaimer::new(),
            descriptors: DescriptorAllocator::new(),
            bindless: BindlessManager::new(),
            tracker: ResourceStateTracker::new(),
            pools: CommandListPools::new(),
            fence_timeout,
            queues,
            engine: Weak::new(),
        })
    }

    pub(crate) fn attach_engine(&mut self, engine: &Arc<EngineShared>) {
        self.engine = Arc::downgrade(engine);
    }
}

// getters
impl GraphicsLayer {
    pub fn queue(&self, key: &QueueKey) -> Result<&Arc<dyn GfxQueue>, PhaseError> {
        self.queues.get(key).ok_or_else(|| GfxError::QueueNotFound(key.to_string()).into())
    }

    #[inline]
    pub fn queue_for(&self, role: QueueRole) -> Result<&Arc<dyn GfxQueue>, PhaseError> {
        self.queue(self.strategy.key_for(role))
    }

    #[inline]
    pub fn current_epoch(&self) -> Epoch {
        self.frame_counter.current_epoch()
    }

    #[inline]
    pub fn completed_epoch(&self) -> Epoch {
        self.frame_counter.completed_epoch()
    }

    #[inline]
    pub fn submitted_epoch(&self) -> Epoch {
        self.frame_counter.submitted_epoch()
    }
}

// phase call
impl GraphicsLayer {
    /// 进入新的一帧
    ///
    /// frames in flight 达到上限时等待最早那一帧完成，等待可以被 `cancel` 打断。
    pub async fn begin_frame(&mut self, cancel: &CancellationToken) -> Result<Epoch, PhaseError> {
        self.retire();
        while self.frame_counter.frames_in_flight() >= FrameCounter::fif_count() as u64 {
            let oldest = self.frame_counter.completed_epoch().next();
            log::trace!("frames in flight at limit, waiting for {}", oldest);
            self.wait_epoch(oldest, cancel).await?;
            self.retire();
        }

        Ok(self.frame_counter.begin_frame())
    }

    /// 当前帧在 `key` 队列上的最后一次提交
    pub fn record_submission(&mut self, key: &QueueKey, fence: FenceValue) {
        let epoch = self.frame_counter.current_epoch();
        log::trace!("{} submitted {} on {}", epoch, fence, key);
        self.epoch_fences.record(epoch, key, fence);
    }

    pub fn present(&self) -> Result<(), PhaseError> {
        let _span = tracy_client::span!("GraphicsLayer::present");
        let result = self.queue_for(QueueRole::Present)?.present();
        self.check(result)
    }

    /// 当前帧结束：失败的帧同样标记为已提交，保证 epoch 继续推进
    pub fn end_frame(&mut self) {
        let _span = tracy_client::span!("GraphicsLayer::end_frame");

        let epoch = self.frame_counter.current_epoch();
        self.frame_counter.mark_submitted(epoch);
        let flushed = self.descriptors.flush_releases(&mut self.reclaimer, epoch);
        if flushed > 0 {
            log::debug!("{} descriptor slots deferred at {}", flushed, epoch);
        }
        self.retire();
    }

    /// 推进 completed epoch，释放已经完成的对象，回收 command list
    ///
    /// 返回本次释放的对象数量
    pub fn retire(&mut self) -> usize {
        let _span = tracy_client::span!("GraphicsLayer::retire");

        let submitted = self.frame_counter.submitted_epoch();
        let queues = &self.queues;
        let completed = self.epoch_fences.resolve_completed(submitted, |key| {
            queues.get(key).map_or(FenceValue::INVALID, |queue| queue.completed_value())
        });
        self.frame_counter.set_completed(completed);

        let retired = self.reclaimer.retire(self.frame_counter.completed_epoch());
        let count = retired.len();
        self.release(retired);

        for queue in self.queues.values() {
            for list in queue.collect_retired() {
                if let Err(err) = self.pools.recycle(list) {
                    log::error!("failed to recycle command list: {}", err);
                }
            }
        }
        count
    }

    /// 阻塞等待所有队列空闲
    pub fn wait_idle(&mut self) -> Result<(), PhaseError> {
        let _span = tracy_client::span!("GraphicsLayer::wait_idle");
        for queue in self.queues.values() {
            let result = queue.wait_cpu(queue.last_submitted_value(), self.fence_timeout);
            self.check(result)?;
        }
        self.retire();
        Ok(())
    }
}

// tools
impl GraphicsLayer {
    /// 等待 `epoch` 在所有队列上的 fence
    async fn wait_epoch(&self, epoch: Epoch, cancel: &CancellationToken) -> Result<(), PhaseError> {
        for (key, queue) in &self.queues {
            let value = self.epoch_fences.fence_of(epoch, key);
            if !value.is_valid() {
                continue;
            }
            let result = cancel.run(FenceWait::new(queue.clone(), value, self.fence_timeout)).await?;
            self.check(result)?;
        }
        Ok(())
    }

    fn release(&mut self, retired: Vec<Reclaimable>) {
        for item in retired {
            match item {
                Reclaimable::Descriptor(slot) => {
                    if let Err(err) = self.descriptors.free_retired(slot) {
                        log::error!("failed to free descriptor: {}", err);
                    }
                }
                other => {
                    log::trace!("release {}", other.label());
                    drop(other);
                }
            }
        }
    }

    /// 设备丢失时请求引擎关闭
    pub fn check<T>(&self, result: GfxResult<T>) -> Result<T, PhaseError> {
        result.map_err(|err| {
            if err.is_fatal() {
                log::error!("device \"{}\" lost", self.device.name());
                if let Some(engine) = self.engine.upgrade() {
                    engine.request_shutdown();
                }
            }
            err.into()
        })
    }
}

// destroy
impl GraphicsLayer {
    /// 等待 GPU 空闲后释放所有延迟回收的对象
    pub fn destroy(&mut self) {
        if let Err(err) = self.wait_idle() {
            log::error!("wait idle failed during destroy: {}", err);
        }

        self.bindless = BindlessManager::new();
        let epoch = self.frame_counter.current_epoch();
        self.frame_counter.mark_submitted(epoch);
        self.descriptors.flush_releases(&mut self.reclaimer, epoch);

        let remaining = self.reclaimer.drain_all();
        log::info!("graphics layer destroyed, {} objects released", remaining.len());
        self.release(remaining);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use oxy_gfx::commands::submit_info::GfxSubmitInfo;
    use oxy_gfx::headless::{CompletionMode, HeadlessDevice};
    use oxy_render_interface::descriptor::DescriptorDomain;

    fn layer(device: &Arc<HeadlessDevice>) -> GraphicsLayer {
        GraphicsLayer::new(device.clone(), QueueStrategy::single_queue("gfx"), 0.0, None).unwrap()
    }

    fn submit_empty(layer: &mut GraphicsLayer) -> FenceValue {
        let key = QueueKey::new("gfx");
        let list = layer.pools.pool_mut(QueueRole::Graphics).recorder("frame").unwrap().finish().unwrap();
        let fence = layer.queue(&key).unwrap().submit(GfxSubmitInfo::new(vec![list])).unwrap();
        layer.record_submission(&key, fence);
        fence
    }

    #[test]
    fn test_completed_epoch_follows_fences() {
        let device = HeadlessDevice::new(&[QueueKey::new("gfx")]);
        let queue = device.headless_queue(&QueueKey::new("gfx")).unwrap();
        queue.set_completion_mode(CompletionMode::Manual);
        let mut layer = layer(&device);
        let cancel = CancellationToken::new();

        let e1 = block_on(layer.begin_frame(&cancel)).unwrap();
        let f1 = submit_empty(&mut layer);
        layer.end_frame();
        assert_eq!(layer.submitted_epoch(), e1);
        assert_eq!(layer.completed_epoch(), Epoch::ZERO);

        // 没有提交的帧在前一帧完成后就完成
        let e2 = block_on(layer.begin_frame(&cancel)).unwrap();
        layer.end_frame();
        assert_eq!(layer.completed_epoch(), Epoch::ZERO);

        queue.complete_up_to(f1);
        layer.retire();
        assert_eq!(layer.completed_epoch(), e2);
        assert!(layer.completed_epoch() <= layer.submitted_epoch());
    }

    #[test]
    fn test_descriptor_release_waits_for_gpu() {
        let device = HeadlessDevice::new(&[QueueKey::new("gfx")]);
        let queue = device.headless_queue(&QueueKey::new("gfx")).unwrap();
        queue.set_completion_mode(CompletionMode::Manual);
        let mut layer = layer(&device);
        let cancel = CancellationToken::new();

        block_on(layer.begin_frame(&cancel)).unwrap();
        let handle = layer.descriptors.allocate(DescriptorDomain::Samplers).unwrap();
        let fence = submit_empty(&mut layer);
        drop(handle);
        layer.end_frame();
        assert_eq!(layer.descriptors.stats(DescriptorDomain::Samplers).pending_release, 1);
        assert_eq!(layer.reclaimer.pending_count(), 1);

        queue.complete_up_to(fence);
        assert_eq!(layer.retire(), 1);
        assert_eq!(layer.descriptors.stats(DescriptorDomain::Samplers).allocated, 0);
        // command list 回到池中
        assert_eq!(layer.pools.pool(QueueRole::Graphics).free_count(), 1);
    }

    #[test]
    fn test_throttle_at_frames_in_flight_limit() {
        let device = HeadlessDevice::new(&[QueueKey::new("gfx")]);
        let queue = device.headless_queue(&QueueKey::new("gfx")).unwrap();
        queue.set_completion_mode(CompletionMode::Stalled);
        let mut layer = layer(&device);
        layer.fence_timeout = Some(Duration::from_millis(5));
        let cancel = CancellationToken::new();

        for _ in 0..FrameCounter::fif_count() {
            block_on(layer.begin_frame(&cancel)).unwrap();
            submit_empty(&mut layer);
            layer.end_frame();
        }
        assert_eq!(layer.frame_counter.frames_in_flight(), 3);

        let err = block_on(layer.begin_frame(&cancel)).unwrap_err();
        assert_eq!(err.class(), oxy_render_interface::phase_error::ErrorClass::Transient);

        queue.complete_all();
        let epoch = block_on(layer.begin_frame(&cancel)).unwrap();
        assert_eq!(epoch, Epoch::new(4));
        assert_eq!(layer.completed_epoch(), Epoch::new(3));
    }

    #[test]
    fn test_device_lost_is_fatal() {
        let device = HeadlessDevice::new(&[QueueKey::new("gfx")]);
        let layer = layer(&device);
        device.set_lost();
        let err = layer.present().unwrap_err();
        assert!(err.is_fatal_to_engine());
    }
}
