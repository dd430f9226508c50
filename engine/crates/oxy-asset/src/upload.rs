//! 上传协调器
//!
//! 收集一帧内的 CPU -> GPU 上传请求，在 CommandRecord 阶段作为一个批次录制到 transfer 队列：
//! 先把目标转换到 COPY_DST，录制所有拷贝，再转换到最终状态，提交后 signal 一个 fence 值。
//! 完成计数在观察到 fence 完成时才更新。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use thiserror::Error;

use oxy_gfx::commands::barrier::GfxBarrier;
use oxy_gfx::commands::command::GfxCommand;
use oxy_gfx::commands::command_list::CommandList;
use oxy_gfx::commands::pool::CommandListPool;
use oxy_gfx::commands::submit_info::GfxSubmitInfo;
use oxy_gfx::device::{GfxDevice, GfxQueue};
use oxy_gfx::error::{GfxError, InvalidStateError};
use oxy_gfx::fence::{FenceValue, FenceWait};
use oxy_gfx::queue::{QueueKey, QueueRole, QueueStrategy};
use oxy_gfx::resource_state::ResourceState;
use oxy_gfx::resources::{GfxBuffer, GfxTexture, Subresource};
use oxy_render_interface::epoch::Epoch;
use oxy_render_interface::phase_error::{ErrorClass, PhaseError};
use oxy_render_interface::reclaimer::{DeferredReclaimer, Reclaimable};
use oxy_render_interface::state_tracker::{ResourceStateTracker, ResourceUsage, StateTrackerError};

use crate::staging::{AlignmentPolicy, PerRequestStagingAllocator, StagingAllocation, StagingProvider};

/// 提交失败后在同一帧内重试的次数
pub const MAX_SUBMIT_RETRIES: u32 = 2;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    #[error("staging allocation of {requested} bytes failed: {reason}")]
    StagingAllocFailed { requested: u64, reason: String },

    #[error("backing resource \"{0}\" is not ready")]
    BackingResourceNotReady(String),

    #[error("fence wait timed out: queue {queue}, value {value}")]
    FenceWaitTimeout { queue: String, value: u64 },

    #[error("upload \"{label}\" out of bounds: {message}")]
    OutOfBounds { label: String, message: String },

    #[error(transparent)]
    Gfx(GfxError),

    #[error(transparent)]
    StateTracker(#[from] StateTrackerError),
}

impl From<GfxError> for UploadError {
    fn from(err: GfxError) -> Self {
        match err {
            GfxError::FenceWaitTimeout { queue, value } => UploadError::FenceWaitTimeout { queue, value },
            other => UploadError::Gfx(other),
        }
    }
}

impl From<InvalidStateError> for UploadError {
    fn from(err: InvalidStateError) -> Self {
        UploadError::Gfx(GfxError::InvalidState(err))
    }
}

impl From<UploadError> for PhaseError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::Gfx(err) => err.into(),
            UploadError::StagingAllocFailed { .. } | UploadError::FenceWaitTimeout { .. } => {
                PhaseError::with_class(ErrorClass::Transient, err.to_string()).with_source(err)
            }
            other => PhaseError::new(other.to_string()).with_source(other),
        }
    }
}

/// 上传策略
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadPolicy {
    pub queue_key: QueueKey,
    pub alignment: AlignmentPolicy,
    /// 等待 fence 的默认超时
    pub timeout: Option<Duration>,
}

impl UploadPolicy {
    pub fn new(queue_key: impl Into<QueueKey>) -> Self {
        Self {
            queue_key: queue_key.into(),
            alignment: AlignmentPolicy::default(),
            timeout: None,
        }
    }

    /// 使用队列策略中 Transfer 角色对应的队列
    pub fn from_strategy(strategy: &QueueStrategy) -> Self {
        Self::new(strategy.key_for(QueueRole::Transfer).clone())
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Clone, Debug)]
pub enum UploadTarget {
    Buffer { target: Weak<GfxBuffer>, offset: u64 },
    Texture { target: Weak<GfxTexture>, subresource: Subresource },
}

/// 一个上传请求
///
/// 目标资源以弱引用持有，资源在批次录制前被释放时请求失败。
#[derive(Clone, Debug)]
pub struct UploadRequest {
    pub label: String,
    pub target: UploadTarget,
    /// 纹理数据按紧密排列的行给出
    pub data: Vec<u8>,
    /// 请求声明的自然对齐
    pub alignment: u64,
    /// 上传完成后资源所处的状态
    pub final_state: ResourceState,
}

impl UploadRequest {
    pub fn buffer(label: impl Into<String>, target: &Arc<GfxBuffer>, offset: u64, data: Vec<u8>) -> Self {
        Self {
            label: label.into(),
            target: UploadTarget::Buffer {
                target: Arc::downgrade(target),
                offset,
            },
            data,
            alignment: 4,
            final_state: ResourceState::SHADER_RESOURCE,
        }
    }

    pub fn texture(label: impl Into<String>, target: &Arc<GfxTexture>, subresource: Subresource, data: Vec<u8>) -> Self {
        let alignment = target.desc().format.bytes_per_pixel() as u64;
        Self {
            label: label.into(),
            target: UploadTarget::Texture {
                target: Arc::downgrade(target),
                subresource,
            },
            data,
            alignment,
            final_state: ResourceState::SHADER_RESOURCE,
        }
    }

    pub fn with_alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment.max(1);
        self
    }

    pub fn with_final_state(mut self, state: ResourceState) -> Self {
        self.final_state = state;
        self
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn not_ready(&self) -> UploadError {
        UploadError::BackingResourceNotReady(self.label.clone())
    }

    fn out_of_bounds(&self, message: String) -> UploadError {
        UploadError::OutOfBounds {
            label: self.label.clone(),
            message,
        }
    }

    /// 检查目标是否存活、数据是否越界
    fn validate(&self) -> Result<(), UploadError> {
        match &self.target {
            UploadTarget::Buffer { target, offset } => {
                let buffer = target.upgrade().ok_or_else(|| self.not_ready())?;
                let Some(end) = offset.checked_add(self.size()) else {
                    return Err(self.out_of_bounds(format!("offset {} + {} bytes overflows", offset, self.size())));
                };
                if end > buffer.size() {
                    return Err(self.out_of_bounds(format!("[{}, {}) exceeds buffer size {}", offset, end, buffer.size())));
                }
            }
            UploadTarget::Texture { target, subresource } => {
                let texture = target.upgrade().ok_or_else(|| self.not_ready())?;
                let desc = texture.desc();
                if desc.subresource_index(*subresource).is_none() {
                    return Err(self.out_of_bounds(format!(
                        "texture has no mip {} layer {}",
                        subresource.mip, subresource.layer
                    )));
                }
                let (_, height) = desc.mip_extent(subresource.mip);
                let expected = desc.tight_row_bytes(subresource.mip) as u64 * height as u64;
                if self.size() != expected {
                    return Err(self.out_of_bounds(format!("expected {} bytes, got {}", expected, self.size())));
                }
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UploadTicket(u64);

impl UploadTicket {
    #[inline]
    pub fn id(self) -> u64 {
        self.0
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UploadStatus {
    /// 等待下一次 flush
    Queued,
    InFlight { fence: FenceValue },
    Complete { fence: FenceValue, bytes: u64 },
    Failed(UploadError),
}

impl UploadStatus {
    #[inline]
    pub fn is_finished(&self) -> bool {
        matches!(self, UploadStatus::Complete { .. } | UploadStatus::Failed(_))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UploadStats {
    pub submitted: u64,
    pub completed: u64,
    pub in_flight: u64,
    pub bytes_submitted: u64,
    pub bytes_completed: u64,
    pub failed: u64,
}

/// 一次 flush 提交的批次
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadBatch {
    pub queue_key: QueueKey,
    pub fence: FenceValue,
    pub tickets: Vec<UploadTicket>,
    pub bytes: u64,
}

/// flush 需要的渲染线程状态
pub struct UploadContext<'a> {
    pub tracker: &'a mut ResourceStateTracker,
    pub reclaimer: &'a mut DeferredReclaimer,
    pub pool: &'a mut CommandListPool,
    pub epoch: Epoch,
}

struct PreparedCopy {
    ticket: UploadTicket,
    bytes: u64,
    command: GfxCommand,
    copy_usage: ResourceUsage,
    final_usage: ResourceUsage,
    staging: StagingAllocation,
}

struct InFlightBatch {
    fence: FenceValue,
    entries: Vec<(UploadTicket, u64)>,
}

/// 上传协调器
///
/// 只在渲染线程上使用。
pub struct UploadCoordinator {
    device: Arc<dyn GfxDevice>,
    queue: Arc<dyn GfxQueue>,
    policy: UploadPolicy,
    staging: Box<dyn StagingProvider>,

    next_ticket: u64,
    queued: Vec<(UploadTicket, UploadRequest)>,
    in_flight: VecDeque<InFlightBatch>,
    results: HashMap<UploadTicket, UploadStatus>,

    stats: UploadStats,
}

// new & init
impl UploadCoordinator {
    pub fn new(
        device: Arc<dyn GfxDevice>,
        policy: UploadPolicy,
        staging: Box<dyn StagingProvider>,
    ) -> Result<Self, UploadError> {
        let queue = device.queue(&policy.queue_key)?;
        log::info!("upload coordinator on queue {} with {} staging", policy.queue_key, staging.name());
        Ok(Self {
            device,
            queue,
            policy,
            staging,
            next_ticket: 0,
            queued: Vec::new(),
            in_flight: VecDeque::new(),
            results: HashMap::new(),
            stats: UploadStats::default(),
        })
    }

    pub fn with_per_request_staging(device: Arc<dyn GfxDevice>, policy: UploadPolicy) -> Result<Self, UploadError> {
        Self::new(device, policy, Box::new(PerRequestStagingAllocator::default()))
    }
}

// getters
impl UploadCoordinator {
    #[inline]
    pub fn stats(&self) -> UploadStats {
        self.stats
    }

    #[inline]
    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    #[inline]
    pub fn queue_key(&self) -> &QueueKey {
        &self.policy.queue_key
    }

    #[inline]
    pub fn queued_count(&self) -> usize {
        self.queued.len()
    }

    #[inline]
    pub fn result(&self, ticket: UploadTicket) -> Option<&UploadStatus> {
        self.results.get(&ticket)
    }

    /// 取走已经结束的结果
    pub fn take_result(&mut self, ticket: UploadTicket) -> Option<UploadStatus> {
        if self.results.get(&ticket).is_some_and(UploadStatus::is_finished) {
            self.results.remove(&ticket)
        } else {
            None
        }
    }

    /// 最近一个仍在执行的批次的 fence
    pub fn last_in_flight_fence(&self) -> Option<FenceValue> {
        self.in_flight.back().map(|batch| batch.fence)
    }
}

// update
impl UploadCoordinator {
    /// 加入一个上传请求，在下一次 flush 时录制
    ///
    /// 0 字节的请求立即完成，只计入请求数。
    pub fn submit(&mut self, request: UploadRequest) -> UploadTicket {
        let ticket = UploadTicket(self.next_ticket);
        self.next_ticket += 1;

        if request.data.is_empty() {
            self.stats.submitted += 1;
            self.stats.completed += 1;
            self.results.insert(
                ticket,
                UploadStatus::Complete {
                    fence: FenceValue::ZERO,
                    bytes: 0,
                },
            );
            return ticket;
        }

        match request.validate() {
            Ok(()) => {
                self.results.insert(ticket, UploadStatus::Queued);
                self.queued.push((ticket, request));
            }
            Err(e) => {
                log::warn!("upload \"{}\" rejected: {}", request.label, e);
                self.fail(ticket, e);
            }
        }
        ticket
    }

    /// 把排队的请求录制成一个批次并提交
    ///
    /// 单个请求的失败只影响它自己；录制或提交失败时整个批次失败。
    pub fn flush(&mut self, ctx: &mut UploadContext<'_>) -> Result<Option<UploadBatch>, UploadError> {
        let _span = tracy_client::span!("UploadCoordinator::flush");
        if self.queued.is_empty() {
            return Ok(None);
        }

        let queued = std::mem::take(&mut self.queued);
        let mut copies = Vec::with_capacity(queued.len());
        for (ticket, request) in queued {
            match self.prepare(ticket, &request, ctx.tracker) {
                Ok(copy) => copies.push(copy),
                Err(e) => {
                    log::warn!("upload \"{}\" failed: {}", request.label, e);
                    self.fail(ticket, e);
                }
            }
        }
        if copies.is_empty() {
            return Ok(None);
        }

        let fence = match self.submit_batch(ctx, &copies) {
            Ok(fence) => fence,
            Err(e) => {
                log::error!("upload batch of {} requests failed: {}", copies.len(), e);
                for copy in &copies {
                    self.fail(copy.ticket, e.clone());
                }
                return Err(e);
            }
        };

        let bytes: u64 = copies.iter().map(|c| c.bytes).sum();
        let mut entries = Vec::with_capacity(copies.len());
        for copy in copies {
            self.results.insert(copy.ticket, UploadStatus::InFlight { fence });
            entries.push((copy.ticket, copy.bytes));
            // staging 在本帧 epoch 退休后释放
            ctx.reclaimer.register_deferred_release(
                Reclaimable::object(format!("staging for upload #{}", copy.ticket.0), copy.staging),
                ctx.epoch,
            );
        }

        self.stats.submitted += entries.len() as u64;
        self.stats.in_flight += entries.len() as u64;
        self.stats.bytes_submitted += bytes;

        let tickets = entries.iter().map(|(t, _)| *t).collect();
        self.in_flight.push_back(InFlightBatch { fence, entries });
        log::debug!("upload batch submitted on {}: {} bytes, {}", self.policy.queue_key, bytes, fence);

        Ok(Some(UploadBatch {
            queue_key: self.policy.queue_key.clone(),
            fence,
            tickets,
            bytes,
        }))
    }

    /// 检查 fence，更新已经完成的批次
    ///
    /// 返回本次完成的请求数
    pub fn retire(&mut self) -> usize {
        let _span = tracy_client::span!("UploadCoordinator::retire");
        let completed = self.queue.completed_value();

        let mut retired = 0;
        while self.in_flight.front().is_some_and(|batch| batch.fence <= completed) {
            let Some(batch) = self.in_flight.pop_front() else {
                break;
            };
            for (ticket, bytes) in batch.entries {
                self.results.insert(
                    ticket,
                    UploadStatus::Complete {
                        fence: batch.fence,
                        bytes,
                    },
                );
                self.stats.completed += 1;
                self.stats.in_flight -= 1;
                self.stats.bytes_completed += bytes;
                retired += 1;
            }
        }
        retired
    }

    /// 等待 fence 完成，然后更新完成的批次
    ///
    /// `timeout` 为 None 时使用策略中的超时。
    pub async fn wait(&mut self, fence: FenceValue, timeout: Option<Duration>) -> Result<(), UploadError> {
        FenceWait::new(self.queue.clone(), fence, timeout.or(self.policy.timeout)).await?;
        self.retire();
        Ok(())
    }

    /// 阻塞版本的 `wait`
    pub fn wait_blocking(&mut self, fence: FenceValue, timeout: Option<Duration>) -> Result<(), UploadError> {
        self.queue.wait_cpu(fence, timeout.or(self.policy.timeout))?;
        self.retire();
        Ok(())
    }
}

// tools
impl UploadCoordinator {
    fn fail(&mut self, ticket: UploadTicket, err: UploadError) {
        self.stats.failed += 1;
        self.results.insert(ticket, UploadStatus::Failed(err));
    }

    /// 分配 staging、写入数据并生成拷贝命令
    fn prepare(
        &mut self,
        ticket: UploadTicket,
        request: &UploadRequest,
        tracker: &mut ResourceStateTracker,
    ) -> Result<PreparedCopy, UploadError> {
        request.validate()?;
        let copy_alignment = self.device.copy_alignment();

        match &request.target {
            UploadTarget::Buffer { target, offset } => {
                let buffer = target.upgrade().ok_or_else(|| request.not_ready())?;
                let alignment = self.policy.alignment.staging_alignment(request.alignment, copy_alignment, false);
                let staging = self.staging.allocate(self.device.as_ref(), request.size(), alignment, &request.label)?;
                staging.write(&request.data)?;

                if !tracker.is_tracked(buffer.handle()) {
                    tracker.register_buffer(buffer.handle(), ResourceState::COMMON);
                }
                Ok(PreparedCopy {
                    ticket,
                    bytes: request.size(),
                    command: GfxCommand::CopyBuffer {
                        src: staging.buffer().clone(),
                        src_offset: staging.offset(),
                        dst: buffer.clone(),
                        dst_offset: *offset,
                        size: request.size(),
                    },
                    copy_usage: ResourceUsage::whole(buffer.handle(), ResourceState::COPY_DST),
                    final_usage: ResourceUsage::whole(buffer.handle(), request.final_state),
                    staging,
                })
            }
            UploadTarget::Texture { target, subresource } => {
                let texture = target.upgrade().ok_or_else(|| request.not_ready())?;
                let desc = texture.desc();
                let (_, height) = desc.mip_extent(subresource.mip);
                let tight = desc.tight_row_bytes(subresource.mip) as u64;
                let row_pitch = self.policy.alignment.row_pitch(tight);
                let staging_size = row_pitch * (height as u64 - 1) + tight;

                let alignment = self.policy.alignment.staging_alignment(request.alignment, copy_alignment, true);
                let staging = self.staging.allocate(self.device.as_ref(), staging_size, alignment, &request.label)?;
                staging.write_rows(&request.data, tight, row_pitch)?;

                if !tracker.is_tracked(texture.handle()) {
                    tracker.register_texture(texture.handle(), desc, ResourceState::COMMON);
                }
                Ok(PreparedCopy {
                    ticket,
                    bytes: request.size(),
                    command: GfxCommand::CopyBufferToTexture {
                        src: staging.buffer().clone(),
                        src_offset: staging.offset(),
                        row_pitch: row_pitch as u32,
                        dst: texture.clone(),
                        subresource: *subresource,
                    },
                    copy_usage: ResourceUsage::sub(texture.handle(), *subresource, ResourceState::COPY_DST),
                    final_usage: ResourceUsage::sub(texture.handle(), *subresource, request.final_state),
                    staging,
                })
            }
        }
    }

    fn record(
        pool: &mut CommandListPool,
        epoch: Epoch,
        pre: &[GfxBarrier],
        copies: &[PreparedCopy],
        post: &[GfxBarrier],
    ) -> Result<CommandList, UploadError> {
        let mut recorder = pool.recorder(format!("upload-{epoch}"))?;
        if !pre.is_empty() {
            recorder.record(GfxCommand::Barriers(pre.to_vec()))?;
        }
        recorder.with_event("uploads", |rec| {
            copies.iter().try_for_each(|copy| rec.record(copy.command.clone()))
        })?;
        if !post.is_empty() {
            recorder.record(GfxCommand::Barriers(post.to_vec()))?;
        }
        Ok(recorder.finish()?)
    }

    /// 录制并提交，可重试的失败会重新录制后再次提交
    fn submit_batch(&mut self, ctx: &mut UploadContext<'_>, copies: &[PreparedCopy]) -> Result<FenceValue, UploadError> {
        let copy_usages: Vec<_> = copies.iter().map(|c| c.copy_usage).collect();
        let final_usages: Vec<_> = copies.iter().map(|c| c.final_usage).collect();

        // 在副本上模拟，提交成功之后才更新真正的状态
        let mut scratch = ctx.tracker.clone();
        let pre = scratch.plan(&copy_usages)?;
        scratch.commit(&copy_usages)?;
        let post = scratch.plan(&final_usages)?;

        let mut attempt = 0;
        loop {
            let list = Self::record(ctx.pool, ctx.epoch, &pre, copies, &post)?;
            match self.queue.submit(GfxSubmitInfo::new(vec![list])) {
                Ok(fence) => {
                    ctx.tracker.commit(&copy_usages)?;
                    ctx.tracker.commit(&final_usages)?;
                    return Ok(fence);
                }
                Err(e) if e.is_retriable() && attempt < MAX_SUBMIT_RETRIES => {
                    attempt += 1;
                    log::warn!("upload submit failed ({}), retry {}/{}", e, attempt, MAX_SUBMIT_RETRIES);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for UploadCoordinator {
    fn drop(&mut self) {
        if !self.in_flight.is_empty() {
            log::warn!("UploadCoordinator dropped with {} batches in flight", self.in_flight.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use oxy_gfx::headless::{CompletionMode, HeadlessDevice};
    use oxy_gfx::resources::{BufferDesc, BufferUsage, MemoryLocation, TextureDesc, TextureFormat, TextureUsage};

    struct Fixture {
        device: Arc<HeadlessDevice>,
        tracker: ResourceStateTracker,
        reclaimer: DeferredReclaimer,
        pool: CommandListPool,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                device: HeadlessDevice::new(&[QueueKey::new("main")]),
                tracker: ResourceStateTracker::new(),
                reclaimer: DeferredReclaimer::new(),
                pool: CommandListPool::new(QueueRole::Transfer),
            }
        }

        fn coordinator(&self) -> UploadCoordinator {
            let strategy = QueueStrategy::single_queue("main");
            UploadCoordinator::with_per_request_staging(self.device.clone(), UploadPolicy::from_strategy(&strategy))
                .unwrap()
        }

        fn ctx(&mut self, epoch: u64) -> UploadContext<'_> {
            UploadContext {
                tracker: &mut self.tracker,
                reclaimer: &mut self.reclaimer,
                pool: &mut self.pool,
                epoch: Epoch::new(epoch),
            }
        }

        fn buffer(&self, size: u64) -> Arc<GfxBuffer> {
            self.device
                .create_buffer(BufferDesc::new("dst", size, BufferUsage::COPY_DST, MemoryLocation::DeviceLocal))
                .unwrap()
        }
    }

    #[test]
    fn test_single_queue_buffer_upload() {
        let mut fx = Fixture::new();
        let mut upload = fx.coordinator();
        let dst = fx.buffer(1024);

        let data: Vec<u8> = (0..1024).map(|i| (i % 251) as u8).collect();
        let ticket = upload.submit(UploadRequest::buffer("kib", &dst, 0, data.clone()));
        let batch = upload.flush(&mut fx.ctx(1)).unwrap().unwrap();

        let stats = upload.stats();
        assert_eq!(stats.submitted, 1);
        assert_eq!(stats.bytes_submitted, 1024);
        assert_eq!(stats.completed, 0);

        block_on(upload.wait(batch.fence, None)).unwrap();
        let stats = upload.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.bytes_completed, 1024);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(
            upload.result(ticket),
            Some(&UploadStatus::Complete {
                fence: batch.fence,
                bytes: 1024
            })
        );
        assert_eq!(dst.read(0, 1024).unwrap(), data);
        assert_eq!(fx.tracker.state_of(dst.handle(), None), Some(ResourceState::SHADER_RESOURCE));
        // staging 交给了延迟回收器
        assert_eq!(fx.reclaimer.pending_count(), 1);
    }

    #[test]
    fn test_zero_size_request() {
        let fx = Fixture::new();
        let mut upload = fx.coordinator();
        let dst = fx.buffer(16);

        let ticket = upload.submit(UploadRequest::buffer("empty", &dst, 0, Vec::new()));
        let stats = upload.stats();
        assert_eq!((stats.submitted, stats.completed), (1, 1));
        assert_eq!(stats.bytes_submitted, 0);
        assert_eq!(upload.queued_count(), 0);
        assert!(matches!(upload.result(ticket), Some(UploadStatus::Complete { bytes: 0, .. })));
    }

    #[test]
    fn test_lazy_completion() {
        let mut fx = Fixture::new();
        let queue = fx.device.headless_queue(&QueueKey::new("main")).unwrap();
        queue.set_completion_mode(CompletionMode::Manual);

        let mut upload = fx.coordinator();
        let dst = fx.buffer(64);
        upload.submit(UploadRequest::buffer("a", &dst, 0, vec![1; 32]));
        upload.submit(UploadRequest::buffer("b", &dst, 32, vec![2; 32]));
        let batch = upload.flush(&mut fx.ctx(1)).unwrap().unwrap();
        assert_eq!(batch.tickets.len(), 2);

        assert_eq!(upload.retire(), 0);
        assert_eq!(upload.stats().in_flight, 2);

        queue.complete_up_to(batch.fence);
        assert_eq!(upload.retire(), 2);
        assert_eq!(upload.stats().bytes_completed, 64);
        assert_eq!(dst.read(30, 4).unwrap(), vec![1, 1, 2, 2]);
    }

    #[test]
    fn test_submit_retry() {
        let mut fx = Fixture::new();
        let queue = fx.device.headless_queue(&QueueKey::new("main")).unwrap();
        let mut upload = fx.coordinator();
        let dst = fx.buffer(16);

        queue.fail_next_submits(MAX_SUBMIT_RETRIES);
        upload.submit(UploadRequest::buffer("retry", &dst, 0, vec![7; 16]));
        assert!(upload.flush(&mut fx.ctx(1)).unwrap().is_some());
        assert_eq!(queue.submissions().len(), 1);

        queue.fail_next_submits(MAX_SUBMIT_RETRIES + 1);
        let ticket = upload.submit(UploadRequest::buffer("give-up", &dst, 0, vec![8; 16]));
        let err = upload.flush(&mut fx.ctx(2)).unwrap_err();
        assert!(matches!(err, UploadError::Gfx(GfxError::SubmitFailed { .. })));
        assert!(matches!(upload.result(ticket), Some(UploadStatus::Failed(_))));
        assert_eq!(upload.stats().failed, 1);
        // 失败的批次不改变资源状态
        assert_eq!(fx.tracker.state_of(dst.handle(), None), Some(ResourceState::SHADER_RESOURCE));
    }

    #[test]
    fn test_request_failures_are_isolated() {
        let mut fx = Fixture::new();
        let mut upload = fx.coordinator();
        let dst = fx.buffer(16);

        let dead = fx.buffer(16);
        let dead_ticket = upload.submit(UploadRequest::buffer("dead", &dead, 0, vec![1; 4]));
        drop(dead);

        let oob = upload.submit(UploadRequest::buffer("oob", &dst, 8, vec![1; 16]));
        assert!(matches!(upload.result(oob), Some(UploadStatus::Failed(UploadError::OutOfBounds { .. }))));

        let ok = upload.submit(UploadRequest::buffer("ok", &dst, 0, vec![3; 16]));
        let batch = upload.flush(&mut fx.ctx(1)).unwrap().unwrap();
        assert_eq!(batch.tickets, vec![ok]);
        assert_eq!(
            upload.result(dead_ticket),
            Some(&UploadStatus::Failed(UploadError::BackingResourceNotReady("dead".into())))
        );
        assert_eq!(upload.stats().failed, 2);
    }

    #[test]
    fn test_buffer_offset_overflow_is_out_of_bounds() {
        let mut fx = Fixture::new();
        let mut upload = fx.coordinator();
        let dst = fx.buffer(16);

        // offset + size 超出 u64
        let ticket = upload.submit(UploadRequest::buffer("overflow", &dst, u64::MAX - 1, vec![7; 4]));
        assert!(matches!(
            upload.result(ticket),
            Some(UploadStatus::Failed(UploadError::OutOfBounds { .. }))
        ));
        assert!(upload.flush(&mut fx.ctx(1)).unwrap().is_none());
        assert_eq!(upload.stats().failed, 1);
    }

    #[test]
    fn test_texture_upload_pitch() {
        let mut fx = Fixture::new();
        let mut upload = fx.coordinator();
        let texture = fx
            .device
            .create_texture(
                TextureDesc::new_2d("tex", 2, 2, TextureFormat::Rgba8Unorm, TextureUsage::SAMPLED).with_mips(2),
            )
            .unwrap();

        let pixels: Vec<u8> = (0..16).collect();
        upload.submit(UploadRequest::texture("mip0", &texture, Subresource::new(0, 0), pixels.clone()));
        let batch = upload.flush(&mut fx.ctx(1)).unwrap().unwrap();
        upload.wait_blocking(batch.fence, None).unwrap();

        assert_eq!(texture.read_subresource(Subresource::new(0, 0)), Some(pixels));
        assert_eq!(
            fx.tracker.state_of(texture.handle(), Some(Subresource::new(0, 0))),
            Some(ResourceState::SHADER_RESOURCE)
        );
        assert_eq!(fx.tracker.state_of(texture.handle(), Some(Subresource::new(1, 0))), Some(ResourceState::COMMON));
    }

    #[test]
    fn test_wait_timeout() {
        let mut fx = Fixture::new();
        let queue = fx.device.headless_queue(&QueueKey::new("main")).unwrap();
        queue.set_completion_mode(CompletionMode::Stalled);

        let mut upload = fx.coordinator();
        let dst = fx.buffer(16);
        upload.submit(UploadRequest::buffer("stalled", &dst, 0, vec![1; 16]));
        let batch = upload.flush(&mut fx.ctx(1)).unwrap().unwrap();

        let err = block_on(upload.wait(batch.fence, Some(Duration::from_millis(5)))).unwrap_err();
        assert!(matches!(err, UploadError::FenceWaitTimeout { .. }));
        assert_eq!(upload.stats().in_flight, 1);

        queue.complete_all();
        block_on(upload.wait(batch.fence, None)).unwrap();
        assert_eq!(upload.stats().in_flight, 0);
    }
}
