//! headless 后端
//!
//! 资源放在 CPU 内存里，拷贝命令在 fence 完成时真正执行。
//! 默认提交即完成；测试可以切到手动完成或者永不完成，也可以注入提交失败和设备丢失。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::Waker;
use std::time::Duration;

use parking_lot::Mutex;

use crate::commands::command::GfxCommand;
use crate::commands::command_list::CommandList;
use crate::commands::submit_info::GfxSubmitInfo;
use crate::device::{DescriptorHeapKind, DescriptorWrite, GfxDevice, GfxQueue};
use crate::error::{GfxError, GfxResult};
use crate::fence::FenceValue;
use crate::handles::{ResourceHandleAllocator, ResourceKind};
use crate::queue::{QueueKey, QueueStrategy};
use crate::resources::{BufferDesc, GfxBuffer, GfxTexture, TextureDesc};

/// fence 的完成方式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionMode {
    /// 提交即完成
    Immediate,
    /// 调用 `complete_up_to` 或者 `wait_cpu` 时完成
    Manual,
    /// 永不完成，用来测试超时
    Stalled,
}

#[derive(Clone, Debug)]
pub struct HeadlessDeviceDesc {
    pub queue_keys: Vec<QueueKey>,
    pub copy_alignment: u64,
    pub max_buffer_size: u64,
}

impl Default for HeadlessDeviceDesc {
    fn default() -> Self {
        Self {
            queue_keys: vec![QueueKey::new("main")],
            copy_alignment: 16,
            max_buffer_size: 1 << 30,
        }
    }
}

/// 提交记录，测试用来检查跨队列等待和 command list 的组织
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmitRecord {
    pub value: FenceValue,
    pub list_names: Vec<String>,
    pub waits: Vec<(QueueKey, FenceValue)>,
    pub command_count: usize,
}

pub struct HeadlessDevice {
    name: String,
    handles: Arc<Mutex<ResourceHandleAllocator>>,
    queues: Vec<Arc<HeadlessQueue>>,
    descriptors: Mutex<HashMap<(DescriptorHeapKind, u32), DescriptorWrite>>,
    descriptor_writes: AtomicU64,
    copy_alignment: u64,
    max_buffer_size: u64,
    lost: Arc<AtomicBool>,
}

// new & init
impl HeadlessDevice {
    pub fn new(queue_keys: &[QueueKey]) -> Arc<Self> {
        Self::with_desc(HeadlessDeviceDesc {
            queue_keys: queue_keys.to_vec(),
            ..Default::default()
        })
    }

    pub fn from_strategy(strategy: &QueueStrategy) -> Arc<Self> {
        Self::new(&strategy.unique_keys())
    }

    pub fn with_desc(desc: HeadlessDeviceDesc) -> Arc<Self> {
        let lost = Arc::new(AtomicBool::new(false));
        let queues = desc
            .queue_keys
            .iter()
            .map(|key| {
                Arc::new(HeadlessQueue {
                    key: key.clone(),
                    state: Mutex::new(QueueState::new()),
                    lost: lost.clone(),
                })
            })
            .collect();

        log::info!("headless device created with queues {:?}", desc.queue_keys);
        Arc::new(Self {
            name: "headless".to_string(),
            handles: Arc::new(Mutex::new(ResourceHandleAllocator::new())),
            queues,
            descriptors: Mutex::new(HashMap::new()),
            descriptor_writes: AtomicU64::new(0),
            copy_alignment: desc.copy_alignment.max(1),
            max_buffer_size: desc.max_buffer_size,
            lost,
        })
    }
}

// getters
impl HeadlessDevice {
    pub fn headless_queue(&self, key: &QueueKey) -> Option<Arc<HeadlessQueue>> {
        self.queues.iter().find(|q| q.key == *key).cloned()
    }

    pub fn headless_queues(&self) -> &[Arc<HeadlessQueue>] {
        &self.queues
    }

    /// 后端 descriptor 写入的总次数
    pub fn descriptor_write_count(&self) -> u64 {
        self.descriptor_writes.load(Ordering::Relaxed)
    }

    pub fn descriptor_at(&self, heap: DescriptorHeapKind, index: u32) -> Option<DescriptorWrite> {
        self.descriptors.lock().get(&(heap, index)).copied()
    }

    /// 还存活的 buffer / texture 数量
    pub fn live_resource_count(&self) -> usize {
        self.handles.lock().live_count()
    }
}

// tools
impl HeadlessDevice {
    /// 模拟设备丢失，之后所有提交都会失败
    pub fn set_lost(&self) {
        log::error!("headless device marked as lost");
        self.lost.store(true, Ordering::Release);
        for queue in &self.queues {
            queue.wake_all();
        }
    }
}

impl GfxDevice for HeadlessDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_buffer(&self, desc: BufferDesc) -> GfxResult<Arc<GfxBuffer>> {
        if self.is_lost() {
            return Err(GfxError::DeviceLost);
        }
        if desc.size > self.max_buffer_size {
            return Err(GfxError::ResourceCreation(format!(
                "buffer {} of {} bytes exceeds the limit {}",
                desc.name, desc.size, self.max_buffer_size
            )));
        }
        let handle = self.handles.lock().allocate(ResourceKind::Buffer);
        Ok(Arc::new(GfxBuffer::new(handle, desc, Arc::downgrade(&self.handles))))
    }

    fn create_texture(&self, desc: TextureDesc) -> GfxResult<Arc<GfxTexture>> {
        if self.is_lost() {
            return Err(GfxError::DeviceLost);
        }
        if desc.width == 0 || desc.height == 0 {
            return Err(GfxError::ResourceCreation(format!("texture {} has zero extent", desc.name)));
        }
        let handle = self.handles.lock().allocate(ResourceKind::Texture);
        Ok(Arc::new(GfxTexture::new(handle, desc, Arc::downgrade(&self.handles))))
    }

    fn queue(&self, key: &QueueKey) -> GfxResult<Arc<dyn GfxQueue>> {
        self.headless_queue(key)
            .map(|q| q as Arc<dyn GfxQueue>)
            .ok_or_else(|| GfxError::QueueNotFound(key.to_string()))
    }

    fn copy_alignment(&self) -> u64 {
        self.copy_alignment
    }

    fn write_descriptor(&self, heap: DescriptorHeapKind, index: u32, write: &DescriptorWrite) -> GfxResult<()> {
        self.descriptors.lock().insert((heap, index), *write);
        self.descriptor_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }
}

struct QueueState {
    mode: CompletionMode,
    last_submitted: u64,
    completed: u64,
    pending: VecDeque<(u64, Vec<CommandList>)>,
    retired: Vec<CommandList>,
    fail_next: u32,
    history: Vec<SubmitRecord>,
    presents: u64,
    /// 等待 fence 的异步任务
    waiters: Vec<(u64, Waker)>,
}

impl QueueState {
    fn new() -> Self {
        Self {
            mode: CompletionMode::Immediate,
            last_submitted: 0,
            completed: 0,
            pending: VecDeque::new(),
            retired: Vec::new(),
            fail_next: 0,
            history: Vec::new(),
            presents: 0,
            waiters: Vec::new(),
        }
    }

    /// 执行并回收 fence 值不超过 `value` 的提交
    fn complete_up_to(&mut self, value: u64) {
        while self.pending.front().is_some_and(|(v, _)| *v <= value) {
            let Some((v, lists)) = self.pending.pop_front() else {
                break;
            };
            for mut list in lists {
                for command in list.commands() {
                    if let Err(e) = execute_command(command) {
                        log::error!("headless: command \"{}\" failed: {}", command.serialize(), e);
                    }
                }
                match list.retire() {
                    Ok(()) => self.retired.push(list),
                    Err(e) => log::error!("headless: {}", e),
                }
            }
            self.completed = self.completed.max(v);
        }
        self.completed = self.completed.max(value.min(self.last_submitted));

        let completed = self.completed;
        self.waiters.retain(|(value, waker)| {
            if *value <= completed {
                waker.wake_by_ref();
                false
            } else {
                true
            }
        });
    }
}

/// 在 CPU 上执行一条命令
fn execute_command(command: &GfxCommand) -> GfxResult<()> {
    match command {
        GfxCommand::CopyBuffer {
            src,
            src_offset,
            dst,
            dst_offset,
            size,
        } => {
            let bytes = src.read(*src_offset, *size)?;
            dst.write(*dst_offset, &bytes)
        }
        GfxCommand::CopyBufferToTexture {
            src,
            src_offset,
            row_pitch,
            dst,
            subresource,
        } => {
            let (_, height) = dst.desc().mip_extent(subresource.mip);
            let row_bytes = dst.desc().tight_row_bytes(subresource.mip) as u64;
            let len = *row_pitch as u64 * (height as u64 - 1) + row_bytes;
            let bytes = src.read(*src_offset, len)?;
            dst.write_rows(*subresource, &bytes, *row_pitch)
        }
        _ => Ok(()),
    }
}

pub struct HeadlessQueue {
    key: QueueKey,
    state: Mutex<QueueState>,
    lost: Arc<AtomicBool>,
}

// tools
impl HeadlessQueue {
    pub fn set_completion_mode(&self, mode: CompletionMode) {
        let mut state = self.state.lock();
        state.mode = mode;
        if mode == CompletionMode::Immediate {
            let last = state.last_submitted;
            state.complete_up_to(last);
        }
    }

    /// 手动推进 GPU 进度
    pub fn complete_up_to(&self, value: FenceValue) {
        self.state.lock().complete_up_to(value.value());
    }

    pub fn complete_all(&self) {
        let mut state = self.state.lock();
        let last = state.last_submitted;
        state.complete_up_to(last);
    }

    /// 接下来的 n 次提交会失败
    pub fn fail_next_submits(&self, count: u32) {
        self.state.lock().fail_next = count;
    }

    pub fn submissions(&self) -> Vec<SubmitRecord> {
        self.state.lock().history.clone()
    }

    pub fn present_count(&self) -> u64 {
        self.state.lock().presents
    }

    /// 唤醒所有等待者，设备丢失时使用
    fn wake_all(&self) {
        let waiters = std::mem::take(&mut self.state.lock().waiters);
        waiters.into_iter().for_each(|(_, waker)| waker.wake());
    }

    /// 还在等待 fence 的异步任务数量
    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    fn timeout_error(&self, value: FenceValue) -> GfxError {
        GfxError::FenceWaitTimeout {
            queue: self.key.to_string(),
            value: value.value(),
        }
    }
}

impl GfxQueue for HeadlessQueue {
    fn key(&self) -> &QueueKey {
        &self.key
    }

    fn submit(&self, info: GfxSubmitInfo) -> GfxResult<FenceValue> {
        let _span = tracy_client::span!("HeadlessQueue::submit");
        if self.is_lost() {
            return Err(GfxError::DeviceLost);
        }

        let mut state = self.state.lock();
        if state.fail_next > 0 {
            state.fail_next -= 1;
            info.command_lists.into_iter().for_each(CommandList::discard);
            return Err(GfxError::SubmitFailed {
                queue: self.key.to_string(),
                message: "injected submit failure".to_string(),
            });
        }

        let mut lists = info.command_lists;
        for list in &mut lists {
            list.mark_executing()?;
        }

        let value = state.last_submitted + 1;
        state.last_submitted = value;
        state.history.push(SubmitRecord {
            value: FenceValue::new(value),
            list_names: lists.iter().map(|l| l.name().to_string()).collect(),
            waits: info.waits,
            command_count: lists.iter().map(|l| l.commands().len()).sum(),
        });
        state.pending.push_back((value, lists));

        if state.mode == CompletionMode::Immediate {
            state.complete_up_to(value);
        }
        Ok(FenceValue::new(value))
    }

    fn completed_value(&self) -> FenceValue {
        FenceValue::new(self.state.lock().completed)
    }

    fn last_submitted_value(&self) -> FenceValue {
        FenceValue::new(self.state.lock().last_submitted)
    }

    fn wait_cpu(&self, value: FenceValue, _timeout: Option<Duration>) -> GfxResult<()> {
        if !value.is_valid() {
            return Ok(());
        }
        if self.is_lost() {
            return Err(GfxError::DeviceLost);
        }

        let mut state = self.state.lock();
        if state.completed >= value.value() {
            return Ok(());
        }
        // 从未提交过的值不会被 signal
        if value.value() > state.last_submitted {
            return Err(self.timeout_error(value));
        }
        match state.mode {
            CompletionMode::Immediate | CompletionMode::Manual => {
                state.complete_up_to(value.value());
                Ok(())
            }
            CompletionMode::Stalled => Err(self.timeout_error(value)),
        }
    }

    fn register_waker(&self, value: FenceValue, waker: Waker) {
        let mut state = self.state.lock();
        if !value.is_valid() || state.completed >= value.value() || self.is_lost() {
            drop(state);
            waker.wake();
            return;
        }
        match state.waiters.iter_mut().find(|(v, w)| *v == value.value() && w.will_wake(&waker)) {
            Some(slot) => slot.1 = waker,
            None => state.waiters.push((value.value(), waker)),
        }
    }

    fn present(&self) -> GfxResult<()> {
        if self.is_lost() {
            return Err(GfxError::DeviceLost);
        }
        self.state.lock().presents += 1;
        Ok(())
    }

    fn collect_retired(&self) -> Vec<CommandList> {
        std::mem::take(&mut self.state.lock().retired)
    }

    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::command_list::CommandListState;
    use crate::commands::pool::CommandListPool;
    use crate::queue::QueueRole;
    use crate::resources::{BufferUsage, MemoryLocation};

    fn copy_list(pool: &mut CommandListPool, src: &Arc<GfxBuffer>, dst: &Arc<GfxBuffer>) -> CommandList {
        let mut recorder = pool.recorder("copy").unwrap();
        recorder
            .record(GfxCommand::CopyBuffer {
                src: src.clone(),
                src_offset: 0,
                dst: dst.clone(),
                dst_offset: 0,
                size: src.size(),
            })
            .unwrap();
        recorder.finish().unwrap()
    }

    #[test]
    fn test_copy_executes_on_completion() {
        let key = QueueKey::new("main");
        let device = HeadlessDevice::new(std::slice::from_ref(&key));
        let queue = device.headless_queue(&key).unwrap();
        queue.set_completion_mode(CompletionMode::Manual);

        let src = device.create_buffer(BufferDesc::upload("src", 4)).unwrap();
        src.write(0, &[9, 8, 7, 6]).unwrap();
        let dst = device
            .create_buffer(BufferDesc::new("dst", 4, BufferUsage::COPY_DST, MemoryLocation::DeviceLocal))
            .unwrap();

        let mut pool = CommandListPool::new(QueueRole::Transfer);
        let list = copy_list(&mut pool, &src, &dst);
        let fence = queue.submit(GfxSubmitInfo::new(vec![list])).unwrap();
        assert_eq!(fence, FenceValue::new(1));
        assert_eq!(queue.completed_value(), FenceValue::ZERO);
        assert_eq!(dst.read(0, 4).unwrap(), vec![0; 4]);

        queue.wait_cpu(fence, None).unwrap();
        assert_eq!(queue.completed_value(), fence);
        assert_eq!(dst.read(0, 4).unwrap(), vec![9, 8, 7, 6]);

        let retired = queue.collect_retired();
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].state(), CommandListState::Free);
    }

    #[test]
    fn test_injected_failure_and_device_lost() {
        let key = QueueKey::new("main");
        let device = HeadlessDevice::new(std::slice::from_ref(&key));
        let queue = device.headless_queue(&key).unwrap();
        queue.fail_next_submits(1);

        let mut pool = CommandListPool::new(QueueRole::Graphics);
        let list = pool.recorder("first").unwrap().finish().unwrap();
        let err = queue.submit(GfxSubmitInfo::new(vec![list])).unwrap_err();
        assert!(err.is_retriable());

        let list = pool.recorder("second").unwrap().finish().unwrap();
        assert_eq!(queue.submit(GfxSubmitInfo::new(vec![list])).unwrap(), FenceValue::new(1));

        device.set_lost();
        let list = pool.recorder("third").unwrap().finish().unwrap();
        assert_eq!(queue.submit(GfxSubmitInfo::new(vec![list])), Err(GfxError::DeviceLost));
        assert!(device.create_buffer(BufferDesc::upload("late", 4)).is_err());
    }

    #[test]
    fn test_submit_requires_recorded_list() {
        let key = QueueKey::new("main");
        let device = HeadlessDevice::new(std::slice::from_ref(&key));
        let queue = device.headless_queue(&key).unwrap();

        let list = CommandList::new(0, QueueRole::Graphics);
        let err = queue.submit(GfxSubmitInfo::new(vec![list])).unwrap_err();
        assert!(matches!(err, GfxError::InvalidState(_)));
        assert_eq!(queue.last_submitted_value(), FenceValue::ZERO);
    }

    #[test]
    fn test_resource_handles_released_on_drop() {
        let device = HeadlessDevice::new(&[QueueKey::new("main")]);
        let buffer = device.create_buffer(BufferDesc::upload("tmp", 8)).unwrap();
        assert_eq!(device.live_resource_count(), 1);
        drop(buffer);
        assert_eq!(device.live_resource_count(), 0);
    }

    #[test]
    fn test_stalled_wait_times_out() {
        let key = QueueKey::new("main");
        let device = HeadlessDevice::new(std::slice::from_ref(&key));
        let queue = device.headless_queue(&key).unwrap();
        queue.set_completion_mode(CompletionMode::Stalled);

        let mut pool = CommandListPool::new(QueueRole::Graphics);
        let list = pool.recorder("stalled").unwrap().finish().unwrap();
        let fence = queue.submit(GfxSubmitInfo::new(vec![list])).unwrap();
        let err = queue.wait_cpu(fence, Some(Duration::from_millis(1))).unwrap_err();
        assert!(err.is_transient());
    }
}
