//! staging 内存分配
//!
//! v1 策略：每个上传请求单独创建一个持久映射的上传 buffer，
//! 依靠 `Arc` 的所有权在 epoch 退休后释放。环形或 slab 策略可以替换它而不改变接口。

use std::sync::{Arc, Weak};

use oxy_gfx::device::GfxDevice;
use oxy_gfx::error::GfxResult;
use oxy_gfx::resources::{BufferDesc, GfxBuffer};

use crate::upload::UploadError;

/// 纹理行距的默认对齐
pub const DEFAULT_ROW_PITCH_ALIGNMENT: u64 = 256;

#[inline]
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// 对齐策略
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AlignmentPolicy {
    pub row_pitch_alignment: u64,
}

impl Default for AlignmentPolicy {
    fn default() -> Self {
        Self {
            row_pitch_alignment: DEFAULT_ROW_PITCH_ALIGNMENT,
        }
    }
}

impl AlignmentPolicy {
    /// staging 偏移的对齐：自然对齐、后端拷贝对齐、纹理行距对齐中最大的一个
    pub fn staging_alignment(&self, natural: u64, copy_alignment: u64, is_texture: bool) -> u64 {
        let row = if is_texture { self.row_pitch_alignment } else { 1 };
        natural.max(copy_alignment).max(row).max(1).next_power_of_two()
    }

    #[inline]
    pub fn row_pitch(&self, tight_row_bytes: u64) -> u64 {
        align_up(tight_row_bytes, self.row_pitch_alignment.max(1).next_power_of_two())
    }
}

/// 一次 staging 分配
///
/// 持有上传 buffer 的引用，登记到延迟回收器后随 epoch 退休释放。
#[derive(Clone, Debug)]
pub struct StagingAllocation {
    buffer: Arc<GfxBuffer>,
    offset: u64,
    size: u64,
}

impl StagingAllocation {
    #[inline]
    pub fn buffer(&self) -> &Arc<GfxBuffer> {
        &self.buffer
    }

    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// 顺序写入映射内存
    pub fn write(&self, bytes: &[u8]) -> GfxResult<()> {
        self.buffer.write(self.offset, bytes)
    }

    /// 按 `row_pitch` 写入紧密排列的行
    pub fn write_rows(&self, src: &[u8], tight_row_bytes: u64, row_pitch: u64) -> GfxResult<()> {
        if tight_row_bytes == 0 {
            return Ok(());
        }
        for (row, chunk) in src.chunks(tight_row_bytes as usize).enumerate() {
            self.buffer.write(self.offset + row as u64 * row_pitch, chunk)?;
        }
        Ok(())
    }
}

/// staging 内存的提供者
pub trait StagingProvider: Send {
    fn name(&self) -> &str;

    fn allocate(
        &mut self,
        device: &dyn GfxDevice,
        size: u64,
        alignment: u64,
        label: &str,
    ) -> Result<StagingAllocation, UploadError>;

    /// 仍被持有的 staging 字节数
    fn bytes_in_use(&mut self) -> u64;
}

/// v1：每个请求一个上传 buffer
pub struct PerRequestStagingAllocator {
    max_allocation: u64,
    /// 所有存活分配的总上限，None 表示不限
    budget: Option<u64>,
    live: Vec<Weak<GfxBuffer>>,
    created: u64,
}

// new & init
impl PerRequestStagingAllocator {
    pub fn new(max_allocation: u64) -> Self {
        Self {
            max_allocation,
            budget: None,
            live: Vec::new(),
            created: 0,
        }
    }

    pub fn with_budget(mut self, budget: u64) -> Self {
        self.budget = Some(budget);
        self
    }
}
impl Default for PerRequestStagingAllocator {
    fn default() -> Self {
        Self::new(256 << 20)
    }
}

// getters
impl PerRequestStagingAllocator {
    #[inline]
    pub fn created_count(&self) -> u64 {
        self.created
    }
}

impl StagingProvider for PerRequestStagingAllocator {
    fn name(&self) -> &str {
        "per-request"
    }

    fn allocate(
        &mut self,
        device: &dyn GfxDevice,
        size: u64,
        alignment: u64,
        label: &str,
    ) -> Result<StagingAllocation, UploadError> {
        let _span = tracy_client::span!("PerRequestStagingAllocator::allocate");

        // 单独的 buffer 从 0 开始，偏移天然满足对齐
        let offset = align_up(0, alignment.max(1).next_power_of_two());
        let total = offset + size;
        if total > self.max_allocation {
            return Err(UploadError::StagingAllocFailed {
                requested: total,
                reason: format!("exceeds max staging allocation {}", self.max_allocation),
            });
        }
        if let Some(budget) = self.budget {
            let in_use = self.bytes_in_use();
            if in_use + total > budget {
                return Err(UploadError::StagingAllocFailed {
                    requested: total,
                    reason: format!("staging budget {} exhausted ({} in use)", budget, in_use),
                });
            }
        }

        let buffer = device
            .create_buffer(BufferDesc::upload(format!("staging-{}-{}", self.created, label), total))
            .map_err(|e| UploadError::StagingAllocFailed {
                requested: total,
                reason: e.to_string(),
            })?;
        self.created += 1;
        self.live.push(Arc::downgrade(&buffer));

        Ok(StagingAllocation { buffer, offset, size })
    }

    fn bytes_in_use(&mut self) -> u64 {
        self.live.retain(|weak| weak.strong_count() > 0);
        self.live.iter().filter_map(Weak::upgrade).map(|b| b.size()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxy_gfx::headless::HeadlessDevice;
    use oxy_gfx::queue::QueueKey;

    #[test]
    fn test_alignment_policy() {
        let policy = AlignmentPolicy::default();
        assert_eq!(policy.staging_alignment(4, 16, false), 16);
        assert_eq!(policy.staging_alignment(512, 16, false), 512);
        assert_eq!(policy.staging_alignment(4, 16, true), 256);
        assert_eq!(policy.row_pitch(4 * 3), 256);
        assert_eq!(policy.row_pitch(256), 256);
        assert_eq!(policy.row_pitch(260), 512);
    }

    #[test]
    fn test_budget_released_by_ownership() {
        let device = HeadlessDevice::new(&[QueueKey::new("copy")]);
        let mut staging = PerRequestStagingAllocator::new(1024).with_budget(1024);

        let a = staging.allocate(device.as_ref(), 768, 16, "a").unwrap();
        assert_eq!(staging.bytes_in_use(), 768);
        assert!(matches!(
            staging.allocate(device.as_ref(), 512, 16, "b"),
            Err(UploadError::StagingAllocFailed { .. })
        ));

        drop(a);
        assert_eq!(staging.bytes_in_use(), 0);
        assert!(staging.allocate(device.as_ref(), 512, 16, "b").is_ok());
        assert_eq!(staging.created_count(), 2);
    }

    #[test]
    fn test_oversized_request() {
        let device = HeadlessDevice::new(&[QueueKey::new("copy")]);
        let mut staging = PerRequestStagingAllocator::new(64);
        let err = staging.allocate(device.as_ref(), 65, 4, "big").unwrap_err();
        assert!(matches!(err, UploadError::StagingAllocFailed { requested: 65, .. }));
    }

    #[test]
    fn test_write_rows_with_pitch() {
        let device = HeadlessDevice::new(&[QueueKey::new("copy")]);
        let mut staging = PerRequestStagingAllocator::default();
        let alloc = staging.allocate(device.as_ref(), 512, 256, "rows").unwrap();
        alloc.write_rows(&[1, 2, 3, 4, 5, 6, 7, 8], 4, 256).unwrap();

        let buffer = alloc.buffer();
        assert_eq!(buffer.read(0, 4).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(buffer.read(256, 4).unwrap(), vec![5, 6, 7, 8]);
    }
}
