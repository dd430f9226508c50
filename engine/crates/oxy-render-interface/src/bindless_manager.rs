use std::collections::HashMap;

use thiserror::Error;

use oxy_gfx::device::{DescriptorWrite, GfxDevice, ViewKind};
use oxy_gfx::error::GfxError;
use oxy_gfx::handles::ResourceHandle;

use crate::descriptor::{DescriptorAllocator, DescriptorDomain, DescriptorHandle, ShaderVisibleIndex};

/// bindless 表的键
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BindlessKey {
    /// 资源的某个 view
    View(ResourceHandle, ViewKind),
    /// sampler 没有资源，用 sampler 的 id 区分
    Sampler(u32),
}

impl BindlessKey {
    fn write(self) -> DescriptorWrite {
        match self {
            BindlessKey::View(resource, view) => DescriptorWrite {
                resource: Some(resource),
                view,
            },
            BindlessKey::Sampler(_) => DescriptorWrite {
                resource: None,
                view: ViewKind::Sampler,
            },
        }
    }
}

#[derive(Error, Debug)]
pub enum BindlessError {
    #[error(transparent)]
    Descriptor(#[from] crate::descriptor::DescriptorError),

    #[error("descriptor write failed: {0}")]
    Backend(#[from] GfxError),

    #[error("{key:?} can not live in domain {domain:?}")]
    DomainMismatch { key: BindlessKey, domain: DescriptorDomain },
}

/// Bindless 描述符管理器
///
/// 维护 `(资源, view) -> bindless 下标` 的 CPU 表，同一个 view 只向后端写一次 descriptor。
/// 表持有 `DescriptorHandle`，`unregister` 把 handle 交还给调用者，
/// drop 后 slot 走延迟回收。
///
/// # 使用示例
/// ```ignore
/// let index = bindless.register(device, &mut allocator, BindlessKey::View(texture.handle(), ViewKind::Srv), DescriptorDomain::Textures)?;
/// // 在着色器中: textures[index]
/// ```
#[derive(Default)]
pub struct BindlessManager {
    entries: HashMap<BindlessKey, DescriptorHandle>,
    writes_issued: u64,
}

// new & init
impl BindlessManager {
    pub fn new() -> Self {
        Self::default()
    }
}

// update
impl BindlessManager {
    /// 注册一个 view，已经注册过的直接返回原来的下标
    pub fn register(
        &mut self,
        device: &dyn GfxDevice,
        allocator: &mut DescriptorAllocator,
        key: BindlessKey,
        domain: DescriptorDomain,
    ) -> Result<ShaderVisibleIndex, BindlessError> {
        if let Some(handle) = self.entries.get(&key) {
            return Ok(handle.index());
        }

        let is_sampler = matches!(key, BindlessKey::Sampler(_));
        if is_sampler != (domain == DescriptorDomain::Samplers) {
            return Err(BindlessError::DomainMismatch { key, domain });
        }

        let handle = allocator.allocate(domain)?;
        // 写入失败时 handle 被 drop，slot 走正常的延迟回收
        device.write_descriptor(domain.heap(), handle.index().value(), &key.write())?;
        self.writes_issued += 1;

        let index = handle.index();
        log::debug!("bindless register {:?} -> {}", key, handle.slot());
        self.entries.insert(key, handle);
        Ok(index)
    }

    /// 取消注册，返回的 handle drop 之后进入延迟回收
    pub fn unregister(&mut self, key: &BindlessKey) -> Option<DescriptorHandle> {
        self.entries.remove(key)
    }

    /// 资源销毁时取消它所有 view 的注册
    pub fn unregister_resource(&mut self, resource: ResourceHandle) -> Vec<DescriptorHandle> {
        let keys: Vec<_> = self
            .entries
            .keys()
            .filter(|key| matches!(key, BindlessKey::View(r, _) if *r == resource))
            .copied()
            .collect();
        keys.iter().filter_map(|key| self.entries.remove(key)).collect()
    }
}

// getters
impl BindlessManager {
    #[inline]
    pub fn lookup(&self, key: &BindlessKey) -> Option<ShaderVisibleIndex> {
        self.entries.get(key).map(DescriptorHandle::index)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 向后端发出的 descriptor 写入次数
    #[inline]
    pub fn writes_issued(&self) -> u64 {
        self.writes_issued
    }
}

impl Drop for BindlessManager {
    fn drop(&mut self) {
        log::info!("Dropping BindlessManager");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch::Epoch;
    use crate::reclaimer::DeferredReclaimer;
    use oxy_gfx::device::DescriptorHeapKind;
    use oxy_gfx::handles::ResourceKind;
    use oxy_gfx::headless::HeadlessDevice;
    use oxy_gfx::queue::QueueKey;

    #[test]
    fn test_register_writes_once() {
        let device = HeadlessDevice::new(&[QueueKey::new("gfx")]);
        let mut allocator = DescriptorAllocator::new();
        let mut bindless = BindlessManager::new();

        let texture = ResourceHandle::new(ResourceKind::Texture, 3, 1);
        let key = BindlessKey::View(texture, ViewKind::Srv);
        let a = bindless.register(device.as_ref(), &mut allocator, key, DescriptorDomain::Textures).unwrap();
        let b = bindless.register(device.as_ref(), &mut allocator, key, DescriptorDomain::Textures).unwrap();

        assert_eq!(a, b);
        assert_eq!(a.value(), DescriptorDomain::Textures.base());
        assert_eq!(bindless.writes_issued(), 1);
        assert_eq!(device.descriptor_write_count(), 1);
        assert_eq!(
            device.descriptor_at(DescriptorHeapKind::CbvSrvUav, a.value()),
            Some(DescriptorWrite {
                resource: Some(texture),
                view: ViewKind::Srv
            })
        );
    }

    #[test]
    fn test_unregister_defers_release() {
        let device = HeadlessDevice::new(&[QueueKey::new("gfx")]);
        let mut allocator = DescriptorAllocator::new();
        let mut reclaimer = DeferredReclaimer::new();
        let mut bindless = BindlessManager::new();

        let texture = ResourceHandle::new(ResourceKind::Texture, 0, 1);
        bindless
            .register(device.as_ref(), &mut allocator, BindlessKey::View(texture, ViewKind::Srv), DescriptorDomain::Textures)
            .unwrap();
        bindless
            .register(device.as_ref(), &mut allocator, BindlessKey::View(texture, ViewKind::Uav), DescriptorDomain::Textures)
            .unwrap();

        let handles = bindless.unregister_resource(texture);
        assert_eq!(handles.len(), 2);
        assert!(bindless.is_empty());
        drop(handles);

        assert_eq!(allocator.flush_releases(&mut reclaimer, Epoch::new(1)), 2);
        assert_eq!(reclaimer.pending_count(), 2);
    }

    #[test]
    fn test_sampler_domain_mismatch() {
        let device = HeadlessDevice::new(&[QueueKey::new("gfx")]);
        let mut allocator = DescriptorAllocator::new();
        let mut bindless = BindlessManager::new();

        let result = bindless.register(device.as_ref(), &mut allocator, BindlessKey::Sampler(0), DescriptorDomain::Textures);
        assert!(matches!(result, Err(BindlessError::DomainMismatch { .. })));

        let index = bindless
            .register(device.as_ref(), &mut allocator, BindlessKey::Sampler(0), DescriptorDomain::Samplers)
            .unwrap();
        assert_eq!(index.value(), 0);
    }
}
