use std::sync::Arc;

use slotmap::SlotMap;

use oxy_gfx::handles::ResourceHandle;
use oxy_gfx::resource_state::ResourceState;
use oxy_gfx::resources::{BufferDesc, GfxBuffer, GfxTexture, TextureDesc};

slotmap::new_key_type! {
    /// Graph 内部的资源句柄
    ///
    /// 只在一次构建中有效，与后端的 `ResourceHandle` 分离。
    pub struct RgResourceHandle;
}

/// 临时资源的描述
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RgResourceDesc {
    Buffer(BufferDesc),
    Texture(TextureDesc),
}

/// 资源背后的物理资源
#[derive(Clone, Debug)]
pub enum RgPhysical {
    Buffer(Arc<GfxBuffer>),
    Texture(Arc<GfxTexture>),
}

impl RgPhysical {
    #[inline]
    pub fn handle(&self) -> ResourceHandle {
        match self {
            RgPhysical::Buffer(buffer) => buffer.handle(),
            RgPhysical::Texture(texture) => texture.handle(),
        }
    }

    #[inline]
    pub fn texture(&self) -> Option<&Arc<GfxTexture>> {
        match self {
            RgPhysical::Texture(texture) => Some(texture),
            RgPhysical::Buffer(_) => None,
        }
    }

    #[inline]
    pub fn buffer(&self) -> Option<&Arc<GfxBuffer>> {
        match self {
            RgPhysical::Buffer(buffer) => Some(buffer),
            RgPhysical::Texture(_) => None,
        }
    }
}

#[derive(Clone, Debug)]
pub enum RgResourceSource {
    /// 外部资源，未被跟踪时以 `initial_state` 登记
    Imported { initial_state: ResourceState },
    /// 每帧创建，帧结束后延迟回收
    Transient(RgResourceDesc),
}

#[derive(Clone, Debug)]
pub struct RgResource {
    pub name: String,
    pub source: RgResourceSource,
    physical: Option<RgPhysical>,
}

impl RgResource {
    pub fn imported_buffer(name: impl Into<String>, buffer: &Arc<GfxBuffer>, initial_state: ResourceState) -> Self {
        Self {
            name: name.into(),
            source: RgResourceSource::Imported { initial_state },
            physical: Some(RgPhysical::Buffer(buffer.clone())),
        }
    }

    pub fn imported_texture(name: impl Into<String>, texture: &Arc<GfxTexture>, initial_state: ResourceState) -> Self {
        Self {
            name: name.into(),
            source: RgResourceSource::Imported { initial_state },
            physical: Some(RgPhysical::Texture(texture.clone())),
        }
    }

    pub fn transient(name: impl Into<String>, desc: RgResourceDesc) -> Self {
        Self {
            name: name.into(),
            source: RgResourceSource::Transient(desc),
            physical: None,
        }
    }

    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self.source, RgResourceSource::Transient(_))
    }

    #[inline]
    pub fn physical(&self) -> Option<&RgPhysical> {
        self.physical.as_ref()
    }

    pub(crate) fn realize(&mut self, physical: RgPhysical) {
        self.physical = Some(physical);
    }

    pub(crate) fn take_physical(&mut self) -> Option<RgPhysical> {
        self.physical.take()
    }
}

/// 资源注册表
///
/// 管理 RenderGraph 中所有声明的资源，提供虚拟句柄到资源信息的映射。
#[derive(Default)]
pub struct RgResourceRegistry {
    resources: SlotMap<RgResourceHandle, RgResource>,
}

// new & init
impl RgResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

// register
impl RgResourceRegistry {
    pub fn register(&mut self, resource: RgResource) -> RgResourceHandle {
        self.resources.insert(resource)
    }
}

// getter & iter
impl RgResourceRegistry {
    #[inline]
    pub fn get(&self, handle: RgResourceHandle) -> Option<&RgResource> {
        self.resources.get(handle)
    }

    #[inline]
    pub fn get_mut(&mut self, handle: RgResourceHandle) -> Option<&mut RgResource> {
        self.resources.get_mut(handle)
    }

    #[inline]
    pub fn contains(&self, handle: RgResourceHandle) -> bool {
        self.resources.contains_key(handle)
    }

    /// 调试用的名字，未知句柄返回 `<unknown>`
    pub fn name_of(&self, handle: RgResourceHandle) -> &str {
        self.resources.get(handle).map_or("<unknown>", |r| r.name.as_str())
    }

    /// 物理资源的后端句柄
    #[inline]
    pub fn physical_handle(&self, handle: RgResourceHandle) -> Option<ResourceHandle> {
        self.get(handle).and_then(RgResource::physical).map(RgPhysical::handle)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (RgResourceHandle, &RgResource)> {
        self.resources.iter()
    }

    #[inline]
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (RgResourceHandle, &mut RgResource)> {
        self.resources.iter_mut()
    }
}
