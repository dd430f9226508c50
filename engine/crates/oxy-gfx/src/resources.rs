use std::sync::Weak;

use parking_lot::Mutex;

use crate::error::{GfxError, GfxResult};
use crate::handles::{ResourceHandle, ResourceHandleAllocator};

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
        const COPY_SRC = 1 << 4;
        const COPY_DST = 1 << 5;
        const INDIRECT = 1 << 6;
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        const SAMPLED = 1 << 0;
        const STORAGE = 1 << 1;
        const RENDER_TARGET = 1 << 2;
        const DEPTH_STENCIL = 1 << 3;
        const COPY_SRC = 1 << 4;
        const COPY_DST = 1 << 5;
    }
}

/// 内存位置
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    /// GPU 独占
    DeviceLocal,
    /// 持久映射、顺序写入的上传内存
    Upload,
    /// CPU 回读
    Readback,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BufferDesc {
    pub name: String,
    pub size: u64,
    pub usage: BufferUsage,
    pub location: MemoryLocation,
}

impl BufferDesc {
    pub fn new(name: impl Into<String>, size: u64, usage: BufferUsage, location: MemoryLocation) -> Self {
        Self {
            name: name.into(),
            size,
            usage,
            location,
        }
    }

    /// 上传用的 staging buffer
    pub fn upload(name: impl Into<String>, size: u64) -> Self {
        Self::new(name, size, BufferUsage::COPY_SRC, MemoryLocation::Upload)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba16Float,
    R32Uint,
    Depth32Float,
}

impl TextureFormat {
    #[inline]
    pub const fn bytes_per_pixel(self) -> u32 {
        match self {
            TextureFormat::Rgba8Unorm | TextureFormat::R32Uint | TextureFormat::Depth32Float => 4,
            TextureFormat::Rgba16Float => 8,
        }
    }

    #[inline]
    pub const fn is_depth(self) -> bool {
        matches!(self, TextureFormat::Depth32Float)
    }
}

/// 纹理的一个 (mip, array layer) 子资源
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Subresource {
    pub mip: u32,
    pub layer: u32,
}

impl Subresource {
    pub const fn new(mip: u32, layer: u32) -> Self {
        Self { mip, layer }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TextureDesc {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
}

impl TextureDesc {
    pub fn new_2d(name: impl Into<String>, width: u32, height: u32, format: TextureFormat, usage: TextureUsage) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            mip_levels: 1,
            array_layers: 1,
            format,
            usage,
        }
    }

    pub fn with_mips(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels.max(1);
        self
    }

    pub fn with_layers(mut self, array_layers: u32) -> Self {
        self.array_layers = array_layers.max(1);
        self
    }

    #[inline]
    pub fn subresource_count(&self) -> u32 {
        self.mip_levels * self.array_layers
    }

    /// 子资源在线性数组中的位置，layer 为主序
    pub fn subresource_index(&self, sub: Subresource) -> Option<usize> {
        if sub.mip >= self.mip_levels || sub.layer >= self.array_layers {
            return None;
        }
        Some((sub.layer * self.mip_levels + sub.mip) as usize)
    }

    pub fn subresources(&self) -> impl Iterator<Item = Subresource> + '_ {
        (0..self.array_layers).flat_map(move |layer| (0..self.mip_levels).map(move |mip| Subresource::new(mip, layer)))
    }

    #[inline]
    pub fn mip_extent(&self, mip: u32) -> (u32, u32) {
        ((self.width >> mip).max(1), (self.height >> mip).max(1))
    }

    /// 紧密排列时一行的字节数
    #[inline]
    pub fn tight_row_bytes(&self, mip: u32) -> u32 {
        self.mip_extent(mip).0 * self.format.bytes_per_pixel()
    }
}

/// buffer 资源
///
/// 由后端创建，通过 `Arc` 在后端和 in-flight 帧之间共享。
/// `data` 是 CPU 端的内存镜像：上传内存的持久映射，或 headless 后端的存储。
/// 最后一个引用释放时把 handle 还给设备的分配器；设备只以弱引用被持有。
pub struct GfxBuffer {
    handle: ResourceHandle,
    desc: BufferDesc,
    data: Mutex<Vec<u8>>,
    owner: Weak<Mutex<ResourceHandleAllocator>>,
}

// new & init
impl GfxBuffer {
    pub fn new(handle: ResourceHandle, desc: BufferDesc, owner: Weak<Mutex<ResourceHandleAllocator>>) -> Self {
        let data = vec![0u8; desc.size as usize];
        Self {
            handle,
            desc,
            data: Mutex::new(data),
            owner,
        }
    }
}

// getters
impl GfxBuffer {
    #[inline]
    pub fn handle(&self) -> ResourceHandle {
        self.handle
    }

    #[inline]
    pub fn desc(&self) -> &BufferDesc {
        &self.desc
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.desc.size
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.desc.name
    }
}

// tools
impl GfxBuffer {
    /// 写入映射内存
    pub fn write(&self, offset: u64, bytes: &[u8]) -> GfxResult<()> {
        let end = offset
            .checked_add(bytes.len() as u64)
            .filter(|end| *end <= self.desc.size)
            .ok_or_else(|| GfxError::OutOfBounds(format!("{}: write {}+{}", self.desc.name, offset, bytes.len())))?;
        self.data.lock()[offset as usize..end as usize].copy_from_slice(bytes);
        Ok(())
    }

    pub fn read(&self, offset: u64, len: u64) -> GfxResult<Vec<u8>> {
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= self.desc.size)
            .ok_or_else(|| GfxError::OutOfBounds(format!("{}: read {}+{}", self.desc.name, offset, len)))?;
        Ok(self.data.lock()[offset as usize..end as usize].to_vec())
    }
}

impl Drop for GfxBuffer {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.lock().release(self.handle);
        }
        log::trace!("buffer {} ({:?}) released", self.desc.name, self.handle);
    }
}

impl std::fmt::Debug for GfxBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GfxBuffer").field("handle", &self.handle).field("desc", &self.desc).finish()
    }
}

/// texture 资源，每个子资源一段紧密排列的 CPU 镜像
pub struct GfxTexture {
    handle: ResourceHandle,
    desc: TextureDesc,
    subresources: Mutex<Vec<Vec<u8>>>,
    owner: Weak<Mutex<ResourceHandleAllocator>>,
}

// new & init
impl GfxTexture {
    pub fn new(handle: ResourceHandle, desc: TextureDesc, owner: Weak<Mutex<ResourceHandleAllocator>>) -> Self {
        let subresources = desc
            .subresources()
            .map(|sub| {
                let (_, height) = desc.mip_extent(sub.mip);
                vec![0u8; (desc.tight_row_bytes(sub.mip) * height) as usize]
            })
            .collect();
        Self {
            handle,
            desc,
            subresources: Mutex::new(subresources),
            owner,
        }
    }
}

// getters
impl GfxTexture {
    #[inline]
    pub fn handle(&self) -> ResourceHandle {
        self.handle
    }

    #[inline]
    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.desc.name
    }
}

// tools
impl GfxTexture {
    pub fn read_subresource(&self, sub: Subresource) -> Option<Vec<u8>> {
        let index = self.desc.subresource_index(sub)?;
        Some(self.subresources.lock()[index].clone())
    }

    /// 按行写入子资源，`src` 的行距是 `row_pitch`
    pub fn write_rows(&self, sub: Subresource, src: &[u8], row_pitch: u32) -> GfxResult<()> {
        let index = self
            .desc
            .subresource_index(sub)
            .ok_or_else(|| GfxError::OutOfBounds(format!("{}: subresource {:?}", self.desc.name, sub)))?;
        let row_bytes = self.desc.tight_row_bytes(sub.mip) as usize;
        let (_, height) = self.desc.mip_extent(sub.mip);
        let row_pitch = row_pitch as usize;
        if row_pitch < row_bytes || src.len() < row_pitch * (height as usize - 1) + row_bytes {
            return Err(GfxError::OutOfBounds(format!(
                "{}: {} bytes with pitch {} for {:?}",
                self.desc.name,
                src.len(),
                row_pitch,
                sub
            )));
        }

        let mut subresources = self.subresources.lock();
        let dst = &mut subresources[index];
        for row in 0..height as usize {
            dst[row * row_bytes..(row + 1) * row_bytes].copy_from_slice(&src[row * row_pitch..row * row_pitch + row_bytes]);
        }
        Ok(())
    }
}

impl Drop for GfxTexture {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.lock().release(self.handle);
        }
        log::trace!("texture {} ({:?}) released", self.desc.name, self.handle);
    }
}

impl std::fmt::Debug for GfxTexture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GfxTexture").field("handle", &self.handle).field("desc", &self.desc).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handles::ResourceKind;
    use std::sync::Arc;

    #[test]
    fn test_buffer_release_returns_handle() {
        let allocator = Arc::new(Mutex::new(ResourceHandleAllocator::new()));
        let handle = allocator.lock().allocate(ResourceKind::Buffer);
        let buffer = GfxBuffer::new(handle, BufferDesc::upload("staging", 16), Arc::downgrade(&allocator));
        assert_eq!(allocator.lock().live_count(), 1);

        buffer.write(4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(buffer.read(4, 4).unwrap(), vec![1, 2, 3, 4]);
        assert!(buffer.write(14, &[0; 4]).is_err());

        drop(buffer);
        assert_eq!(allocator.lock().live_count(), 0);
    }

    #[test]
    fn test_texture_write_rows_with_pitch() {
        let allocator = Arc::new(Mutex::new(ResourceHandleAllocator::new()));
        let handle = allocator.lock().allocate(ResourceKind::Texture);
        let desc = TextureDesc::new_2d("albedo", 2, 2, TextureFormat::Rgba8Unorm, TextureUsage::SAMPLED);
        let texture = GfxTexture::new(handle, desc, Arc::downgrade(&allocator));

        // 每行 8 字节有效数据，行距 12
        let mut src = vec![0u8; 20];
        src[0..8].copy_from_slice(&[1; 8]);
        src[12..20].copy_from_slice(&[2; 8]);
        texture.write_rows(Subresource::default(), &src, 12).unwrap();

        let data = texture.read_subresource(Subresource::default()).unwrap();
        assert_eq!(&data[0..8], &[1; 8]);
        assert_eq!(&data[8..16], &[2; 8]);
    }

    #[test]
    fn test_subresource_index_layer_major() {
        let desc = TextureDesc::new_2d("array", 8, 8, TextureFormat::Rgba8Unorm, TextureUsage::SAMPLED)
            .with_mips(3)
            .with_layers(2);
        assert_eq!(desc.subresource_count(), 6);
        assert_eq!(desc.subresource_index(Subresource::new(2, 1)), Some(5));
        assert_eq!(desc.subresource_index(Subresource::new(3, 0)), None);
        assert_eq!(desc.mip_extent(2), (2, 2));
    }
}
