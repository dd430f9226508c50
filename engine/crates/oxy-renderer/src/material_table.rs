use std::collections::HashMap;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use oxy_asset::asset_hub::AssetHub;
use oxy_asset::handle::LoadStatus;
use oxy_asset::upload::{UploadCoordinator, UploadRequest, UploadTicket};
use oxy_gfx::device::{GfxDevice, ViewKind};
use oxy_gfx::error::GfxError;
use oxy_gfx::resources::{BufferDesc, BufferUsage, GfxBuffer, MemoryLocation};
use oxy_render_interface::bindless_manager::{BindlessError, BindlessKey, BindlessManager};
use oxy_render_interface::descriptor::{DescriptorAllocator, DescriptorDomain, ShaderVisibleIndex};
use oxy_render_interface::epoch::Epoch;
use oxy_render_interface::phase_error::PhaseError;
use oxy_render_interface::reclaimer::{DeferredReclaimer, Reclaimable};
use oxy_render_interface::state_tracker::ResourceStateTracker;
use oxy_scene::components::material::{AlphaMode, MaterialAsset};
use oxy_scene::guid_new_type::MaterialHandle;
use oxy_scene::scene_prep::MaterialBinder;

/// shader 中的材质结构，与 `DrawMetadata::material_handle` 对应
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct MaterialGpuData {
    pub base_color: [f32; 4],
    pub metallic: f32,
    pub roughness: f32,
    /// 0 表示不做 alpha test
    pub alpha_cutoff: f32,
    /// Textures 域中的 bindless 下标，无效值表示不使用贴图
    pub base_color_index: u32,
}

impl MaterialGpuData {
    fn from_asset(material: &MaterialAsset, base_color_index: u32) -> Self {
        Self {
            base_color: material.base_color.to_array(),
            metallic: material.metallic,
            roughness: material.roughness,
            alpha_cutoff: match material.alpha_mode {
                AlphaMode::Mask { cutoff } => cutoff,
                AlphaMode::Opaque | AlphaMode::Blend => 0.0,
            },
            base_color_index,
        }
    }
}

impl Default for MaterialGpuData {
    fn default() -> Self {
        Self::from_asset(&MaterialAsset::default(), ShaderVisibleIndex::INVALID.value())
    }
}

const MIN_CAPACITY: usize = 64;

/// GPU 上的材质表
///
/// 0 号是默认材质，场景中的材质从 1 开始编号。记录有变化时整表重新上传。
pub struct MaterialTable {
    ids: HashMap<MaterialHandle, u32>,
    records: Vec<MaterialGpuData>,
    dirty: bool,

    buffer: Option<Arc<GfxBuffer>>,
    buffer_index: ShaderVisibleIndex,
}

impl Default for MaterialTable {
    fn default() -> Self {
        Self {
            ids: HashMap::new(),
            records: vec![MaterialGpuData::default()],
            dirty: true,
            buffer: None,
            buffer_index: ShaderVisibleIndex::INVALID,
        }
    }
}

// new & init
impl MaterialTable {
    pub fn new() -> Self {
        Self::default()
    }
}

// getters
impl MaterialTable {
    #[inline]
    pub fn id_of(&self, handle: MaterialHandle) -> Option<u32> {
        self.ids.get(&handle).copied()
    }

    #[inline]
    pub fn record(&self, id: u32) -> Option<&MaterialGpuData> {
        self.records.get(id as usize)
    }

    /// 包括默认材质
    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// 材质表在 Materials 域中的 bindless 下标
    #[inline]
    pub fn buffer_index(&self) -> ShaderVisibleIndex {
        self.buffer_index
    }
}

// update
impl MaterialTable {
    /// 写入材质记录，返回它的 id
    pub fn insert(&mut self, handle: MaterialHandle, material: &MaterialAsset, base_color_index: u32) -> u32 {
        let record = MaterialGpuData::from_asset(material, base_color_index);
        match self.ids.get(&handle) {
            Some(&id) => {
                if self.records[id as usize] != record {
                    self.records[id as usize] = record;
                    self.dirty = true;
                }
                id
            }
            None => {
                let id = self.records.len() as u32;
                self.records.push(record);
                self.ids.insert(handle, id);
                self.dirty = true;
                id
            }
        }
    }

    /// 材质表有变化时上传整表
    ///
    /// 容量不够时创建新的 buffer，旧的 buffer 在 `epoch` 完成之后回收。
    pub fn flush(
        &mut self,
        ctx: &mut MaterialFlushContext<'_>,
        upload: &mut UploadCoordinator,
    ) -> Result<Option<UploadTicket>, PhaseError> {
        if !self.dirty {
            return Ok(None);
        }

        let bytes: Vec<u8> = bytemuck::cast_slice(&self.records).to_vec();
        let needs_grow = self.buffer.as_ref().is_none_or(|b| b.size() < bytes.len() as u64);
        if needs_grow {
            self.grow(ctx)?;
        }
        let Some(buffer) = self.buffer.as_ref() else {
            return Ok(None);
        };

        let ticket = upload.submit(UploadRequest::buffer("MaterialTable", buffer, 0, bytes));
        self.dirty = false;
        log::debug!("material table uploaded: {} records", self.records.len());
        Ok(Some(ticket))
    }

    pub fn release(&mut self, ctx: &mut MaterialFlushContext<'_>) {
        if let Some(buffer) = self.buffer.take() {
            ctx.tracker.unregister(buffer.handle());
            drop(ctx.bindless.unregister_resource(buffer.handle()));
            ctx.reclaimer.register_deferred_release(Reclaimable::Buffer(buffer), ctx.epoch);
        }
        self.buffer_index = ShaderVisibleIndex::INVALID;
        self.dirty = true;
    }

    fn grow(&mut self, ctx: &mut MaterialFlushContext<'_>) -> Result<(), PhaseError> {
        let capacity = self.records.len().next_power_of_two().max(MIN_CAPACITY);
        let size = (capacity * size_of::<MaterialGpuData>()) as u64;
        let buffer = ctx.device.create_buffer(BufferDesc::new(
            "MaterialTable",
            size,
            BufferUsage::STORAGE | BufferUsage::COPY_DST,
            MemoryLocation::DeviceLocal,
        ))?;

        self.release(ctx);
        self.buffer_index = ctx.bindless.register(
            ctx.device,
            ctx.descriptors,
            BindlessKey::View(buffer.handle(), ViewKind::Srv),
            DescriptorDomain::Materials,
        )?;
        self.buffer = Some(buffer);
        self.dirty = true;
        log::info!("material table capacity: {}", capacity);
        Ok(())
    }
}

/// 材质表上传时用到的 GPU 状态
pub struct MaterialFlushContext<'a> {
    pub device: &'a dyn GfxDevice,
    pub tracker: &'a mut ResourceStateTracker,
    pub descriptors: &'a mut DescriptorAllocator,
    pub bindless: &'a mut BindlessManager,
    pub reclaimer: &'a mut DeferredReclaimer,
    pub epoch: Epoch,
}

/// scene-prep 使用的材质绑定
///
/// 引用的贴图还没有就绪时返回 None，本帧使用默认材质，下一帧再尝试。
pub struct MaterialResolver<'a> {
    pub table: &'a mut MaterialTable,
    pub hub: &'a AssetHub,
    pub device: &'a dyn GfxDevice,
    pub descriptors: &'a mut DescriptorAllocator,
    pub bindless: &'a mut BindlessManager,
}

impl MaterialResolver<'_> {
    fn texture_index(&mut self, label: &str) -> Result<Option<u32>, BindlessError> {
        if label.is_empty() {
            return Ok(Some(ShaderVisibleIndex::INVALID.value()));
        }
        let Some(handle) = self.hub.handle_of(label) else {
            return Ok(None);
        };
        if !matches!(self.hub.status(handle), LoadStatus::Ready) {
            return Ok(None);
        }

        let texture = self.hub.texture(handle);
        let index = self.bindless.register(
            self.device,
            self.descriptors,
            BindlessKey::View(texture.handle(), ViewKind::Srv),
            DescriptorDomain::Textures,
        )?;
        Ok(Some(index.value()))
    }
}

impl MaterialBinder for MaterialResolver<'_> {
    fn bind(&mut self, handle: MaterialHandle, material: &MaterialAsset) -> Option<u32> {
        let base_color_index = match self.texture_index(&material.base_color_map) {
            Ok(index) => index?,
            Err(err) => {
                log::warn!("material \"{}\": {}", material.name, err);
                return None;
            }
        };
        Some(self.table.insert(handle, material, base_color_index))
    }
}
