use std::collections::HashMap;
use std::sync::Arc;

use slotmap::SlotMap;
use thiserror::Error;

use oxy_gfx::device::GfxDevice;
use oxy_gfx::error::GfxError;
use oxy_gfx::resource_state::ResourceState;
use oxy_gfx::resources::{
    BufferDesc, BufferUsage, GfxBuffer, GfxTexture, MemoryLocation, Subresource, TextureDesc, TextureFormat,
    TextureUsage,
};
use oxy_render_interface::epoch::Epoch;
use oxy_render_interface::reclaimer::{DeferredReclaimer, Reclaimable};

use crate::asset_loader::{AssetLoadRequest, AssetLoader, AssetSource, CookedAsset, CookedPayload, LoadResult, LoaderError};
use crate::handle::{AssetHandle, AssetKind, LoadStatus};
use crate::pak::{AssetKey, PakMountTable};
use crate::upload::{UploadCoordinator, UploadRequest, UploadStatus, UploadTicket};

#[derive(Error, Debug)]
pub enum AssetHubError {
    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error(transparent)]
    Gfx(#[from] GfxError),
}

/// 就绪之后的 GPU 资源
#[derive(Clone, Debug)]
pub enum AssetResource {
    Buffer(Arc<GfxBuffer>),
    Texture(Arc<GfxTexture>),
}

struct AssetEntry {
    label: String,
    kind: AssetKind,
    status: LoadStatus,
    /// Uploading 时已经创建，Ready 之后才对外可见
    resource: Option<AssetResource>,
    upload: Option<UploadTicket>,
    error: Option<String>,
}

/// 一次 `update` 推进的数量
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AssetHubUpdate {
    pub cooked: usize,
    pub ready: usize,
    pub failed: usize,
}

/// 资产中心
///
/// 维护所有资产的状态 (Loading -> Uploading -> Ready | Failed)，
/// 把后台线程烘焙好的数据交给上传协调器。
/// 未就绪的纹理返回 1x1 的粉色占位纹理。
pub struct AssetHub {
    entries: SlotMap<AssetHandle, AssetEntry>,

    // label 到句柄的映射，避免重复加载
    cache: HashMap<String, AssetHandle>,

    mounts: PakMountTable,

    fallback_texture: Arc<GfxTexture>,

    loader: AssetLoader,
}

// new & init
impl AssetHub {
    pub fn new(
        device: &dyn GfxDevice,
        upload: &mut UploadCoordinator,
        thread_pool_size: usize,
        inbox_capacity: usize,
    ) -> Result<Self, AssetHubError> {
        let fallback_texture = device.create_texture(TextureDesc::new_2d(
            "FallbackTexture",
            1,
            1,
            TextureFormat::Rgba8Unorm,
            TextureUsage::SAMPLED | TextureUsage::COPY_DST,
        ))?;
        upload.submit(UploadRequest::texture(
            "FallbackTexture",
            &fallback_texture,
            Subresource::new(0, 0),
            vec![255, 0, 255, 255],
        ));

        Ok(Self {
            entries: SlotMap::with_key(),
            cache: HashMap::new(),
            mounts: PakMountTable::new(),
            fallback_texture,
            loader: AssetLoader::new(thread_pool_size, inbox_capacity)?,
        })
    }
}

// getters
impl AssetHub {
    /// 不存在的句柄视为 Unloaded
    pub fn status(&self, handle: AssetHandle) -> LoadStatus {
        self.entries.get(handle).map_or(LoadStatus::Unloaded, |e| e.status)
    }

    pub fn error(&self, handle: AssetHandle) -> Option<&str> {
        self.entries.get(handle).and_then(|e| e.error.as_deref())
    }

    pub fn resource(&self, handle: AssetHandle) -> Option<&AssetResource> {
        let entry = self.entries.get(handle)?;
        if entry.status == LoadStatus::Ready { entry.resource.as_ref() } else { None }
    }

    pub fn buffer(&self, handle: AssetHandle) -> Option<&Arc<GfxBuffer>> {
        match self.resource(handle)? {
            AssetResource::Buffer(buffer) => Some(buffer),
            AssetResource::Texture(_) => None,
        }
    }

    /// 未就绪 (Loading/Uploading/Failed) 时返回占位纹理
    pub fn texture(&self, handle: AssetHandle) -> &Arc<GfxTexture> {
        match self.resource(handle) {
            Some(AssetResource::Texture(texture)) => texture,
            _ => &self.fallback_texture,
        }
    }

    #[inline]
    pub fn fallback_texture(&self) -> &Arc<GfxTexture> {
        &self.fallback_texture
    }

    pub fn handle_of(&self, label: &str) -> Option<AssetHandle> {
        self.cache.get(label).copied()
    }

    pub fn pending_count(&self) -> usize {
        self.entries.values().filter(|e| e.status.is_pending()).count()
    }

    #[inline]
    pub fn mounts(&self) -> &PakMountTable {
        &self.mounts
    }

    #[inline]
    pub fn mounts_mut(&mut self) -> &mut PakMountTable {
        &mut self.mounts
    }
}

// tools
impl AssetHub {
    /// 请求加载
    ///
    /// 非阻塞：相同 label 的请求返回已有的句柄，新请求交给后台线程。
    pub fn load(&mut self, label: impl Into<String>, kind: AssetKind, source: AssetSource) -> AssetHandle {
        let _span = tracy_client::span!("AssetHub::load");
        let label = label.into();
        if let Some(&handle) = self.cache.get(&label) {
            return handle;
        }

        let handle = self.insert_entry(label.clone(), kind, LoadStatus::Loading);
        log::info!("Request load asset \"{}\" from {:?}", label, source);
        self.loader.request_load(AssetLoadRequest {
            handle,
            label,
            kind,
            source,
        });
        handle
    }

    /// 通过 mount 表加载；无法解析的 key 直接得到 Failed 的句柄
    pub fn load_key(&mut self, key: AssetKey, kind: AssetKind) -> AssetHandle {
        let label = key.to_string();
        if let Some(&handle) = self.cache.get(&label) {
            return handle;
        }

        match self.mounts.resolve(key) {
            Ok(source) => self.load(label, kind, source),
            Err(e) => {
                log::error!("cannot resolve asset {}: {}", key, e);
                let handle = self.insert_entry(label, kind, LoadStatus::Failed);
                if let Some(entry) = self.entries.get_mut(handle) {
                    entry.error = Some(e.to_string());
                }
                handle
            }
        }
    }

    /// 移除资产，GPU 资源在 `epoch` 退休之后释放
    pub fn unload(&mut self, handle: AssetHandle, reclaimer: &mut DeferredReclaimer, epoch: Epoch) -> bool {
        let Some(entry) = self.entries.remove(handle) else {
            return false;
        };
        self.cache.remove(&entry.label);
        match entry.resource {
            Some(AssetResource::Buffer(buffer)) => {
                reclaimer.register_deferred_release(Reclaimable::Buffer(buffer), epoch);
            }
            Some(AssetResource::Texture(texture)) => {
                reclaimer.register_deferred_release(Reclaimable::Texture(texture), epoch);
            }
            None => {}
        }
        true
    }

    /// 驱动加载流程（每帧在阶段边界调用）
    ///
    /// 1. 取走后台线程烘焙好的数据，创建 GPU 资源并提交上传
    /// 2. 检查上传结果，标记为 Ready 或 Failed
    pub fn update(&mut self, device: &dyn GfxDevice, upload: &mut UploadCoordinator) -> AssetHubUpdate {
        let _span = tracy_client::span!("AssetHub::update");
        let mut result = AssetHubUpdate::default();

        while let Some(load_result) = self.loader.try_recv_result() {
            match load_result {
                LoadResult::Success(payload) => {
                    result.cooked += 1;
                    let handle = payload.handle;
                    // 加载过程中被 unload 的资产直接丢弃
                    if !self.entries.contains_key(handle) {
                        continue;
                    }
                    match Self::begin_upload(device, upload, payload) {
                        Ok((resource, ticket)) => {
                            if let Some(entry) = self.entries.get_mut(handle) {
                                entry.status = LoadStatus::Uploading;
                                entry.resource = Some(resource);
                                entry.upload = Some(ticket);
                            }
                        }
                        Err(e) => {
                            log::error!("Failed to create GPU resource for {:?}: {}", handle, e);
                            self.mark_failed(handle, e.to_string());
                            result.failed += 1;
                        }
                    }
                }
                LoadResult::Failure(handle, err) => {
                    self.mark_failed(handle, err);
                    result.failed += 1;
                }
            }
        }

        for (handle, entry) in self.entries.iter_mut() {
            if entry.status != LoadStatus::Uploading {
                continue;
            }
            let Some(ticket) = entry.upload else {
                continue;
            };
            match upload.result(ticket) {
                Some(UploadStatus::Complete { .. }) => {
                    upload.take_result(ticket);
                    entry.upload = None;
                    entry.status = LoadStatus::Ready;
                    result.ready += 1;
                    log::info!("Upload finished for asset \"{}\" ({:?})", entry.label, handle);
                }
                Some(UploadStatus::Failed(e)) => {
                    log::error!("Upload failed for asset \"{}\": {}", entry.label, e);
                    entry.error = Some(e.to_string());
                    upload.take_result(ticket);
                    entry.upload = None;
                    entry.resource = None;
                    entry.status = LoadStatus::Failed;
                    result.failed += 1;
                }
                Some(_) => {}
                None => {
                    entry.status = LoadStatus::Failed;
                    entry.error = Some(format!("upload ticket {} lost", ticket.id()));
                    result.failed += 1;
                }
            }
        }

        result
    }

    fn insert_entry(&mut self, label: String, kind: AssetKind, status: LoadStatus) -> AssetHandle {
        let handle = self.entries.insert(AssetEntry {
            label: label.clone(),
            kind,
            status,
            resource: None,
            upload: None,
            error: None,
        });
        self.cache.insert(label, handle);
        handle
    }

    fn mark_failed(&mut self, handle: AssetHandle, error: String) {
        if let Some(entry) = self.entries.get_mut(handle) {
            log::error!("asset \"{}\" ({:?}) failed: {}", entry.label, entry.kind, error);
            entry.status = LoadStatus::Failed;
            entry.error = Some(error);
        }
    }

    fn begin_upload(
        device: &dyn GfxDevice,
        upload: &mut UploadCoordinator,
        payload: CookedPayload,
    ) -> Result<(AssetResource, UploadTicket), GfxError> {
        let CookedPayload { label, asset, .. } = payload;
        match asset {
            CookedAsset::Buffer { bytes } => {
                let buffer = device.create_buffer(BufferDesc::new(
                    label.as_str(),
                    bytes.len() as u64,
                    BufferUsage::VERTEX | BufferUsage::INDEX | BufferUsage::STORAGE | BufferUsage::COPY_DST,
                    MemoryLocation::DeviceLocal,
                ))?;
                let ticket = upload.submit(UploadRequest::buffer(label, &buffer, 0, bytes));
                Ok((AssetResource::Buffer(buffer), ticket))
            }
            CookedAsset::Texture {
                width,
                height,
                format,
                pixels,
            } => {
                let texture = device.create_texture(TextureDesc::new_2d(
                    label.as_str(),
                    width,
                    height,
                    format,
                    TextureUsage::SAMPLED | TextureUsage::COPY_DST,
                ))?;
                let ticket = upload.submit(
                    UploadRequest::texture(label, &texture, Subresource::new(0, 0), pixels)
                        .with_final_state(ResourceState::SHADER_RESOURCE),
                );
                Ok((AssetResource::Texture(texture), ticket))
            }
        }
    }
}
