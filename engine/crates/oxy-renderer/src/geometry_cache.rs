use std::collections::HashMap;
use std::sync::Arc;

use bytemuck::Pod;

use oxy_asset::upload::{UploadCoordinator, UploadRequest, UploadStatus, UploadTicket};
use oxy_gfx::device::{GfxDevice, ViewKind};
use oxy_gfx::error::GfxError;
use oxy_gfx::resource_state::ResourceState;
use oxy_gfx::resources::{BufferDesc, BufferUsage, GfxBuffer, MemoryLocation};
use oxy_render_interface::bindless_manager::{BindlessKey, BindlessManager};
use oxy_render_interface::descriptor::{DescriptorAllocator, DescriptorDomain};
use oxy_render_interface::epoch::Epoch;
use oxy_render_interface::phase_error::PhaseError;
use oxy_render_interface::reclaimer::{DeferredReclaimer, Reclaimable};
use oxy_render_interface::state_tracker::ResourceStateTracker;
use oxy_scene::components::geometry::GeometryAsset;
use oxy_scene::guid_new_type::GeometryHandle;
use oxy_scene::scene_prep::{GeometryBinding, GeometryResidency};

/// CPU 侧的顶点和索引数据
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GeometryData {
    pub vertices: Vec<u8>,
    pub indices: Vec<u32>,
}

impl GeometryData {
    pub fn from_vertices<V: Pod>(vertices: &[V], indices: &[u32]) -> Self {
        Self {
            vertices: bytemuck::cast_slice(vertices).to_vec(),
            indices: indices.to_vec(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Residency {
    Uploading,
    Resident(GeometryBinding),
    Failed,
}

struct GeometryEntry {
    vertex_buffer: Arc<GfxBuffer>,
    index_buffer: Arc<GfxBuffer>,
    tickets: [UploadTicket; 2],
    residency: Residency,
}

/// 几何的 GPU 驻留表
///
/// 顶点和索引数据通过上传协调器写入 device local buffer，
/// 两次上传都完成之后在 GlobalSrv 域注册 bindless 下标，几何才对 scene-prep 可见。
#[derive(Default)]
pub struct GeometryCache {
    entries: HashMap<GeometryHandle, GeometryEntry>,
}

// new & init
impl GeometryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

// getters
impl GeometryCache {
    pub fn residency(&self, handle: GeometryHandle) -> Option<Residency> {
        self.entries.get(&handle).map(|e| e.residency)
    }

    pub fn resident_count(&self) -> usize {
        self.entries.values().filter(|e| matches!(e.residency, Residency::Resident(_))).count()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// update
impl GeometryCache {
    /// 创建 GPU buffer 并提交上传
    ///
    /// 同一个 handle 重复注册时旧的 buffer 要先通过 `remove` 释放。
    pub fn register(
        &mut self,
        device: &dyn GfxDevice,
        upload: &mut UploadCoordinator,
        handle: GeometryHandle,
        data: GeometryData,
    ) -> Result<(), GfxError> {
        let name = format!("geometry{:?}", handle);
        let vertex_buffer = device.create_buffer(BufferDesc::new(
            format!("{name}-vertex"),
            data.vertices.len().max(4) as u64,
            BufferUsage::VERTEX | BufferUsage::STORAGE | BufferUsage::COPY_DST,
            MemoryLocation::DeviceLocal,
        ))?;
        let index_bytes: Vec<u8> = bytemuck::cast_slice(&data.indices).to_vec();
        let index_buffer = device.create_buffer(BufferDesc::new(
            format!("{name}-index"),
            index_bytes.len().max(4) as u64,
            BufferUsage::INDEX | BufferUsage::STORAGE | BufferUsage::COPY_DST,
            MemoryLocation::DeviceLocal,
        ))?;

        let vertex_ticket = upload.submit(UploadRequest::buffer(format!("{name}-vertex"), &vertex_buffer, 0, data.vertices));
        let index_ticket = upload.submit(
            UploadRequest::buffer(format!("{name}-index"), &index_buffer, 0, index_bytes)
                .with_final_state(ResourceState::SHADER_RESOURCE | ResourceState::INDEX_BUFFER),
        );

        log::debug!("geometry {:?} uploading", handle);
        self.entries.insert(
            handle,
            GeometryEntry {
                vertex_buffer,
                index_buffer,
                tickets: [vertex_ticket, index_ticket],
                residency: Residency::Uploading,
            },
        );
        Ok(())
    }

    /// 把上传完成的几何变为驻留，返回本次变为驻留的数量
    pub fn poll(
        &mut self,
        device: &dyn GfxDevice,
        upload: &mut UploadCoordinator,
        descriptors: &mut DescriptorAllocator,
        bindless: &mut BindlessManager,
    ) -> Result<usize, PhaseError> {
        let mut promoted = 0;
        for (handle, entry) in self.entries.iter_mut() {
            if entry.residency != Residency::Uploading {
                continue;
            }

            let statuses = entry.tickets.map(|ticket| upload.result(ticket).cloned());
            if statuses.iter().any(|s| matches!(s, Some(UploadStatus::Failed(_)))) {
                for (ticket, status) in entry.tickets.iter().zip(&statuses) {
                    if let Some(UploadStatus::Failed(err)) = status {
                        log::error!("geometry {:?} upload failed: {}", handle, err);
                    }
                    upload.take_result(*ticket);
                }
                entry.residency = Residency::Failed;
                continue;
            }
            if !statuses.iter().all(|s| matches!(s, Some(UploadStatus::Complete { .. }))) {
                continue;
            }

            let vertex = bindless.register(
                device,
                descriptors,
                BindlessKey::View(entry.vertex_buffer.handle(), ViewKind::Srv),
                DescriptorDomain::GlobalSrv,
            )?;
            let index = bindless.register(
                device,
                descriptors,
                BindlessKey::View(entry.index_buffer.handle(), ViewKind::Srv),
                DescriptorDomain::GlobalSrv,
            )?;
            for ticket in entry.tickets {
                upload.take_result(ticket);
            }

            entry.residency = Residency::Resident(GeometryBinding {
                vertex_buffer: vertex,
                index_buffer: index,
            });
            promoted += 1;
            log::debug!("geometry {:?} resident: vb {:?}, ib {:?}", handle, vertex, index);
        }
        Ok(promoted)
    }

    /// 释放一个几何，buffer 和 descriptor 在 `epoch` 完成之后回收
    pub fn remove(
        &mut self,
        handle: GeometryHandle,
        tracker: &mut ResourceStateTracker,
        bindless: &mut BindlessManager,
        reclaimer: &mut DeferredReclaimer,
        epoch: Epoch,
    ) -> bool {
        let Some(entry) = self.entries.remove(&handle) else {
            return false;
        };
        Self::release_entry(entry, tracker, bindless, reclaimer, epoch);
        true
    }

    pub fn clear(
        &mut self,
        tracker: &mut ResourceStateTracker,
        bindless: &mut BindlessManager,
        reclaimer: &mut DeferredReclaimer,
        epoch: Epoch,
    ) {
        for (_, entry) in self.entries.drain() {
            Self::release_entry(entry, tracker, bindless, reclaimer, epoch);
        }
    }

    fn release_entry(
        entry: GeometryEntry,
        tracker: &mut ResourceStateTracker,
        bindless: &mut BindlessManager,
        reclaimer: &mut DeferredReclaimer,
        epoch: Epoch,
    ) {
        for buffer in [entry.vertex_buffer, entry.index_buffer] {
            tracker.unregister(buffer.handle());
            drop(bindless.unregister_resource(buffer.handle()));
            reclaimer.register_deferred_release(Reclaimable::Buffer(buffer), epoch);
        }
    }
}

impl GeometryResidency for GeometryCache {
    /// 所有 LOD 共用同一对 buffer
    fn resolve(&mut self, handle: GeometryHandle, _geometry: &GeometryAsset, _lod: u32) -> Option<GeometryBinding> {
        match self.entries.get(&handle)?.residency {
            Residency::Resident(binding) => Some(binding),
            Residency::Uploading | Residency::Failed => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use oxy_asset::upload::{UploadContext, UploadPolicy};
    use oxy_gfx::commands::pool::CommandListPool;
    use oxy_gfx::headless::{CompletionMode, HeadlessDevice};
    use oxy_gfx::queue::{QueueKey, QueueRole};
    use oxy_scene::components::geometry::BoundingSphere;
    use oxy_scene::scene::Scene;

    #[test]
    fn test_resident_after_upload_completes() {
        let key = QueueKey::new("copy");
        let device = HeadlessDevice::new(&[key.clone()]);
        let queue = device.headless_queue(&key).unwrap();
        queue.set_completion_mode(CompletionMode::Manual);

        let mut upload = UploadCoordinator::with_per_request_staging(device.clone(), UploadPolicy::new(key)).unwrap();
        let mut tracker = ResourceStateTracker::new();
        let mut reclaimer = DeferredReclaimer::new();
        let mut pool = CommandListPool::new(QueueRole::Transfer);
        let mut descriptors = DescriptorAllocator::new();
        let mut bindless = BindlessManager::new();
        let mut cache = GeometryCache::new();

        let asset = GeometryAsset::single("tri", BoundingSphere::new(glam::Vec3::ZERO, 1.0), 3);
        let handle = Scene::new("test").add_geometry(asset.clone());
        let data = GeometryData::from_vertices(&[[0.0f32; 3]; 3], &[0, 1, 2]);
        cache.register(&*device, &mut upload, handle, data).unwrap();
        assert_eq!(cache.resolve(handle, &asset, 0), None);

        let mut ctx = UploadContext {
            tracker: &mut tracker,
            reclaimer: &mut reclaimer,
            pool: &mut pool,
            epoch: Epoch::new(1),
        };
        upload.flush(&mut ctx).unwrap().unwrap();

        // fence 没有完成时保持 Uploading
        upload.retire();
        assert_eq!(cache.poll(&*device, &mut upload, &mut descriptors, &mut bindless).unwrap(), 0);
        assert_eq!(cache.residency(handle), Some(Residency::Uploading));

        queue.complete_all();
        upload.retire();
        assert_eq!(cache.poll(&*device, &mut upload, &mut descriptors, &mut bindless).unwrap(), 1);
        let binding = cache.resolve(handle, &asset, 0).unwrap();
        assert!(binding.vertex_buffer.is_valid());
        assert_ne!(binding.vertex_buffer, binding.index_buffer);
        assert_eq!(bindless.len(), 2);

        let before = reclaimer.pending_count();
        assert!(cache.remove(handle, &mut tracker, &mut bindless, &mut reclaimer, Epoch::new(2)));
        assert!(bindless.is_empty());
        assert_eq!(reclaimer.pending_count(), before + 2);
        reclaimer.drain_all();
    }
}
