use std::mem;

use oxy_asset::asset_loader::AssetSource;
use oxy_asset::handle::AssetKind;
use oxy_render_interface::render_data::RenderView;
use oxy_scene::guid_new_type::GeometryHandle;
use oxy_scene::scene::Scene;

use crate::geometry_cache::GeometryData;

/// 一个等待交给 AssetHub 的加载请求
#[derive(Debug)]
pub struct PendingLoad {
    pub label: String,
    pub kind: AssetKind,
    pub source: AssetSource,
}

/// 模块之间共享的渲染世界
///
/// 作为 `FrameContext` 的资源存在：gameplay 模块修改场景和 view，
/// 渲染模块在之后的阶段读取。几何数据和资产加载请求先暂存在这里，
/// 在下一个 FrameStart 交给渲染模块。
pub struct RenderWorld {
    pub scene: Scene,
    pub views: Vec<RenderView>,

    pending_geometry: Vec<(GeometryHandle, GeometryData)>,
    pending_loads: Vec<PendingLoad>,
}

// new & init
impl RenderWorld {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            scene: Scene::new(name),
            views: Vec::new(),
            pending_geometry: Vec::new(),
            pending_loads: Vec::new(),
        }
    }
}

// update
impl RenderWorld {
    /// 为场景中的几何提供顶点和索引数据
    pub fn stage_geometry(&mut self, handle: GeometryHandle, data: GeometryData) {
        self.pending_geometry.push((handle, data));
    }

    /// 请求加载一个资产，例如材质引用的贴图
    pub fn request_load(&mut self, label: impl Into<String>, kind: AssetKind, source: AssetSource) {
        self.pending_loads.push(PendingLoad {
            label: label.into(),
            kind,
            source,
        });
    }

    pub fn take_pending_geometry(&mut self) -> Vec<(GeometryHandle, GeometryData)> {
        mem::take(&mut self.pending_geometry)
    }

    pub fn take_pending_loads(&mut self) -> Vec<PendingLoad> {
        mem::take(&mut self.pending_loads)
    }
}

// getters
impl RenderWorld {
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending_geometry.len() + self.pending_loads.len()
    }
}
