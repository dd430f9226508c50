//! scene-prep：把场景和 view 变成一帧的 draw 数据
//!
//! 对每个 view 深度优先遍历场景，做视锥剔除和 LOD 选择，
//! 把世界变换去重后写入 transform 数组，输出 `DrawMetadata` 和按 pass 划分的 bucket。
//! 几何驻留和材质绑定的结果跨帧缓存，每帧的输出 buffer 在进入时重置。

use std::collections::HashMap;
use std::sync::Arc;

use glam::Mat4;

use oxy_render_interface::descriptor::ShaderVisibleIndex;
use oxy_render_interface::render_data::{DrawFlags, DrawMetadata, FrameViewPacket, PassBuckets, PreparedFrame, RenderView};

use crate::components::geometry::{BoundingSphere, GeometryAsset};
use crate::components::material::{AlphaMode, MaterialAsset};
use crate::frustum::Frustum;
use crate::guid_new_type::{GeometryHandle, MaterialHandle, NodeHandle};
use crate::scene::{NodeFlags, Scene};

/// 几何在 GPU 上的位置
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GeometryBinding {
    pub vertex_buffer: ShaderVisibleIndex,
    pub index_buffer: ShaderVisibleIndex,
}

/// 查询几何是否已经驻留在 GPU 上
pub trait GeometryResidency {
    /// None 表示还没有驻留，本帧跳过这个几何
    fn resolve(&mut self, handle: GeometryHandle, geometry: &GeometryAsset, lod: u32) -> Option<GeometryBinding>;
}

/// 为材质分配 shader 使用的 material handle
pub trait MaterialBinder {
    /// 返回非 0 的 handle；None 表示暂时不能绑定，本帧使用默认材质
    fn bind(&mut self, handle: MaterialHandle, material: &MaterialAsset) -> Option<u32>;
}

/// 一个被选中的 draw
#[derive(Clone, Debug, PartialEq)]
pub struct RenderItemData {
    pub node: NodeHandle,
    pub view_index: u32,
    pub lod: u32,
    pub submesh: u32,
    pub geometry: GeometryHandle,
    pub material: Option<MaterialHandle>,
    pub world_sphere: BoundingSphere,
    pub world_transform: Mat4,
    pub flags: DrawFlags,
    pub distance: f32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScenePrepStats {
    pub views: u32,
    /// 参与剔除的可绘制节点数（按 view 累计）
    pub visited: u32,
    pub culled: u32,
    pub emitted: u32,
    pub non_resident: u32,
    pub fallback_materials: u32,
}

#[derive(Default)]
pub struct ScenePrep {
    // 每帧重置
    items: Vec<RenderItemData>,
    draws: Vec<DrawMetadata>,
    transforms: Vec<Mat4>,
    transform_index: HashMap<NodeHandle, u32>,
    stats: ScenePrepStats,

    // 跨帧保留
    geometry_cache: HashMap<(GeometryHandle, u32), GeometryBinding>,
    material_cache: HashMap<MaterialHandle, u32>,
}

// new & init
impl ScenePrep {
    pub fn new() -> Self {
        Self::default()
    }
}

// getters
impl ScenePrep {
    /// 上一次 `prepare` 的结果
    #[inline]
    pub fn items(&self) -> &[RenderItemData] {
        &self.items
    }

    #[inline]
    pub fn stats(&self) -> ScenePrepStats {
        self.stats
    }

    #[inline]
    pub fn cached_geometry_count(&self) -> usize {
        self.geometry_cache.len()
    }

    #[inline]
    pub fn cached_material_count(&self) -> usize {
        self.material_cache.len()
    }
}

// update
impl ScenePrep {
    /// 几何数据被替换后调用
    pub fn invalidate_geometry(&mut self, handle: GeometryHandle) {
        self.geometry_cache.retain(|(h, _), _| *h != handle);
    }

    /// 生成一帧的 draw 数据
    ///
    /// 对相同的场景快照和 view 结果是确定的。
    pub fn prepare(
        &mut self,
        scene: &Scene,
        views: &[RenderView],
        residency: &mut dyn GeometryResidency,
        binder: &mut dyn MaterialBinder,
    ) -> PreparedFrame {
        let _span = tracy_client::span!("ScenePrep::prepare");

        self.items.clear();
        self.draws.clear();
        self.transforms.clear();
        self.transform_index.clear();
        self.stats = ScenePrepStats::default();

        let mut order = Vec::with_capacity(scene.node_count());
        scene.traverse(|handle, _| order.push(handle));

        let mut packets = Vec::with_capacity(views.len());
        for (view_index, view) in views.iter().enumerate() {
            let start = self.draws.len() as u32;
            let buckets = self.prepare_view(scene, &order, view_index as u32, view, residency, binder);
            let end = self.draws.len() as u32;

            packets.push(FrameViewPacket {
                view: view.camera.clone(),
                viewport: view.viewport,
                opacity: view.opacity,
                composite_target: view.composite_target.clone(),
                draw_range: start..end,
                buckets,
            });
            self.stats.views += 1;
        }

        log::trace!(
            "scene-prep: {} views, {} draws, {} culled, {} transforms",
            self.stats.views,
            self.stats.emitted,
            self.stats.culled,
            self.transforms.len()
        );

        PreparedFrame {
            draws: Arc::from(self.draws.as_slice()),
            transforms: Arc::from(self.transforms.as_slice()),
            packets,
        }
    }
}

// tools
impl ScenePrep {
    fn prepare_view(
        &mut self,
        scene: &Scene,
        order: &[NodeHandle],
        view_index: u32,
        view: &RenderView,
        residency: &mut dyn GeometryResidency,
        binder: &mut dyn MaterialBinder,
    ) -> PassBuckets {
        let frustum = Frustum::from_matrix(view.camera.view_projection());
        let mut buckets = PassBuckets::default();
        let mut transparent: Vec<(f32, u32)> = Vec::new();

        for &handle in order {
            let Some(node) = scene.node(handle) else {
                continue;
            };
            if !node.flags.contains(NodeFlags::VISIBLE) {
                continue;
            }
            let Some(renderable) = &node.renderable else {
                continue;
            };
            let Some(geometry) = scene.geometry(renderable.geometry) else {
                self.stats.non_resident += 1;
                continue;
            };

            self.stats.visited += 1;
            let world = *node.world_transform();
            let sphere = geometry.bounds.transformed(&world);
            if !frustum.intersects(&sphere) {
                self.stats.culled += 1;
                continue;
            }

            let distance = (sphere.center - view.camera.position).length();
            let Some(lod) = geometry.select_lod(distance) else {
                continue;
            };
            let Some(binding) = self.resolve_geometry(residency, renderable.geometry, geometry, lod) else {
                self.stats.non_resident += 1;
                continue;
            };
            let Some(lod_data) = geometry.lod(lod) else {
                continue;
            };
            let transform_index = self.intern_transform(handle, world);

            for (submesh_index, submesh) in lod_data.submeshes.iter().enumerate() {
                let material = renderable.materials.get(submesh.material_slot as usize).copied();
                let material_asset = material.and_then(|m| scene.material(m));
                let alpha_mode = material_asset.map_or(AlphaMode::Opaque, |m| m.alpha_mode);

                let mut flags = DrawFlags::INDEXED;
                let material_handle = match (material, material_asset) {
                    (Some(material), Some(asset)) => self.bind_material(binder, material, asset),
                    // 没有指定材质时使用默认材质，不算作回退
                    _ => Some(0),
                };
                let material_handle = material_handle.unwrap_or_else(|| {
                    self.stats.fallback_materials += 1;
                    flags |= DrawFlags::FALLBACK_MATERIAL;
                    0
                });
                match alpha_mode {
                    AlphaMode::Opaque => {}
                    AlphaMode::Mask { .. } => flags |= DrawFlags::ALPHA_MASKED,
                    AlphaMode::Blend => flags |= DrawFlags::TRANSPARENT,
                }
                if node.flags.contains(NodeFlags::CAST_SHADOWS) {
                    flags |= DrawFlags::CAST_SHADOWS;
                }

                let draw_index = self.draws.len() as u32;
                self.draws.push(DrawMetadata {
                    vertex_buffer_index: binding.vertex_buffer.value(),
                    index_buffer_index: binding.index_buffer.value(),
                    first_index: submesh.first_index,
                    index_count: submesh.index_count,
                    vertex_offset: submesh.vertex_offset,
                    transform_index,
                    material_handle,
                    instance_index: draw_index,
                    instance_count: 1,
                    lod_level: lod,
                    submesh_index: submesh_index as u32,
                    view_index,
                    flags: flags.bits(),
                });
                self.items.push(RenderItemData {
                    node: handle,
                    view_index,
                    lod,
                    submesh: submesh_index as u32,
                    geometry: renderable.geometry,
                    material,
                    world_sphere: sphere,
                    world_transform: world,
                    flags,
                    distance,
                });
                self.stats.emitted += 1;

                match alpha_mode {
                    AlphaMode::Opaque => buckets.opaque.push(draw_index),
                    AlphaMode::Mask { .. } => buckets.masked.push(draw_index),
                    AlphaMode::Blend => transparent.push((distance, draw_index)),
                }
                if flags.contains(DrawFlags::CAST_SHADOWS) && !flags.contains(DrawFlags::TRANSPARENT) {
                    buckets.shadow.push(draw_index);
                }
            }
        }

        // 透明物体由远到近，距离相同时保持遍历顺序
        transparent.sort_by(|a, b| b.0.total_cmp(&a.0));
        buckets.transparent = transparent.into_iter().map(|(_, index)| index).collect();
        buckets
    }

    fn intern_transform(&mut self, node: NodeHandle, world: Mat4) -> u32 {
        if let Some(&index) = self.transform_index.get(&node) {
            return index;
        }
        let index = self.transforms.len() as u32;
        self.transforms.push(world);
        self.transform_index.insert(node, index);
        index
    }

    fn resolve_geometry(
        &mut self,
        residency: &mut dyn GeometryResidency,
        handle: GeometryHandle,
        geometry: &GeometryAsset,
        lod: u32,
    ) -> Option<GeometryBinding> {
        if let Some(binding) = self.geometry_cache.get(&(handle, lod)) {
            return Some(*binding);
        }
        let binding = residency.resolve(handle, geometry, lod)?;
        self.geometry_cache.insert((handle, lod), binding);
        Some(binding)
    }

    fn bind_material(
        &mut self,
        binder: &mut dyn MaterialBinder,
        handle: MaterialHandle,
        material: &MaterialAsset,
    ) -> Option<u32> {
        if let Some(&index) = self.material_cache.get(&handle) {
            return Some(index);
        }
        let index = binder.bind(handle, material)?;
        self.material_cache.insert(handle, index);
        Some(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use oxy_render_interface::render_data::{ViewDesc, Viewport};

    use crate::components::geometry::{GeometryLod, Submesh};
    use crate::components::transform::Transform;
    use crate::scene::Renderable;

    #[derive(Default)]
    struct Residency {
        calls: u32,
        missing: Vec<GeometryHandle>,
    }

    impl GeometryResidency for Residency {
        fn resolve(&mut self, handle: GeometryHandle, _: &GeometryAsset, lod: u32) -> Option<GeometryBinding> {
            self.calls += 1;
            if self.missing.contains(&handle) {
                return None;
            }
            Some(GeometryBinding {
                vertex_buffer: ShaderVisibleIndex::new(100 + lod),
                index_buffer: ShaderVisibleIndex::new(200 + lod),
            })
        }
    }

    #[derive(Default)]
    struct Binder {
        calls: u32,
        refuse: Vec<MaterialHandle>,
    }

    impl MaterialBinder for Binder {
        fn bind(&mut self, handle: MaterialHandle, _: &MaterialAsset) -> Option<u32> {
            self.calls += 1;
            if self.refuse.contains(&handle) { None } else { Some(self.calls) }
        }
    }

    fn camera_view() -> RenderView {
        RenderView::new(
            ViewDesc::look_at("main", Vec3::ZERO, Vec3::NEG_Z, std::f32::consts::FRAC_PI_2, 1.0, 0.1, 500.0),
            Viewport::new(64.0, 64.0),
        )
    }

    fn place(scene: &mut Scene, name: &str, z: f32, renderable: Renderable) -> NodeHandle {
        let node = scene.create_node(name, None).unwrap();
        scene
            .set_local_transform(node, Transform::from_translation(Vec3::new(0.0, 0.0, z)))
            .unwrap();
        scene.set_renderable(node, Some(renderable)).unwrap();
        node
    }

    fn unit_geometry(scene: &mut Scene) -> GeometryHandle {
        scene.add_geometry(GeometryAsset::single("unit", BoundingSphere::new(Vec3::ZERO, 1.0), 36))
    }

    #[test]
    fn test_prepare_is_deterministic() {
        let mut scene = Scene::new("det");
        let geometry = unit_geometry(&mut scene);
        let material = scene.add_material(MaterialAsset::new("m"));
        for i in 0..4 {
            place(
                &mut scene,
                &format!("n{i}"),
                -5.0 - i as f32,
                Renderable {
                    geometry,
                    materials: vec![material],
                },
            );
        }
        scene.propagate_transforms();

        let mut prep = ScenePrep::new();
        let mut residency = Residency::default();
        let mut binder = Binder::default();
        let first = prep.prepare(&scene, &[camera_view()], &mut residency, &mut binder);
        let second = prep.prepare(&scene, &[camera_view()], &mut residency, &mut binder);

        assert_eq!(first.draws.len(), 4);
        assert_eq!(first.draws, second.draws);
        assert_eq!(first.transforms, second.transforms);
        // 缓存跨帧保留
        assert_eq!(residency.calls, 1);
        assert_eq!(binder.calls, 1);
        assert_eq!(prep.cached_geometry_count(), 1);
    }

    #[test]
    fn test_culling_and_lod() {
        let mut scene = Scene::new("cull");
        let lodded = scene.add_geometry(GeometryAsset {
            name: "lodded".into(),
            bounds: BoundingSphere::new(Vec3::ZERO, 1.0),
            lods: vec![
                GeometryLod {
                    submeshes: vec![Submesh {
                        first_index: 0,
                        index_count: 300,
                        vertex_offset: 0,
                        material_slot: 0,
                    }],
                    max_distance: 20.0,
                },
                GeometryLod {
                    submeshes: vec![Submesh {
                        first_index: 300,
                        index_count: 30,
                        vertex_offset: 0,
                        material_slot: 0,
                    }],
                    max_distance: f32::INFINITY,
                },
            ],
        });
        let renderable = Renderable {
            geometry: lodded,
            materials: vec![],
        };
        let near = place(&mut scene, "near", -10.0, renderable.clone());
        let far = place(&mut scene, "far", -100.0, renderable.clone());
        place(&mut scene, "behind", 10.0, renderable);
        scene.propagate_transforms();

        let mut prep = ScenePrep::new();
        let frame = prep.prepare(&scene, &[camera_view()], &mut Residency::default(), &mut Binder::default());

        assert_eq!(prep.stats().culled, 1);
        assert_eq!(frame.draws.len(), 2);
        let items = prep.items();
        assert_eq!((items[0].node, items[0].lod), (near, 0));
        assert_eq!((items[1].node, items[1].lod), (far, 1));
        assert_eq!(frame.draws[1].first_index, 300);
        assert_eq!(frame.draws[1].vertex_buffer_index, 101);
        // 没有材质时使用默认材质，不是回退
        assert_eq!(frame.draws[0].material_handle, 0);
        assert!(!frame.draws[0].draw_flags().contains(DrawFlags::FALLBACK_MATERIAL));
    }

    #[test]
    fn test_buckets() {
        let mut scene = Scene::new("buckets");
        let geometry = unit_geometry(&mut scene);
        let opaque = scene.add_material(MaterialAsset::new("opaque"));
        let masked = scene.add_material(MaterialAsset::new("masked").with_alpha_mode(AlphaMode::Mask { cutoff: 0.5 }));
        let glass = scene.add_material(MaterialAsset::new("glass").with_alpha_mode(AlphaMode::Blend));

        let with = |material| Renderable {
            geometry,
            materials: vec![material],
        };
        place(&mut scene, "opaque", -5.0, with(opaque));
        let no_shadow = place(&mut scene, "no-shadow", -6.0, with(opaque));
        scene.set_flags(no_shadow, NodeFlags::VISIBLE).unwrap();
        place(&mut scene, "masked", -7.0, with(masked));
        place(&mut scene, "glass-near", -8.0, with(glass));
        place(&mut scene, "glass-far", -30.0, with(glass));
        let hidden = place(&mut scene, "hidden", -5.0, with(opaque));
        scene.set_flags(hidden, NodeFlags::empty()).unwrap();
        scene.propagate_transforms();

        let mut prep = ScenePrep::new();
        let frame = prep.prepare(&scene, &[camera_view()], &mut Residency::default(), &mut Binder::default());
        let buckets = &frame.packets[0].buckets;

        assert_eq!(buckets.opaque, vec![0, 1]);
        assert_eq!(buckets.masked, vec![2]);
        // 由远到近
        assert_eq!(buckets.transparent, vec![4, 3]);
        // 关闭阴影的节点和透明物体不进入 shadow bucket
        assert_eq!(buckets.shadow, vec![0, 2]);
        assert!(frame.draws[2].draw_flags().contains(DrawFlags::ALPHA_MASKED));
    }

    #[test]
    fn test_fallbacks_and_multiple_views() {
        let mut scene = Scene::new("fallback");
        let resident = unit_geometry(&mut scene);
        let streaming = unit_geometry(&mut scene);
        let pending = scene.add_material(MaterialAsset::new("pending"));

        let node = place(
            &mut scene,
            "a",
            -5.0,
            Renderable {
                geometry: resident,
                materials: vec![pending],
            },
        );
        place(
            &mut scene,
            "b",
            -5.0,
            Renderable {
                geometry: streaming,
                materials: vec![],
            },
        );
        scene.propagate_transforms();

        let mut residency = Residency {
            missing: vec![streaming],
            ..Default::default()
        };
        let mut binder = Binder {
            refuse: vec![pending],
            ..Default::default()
        };
        let mut prep = ScenePrep::new();
        let frame = prep.prepare(&scene, &[camera_view(), camera_view()], &mut residency, &mut binder);

        assert_eq!(prep.stats().non_resident, 2);
        assert_eq!(prep.stats().fallback_materials, 2);
        assert_eq!(frame.packets.len(), 2);
        assert_eq!(frame.packets[0].draw_range, 0..1);
        assert_eq!(frame.packets[1].draw_range, 1..2);
        assert_eq!(frame.draws[1].view_index, 1);
        // 两个 view 共享同一个 transform
        assert_eq!(frame.transforms.len(), 1);
        assert_eq!(frame.draws[0].transform_index, frame.draws[1].transform_index);
        assert!(frame.draws[0].draw_flags().contains(DrawFlags::FALLBACK_MATERIAL));
        assert_eq!(prep.items()[0].node, node);
        // 未能绑定的材质不缓存，下一帧重试
        assert_eq!(prep.cached_material_count(), 0);
    }
}
