use glam::{Mat4, Vec3};

/// 包围球
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BoundingSphere {
    pub center: Vec3,
    pub radius: f32,
}

impl BoundingSphere {
    pub const fn new(center: Vec3, radius: f32) -> Self {
        Self { center, radius }
    }

    /// 变换到世界空间，半径按最大的轴向缩放放大
    pub fn transformed(&self, world: &Mat4) -> Self {
        let center = world.transform_point3(self.center);
        let scale = world
            .x_axis
            .truncate()
            .length()
            .max(world.y_axis.truncate().length())
            .max(world.z_axis.truncate().length());
        Self {
            center,
            radius: self.radius * scale,
        }
    }
}

/// 一个 LOD 中使用同一个材质槽的一段索引
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Submesh {
    pub first_index: u32,
    pub index_count: u32,
    pub vertex_offset: u32,
    /// 对应 `Renderable::materials` 的下标
    pub material_slot: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GeometryLod {
    pub submeshes: Vec<Submesh>,
    /// 观察点距离不超过该值时使用这个 LOD；最后一级没有上限
    pub max_distance: f32,
}

/// CPU 侧的几何资产
///
/// GPU 上的顶点和索引数据由 `GeometryResidency` 解析。
#[derive(Clone, Debug, PartialEq)]
pub struct GeometryAsset {
    pub name: String,
    pub bounds: BoundingSphere,
    /// LOD 0 最精细
    pub lods: Vec<GeometryLod>,
}

impl GeometryAsset {
    /// 只有一个 LOD、一个 submesh 的几何
    pub fn single(name: impl Into<String>, bounds: BoundingSphere, index_count: u32) -> Self {
        Self {
            name: name.into(),
            bounds,
            lods: vec![GeometryLod {
                submeshes: vec![Submesh {
                    first_index: 0,
                    index_count,
                    vertex_offset: 0,
                    material_slot: 0,
                }],
                max_distance: f32::INFINITY,
            }],
        }
    }

    /// 按距离选择 LOD：第一个 `max_distance` 不小于距离的级别，都不满足时取最后一级
    pub fn select_lod(&self, distance: f32) -> Option<u32> {
        if self.lods.is_empty() {
            return None;
        }
        let index = self
            .lods
            .iter()
            .position(|lod| distance <= lod.max_distance)
            .unwrap_or(self.lods.len() - 1);
        Some(index as u32)
    }

    #[inline]
    pub fn lod(&self, level: u32) -> Option<&GeometryLod> {
        self.lods.get(level as usize)
    }
}
