//! scene-prep 交给渲染图的每帧数据

use std::ops::Range;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

use oxy_gfx::resources::GfxTexture;

use crate::descriptor::ShaderVisibleIndex;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct DrawFlags: u32 {
        const INDEXED = 1 << 0;
        const CAST_SHADOWS = 1 << 1;
        const ALPHA_MASKED = 1 << 2;
        const TRANSPARENT = 1 << 3;
        /// 材质还没准备好，使用默认材质
        const FALLBACK_MATERIAL = 1 << 4;
    }
}

/// 每个 draw 的数据，shader 通过 draw index 间接读取
///
/// 大小固定为 52 字节，是 shader 端的布局。
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct DrawMetadata {
    /// 顶点 buffer 的 bindless 下标
    pub vertex_buffer_index: u32,
    pub index_buffer_index: u32,
    pub first_index: u32,
    pub index_count: u32,
    pub vertex_offset: u32,
    /// 在本帧 transform 数组中的位置
    pub transform_index: u32,
    /// 0 表示默认材质
    pub material_handle: u32,
    pub instance_index: u32,
    pub instance_count: u32,
    pub lod_level: u32,
    pub submesh_index: u32,
    pub view_index: u32,
    /// `DrawFlags`
    pub flags: u32,
}

const _: () = assert!(size_of::<DrawMetadata>() == 52);

impl DrawMetadata {
    #[inline]
    pub fn draw_flags(&self) -> DrawFlags {
        DrawFlags::from_bits_truncate(self.flags)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn new(width: f32, height: f32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width,
            height,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }

    #[inline]
    pub fn aspect(&self) -> f32 {
        if self.height > 0.0 { self.width / self.height } else { 1.0 }
    }
}

impl Default for Viewport {
    fn default() -> Self {
        Self::new(1280.0, 720.0)
    }
}

/// 观察者（相机）
#[derive(Clone, Debug, PartialEq)]
pub struct ViewDesc {
    pub name: String,
    pub view: Mat4,
    pub projection: Mat4,
    pub position: Vec3,
}

impl ViewDesc {
    /// 右手坐标系，深度 [0, 1]
    pub fn look_at(name: impl Into<String>, eye: Vec3, target: Vec3, fov_y: f32, aspect: f32, near: f32, far: f32) -> Self {
        Self {
            name: name.into(),
            view: Mat4::look_at_rh(eye, target, Vec3::Y),
            projection: Mat4::perspective_rh(fov_y, aspect, near, far),
            position: eye,
        }
    }

    #[inline]
    pub fn view_projection(&self) -> Mat4 {
        self.projection * self.view
    }
}

/// 每帧提交给渲染器的一个 view
#[derive(Clone, Debug)]
pub struct RenderView {
    pub camera: ViewDesc,
    pub viewport: Viewport,
    pub opacity: f32,
    /// 合成到的目标，None 表示输出到 backbuffer
    pub composite_target: Option<Arc<GfxTexture>>,
}

impl RenderView {
    pub fn new(camera: ViewDesc, viewport: Viewport) -> Self {
        Self {
            camera,
            viewport,
            opacity: 1.0,
            composite_target: None,
        }
    }
}

/// 每个 pass 使用的 draw 下标（相对于整帧 draw 数组）
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PassBuckets {
    pub opaque: Vec<u32>,
    pub masked: Vec<u32>,
    pub transparent: Vec<u32>,
    pub shadow: Vec<u32>,
}

impl PassBuckets {
    pub fn clear(&mut self) {
        self.opaque.clear();
        self.masked.clear();
        self.transparent.clear();
        self.shadow.clear();
    }
}

/// scene-prep 为一个 view 输出的数据
#[derive(Clone, Debug)]
pub struct FrameViewPacket {
    pub view: ViewDesc,
    pub viewport: Viewport,
    pub opacity: f32,
    pub composite_target: Option<Arc<GfxTexture>>,
    /// 在整帧 `DrawMetadata` 数组中的区间
    pub draw_range: Range<u32>,
    pub buckets: PassBuckets,
}

impl FrameViewPacket {
    #[inline]
    pub fn draw_count(&self) -> u32 {
        self.draw_range.end - self.draw_range.start
    }
}

/// 一帧准备好的数据，发布之后不再修改
#[derive(Clone, Debug, Default)]
pub struct PreparedFrame {
    pub draws: Arc<[DrawMetadata]>,
    pub transforms: Arc<[Mat4]>,
    pub packets: Vec<FrameViewPacket>,
}

impl PreparedFrame {
    #[inline]
    pub fn draw_count(&self) -> usize {
        self.draws.len()
    }
}

/// 写到每个 view constant block 里的 bindless 下标
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ViewTargets {
    pub depth: ShaderVisibleIndex,
    pub color: ShaderVisibleIndex,
    pub composite: ShaderVisibleIndex,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_draw_metadata_size() {
        assert_eq!(size_of::<DrawMetadata>(), 52);
        assert_eq!(bytemuck::bytes_of(&DrawMetadata::default()).len(), 52);
    }

    #[test]
    fn test_default_material_is_sentinel() {
        let draw = DrawMetadata {
            flags: (DrawFlags::INDEXED | DrawFlags::CAST_SHADOWS).bits(),
            ..Default::default()
        };
        assert_eq!(draw.material_handle, 0);
        assert!(draw.draw_flags().contains(DrawFlags::CAST_SHADOWS));
    }
}
