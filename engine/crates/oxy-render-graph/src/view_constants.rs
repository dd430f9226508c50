use bytemuck::{Pod, Zeroable};
use glam::Mat4;

use oxy_render_interface::render_data::{FrameViewPacket, ViewTargets};

/// per-view constant block 的 binding slot，shader 端约定
pub const VIEW_CONSTANTS_SLOT: u32 = 1;

/// 每个 view 的 constant block
///
/// 布局与 shader 一致，固定 256 字节。
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct ViewConstants {
    pub view: Mat4,
    pub projection: Mat4,
    pub view_projection: Mat4,
    /// xyz 为相机位置
    pub camera_position: [f32; 4],
    /// x, y, width, height
    pub viewport: [f32; 4],

    /// 目标的 bindless 下标
    pub depth_index: u32,
    pub color_index: u32,
    pub composite_index: u32,

    /// 在整帧 draw 数组中的区间
    pub first_draw: u32,
    pub draw_count: u32,

    pub view_index: u32,
    pub opacity: f32,
    pub _padding: u32,
}

const _: () = assert!(size_of::<ViewConstants>() == 256);

impl ViewConstants {
    pub fn new(view_index: u32, packet: &FrameViewPacket, targets: ViewTargets) -> Self {
        let camera = &packet.view;
        Self {
            view: camera.view,
            projection: camera.projection,
            view_projection: camera.view_projection(),
            camera_position: camera.position.extend(1.0).to_array(),
            viewport: [packet.viewport.x, packet.viewport.y, packet.viewport.width, packet.viewport.height],
            depth_index: targets.depth.value(),
            color_index: targets.color.value(),
            composite_index: targets.composite.value(),
            first_draw: packet.draw_range.start,
            draw_count: packet.draw_count(),
            view_index,
            opacity: packet.opacity,
            _padding: 0,
        }
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}
