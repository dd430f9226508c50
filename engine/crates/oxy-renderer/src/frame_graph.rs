//! 每帧的渲染图
//!
//! 每个 view 依次是 shadow（可选）、depth-pre、opaque、transparent（有透明物体时）和 composite，
//! depth 与 color 是每帧创建的临时纹理，composite 写入导入的 backbuffer。

use oxy_gfx::resource_state::ResourceState;
use oxy_gfx::resources::{TextureDesc, TextureFormat, TextureUsage};
use oxy_render_graph::core_passes::CorePass;
use oxy_render_graph::render_graph::{RenderGraphBuilder, RgResourceHandle, ViewTargetsDesc};
use oxy_render_interface::render_data::PreparedFrame;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameGraphSettings {
    pub shadows: bool,
    pub shadow_map_size: u32,
}

impl Default for FrameGraphSettings {
    fn default() -> Self {
        Self {
            shadows: true,
            shadow_map_size: 1024,
        }
    }
}

/// 为 `frame` 中的每个 view 添加 pass，返回添加的 pass 数量
pub fn build_frame_graph(
    builder: &mut RenderGraphBuilder<'static>,
    frame: &PreparedFrame,
    backbuffer: RgResourceHandle,
    settings: &FrameGraphSettings,
) -> usize {
    let _span = tracy_client::span!("build_frame_graph");

    let mut pass_count = 0;
    for (index, packet) in frame.packets.iter().enumerate() {
        let view = index as u32;
        let width = (packet.viewport.width as u32).max(1);
        let height = (packet.viewport.height as u32).max(1);

        let depth = builder.create_texture(TextureDesc::new_2d(
            format!("depth[{view}]"),
            width,
            height,
            TextureFormat::Depth32Float,
            TextureUsage::DEPTH_STENCIL | TextureUsage::SAMPLED,
        ));
        let color = builder.create_texture(TextureDesc::new_2d(
            format!("color[{view}]"),
            width,
            height,
            TextureFormat::Rgba16Float,
            TextureUsage::RENDER_TARGET | TextureUsage::SAMPLED,
        ));

        let shadow_map = if settings.shadows && !packet.buckets.shadow.is_empty() {
            let shadow_map = builder.create_texture(TextureDesc::new_2d(
                format!("shadow-map[{view}]"),
                settings.shadow_map_size,
                settings.shadow_map_size,
                TextureFormat::Depth32Float,
                TextureUsage::DEPTH_STENCIL | TextureUsage::SAMPLED,
            ));
            builder.add_pass(format!("shadow[{view}]"), CorePass::Shadow { view, shadow_map });
            pass_count += 1;
            Some(shadow_map)
        } else {
            None
        };

        builder.add_pass(format!("depth-pre[{view}]"), CorePass::DepthPrePass { view, depth });
        builder.add_pass(
            format!("opaque[{view}]"),
            CorePass::Opaque {
                view,
                depth,
                color,
                shadow_map,
            },
        );
        pass_count += 2;

        if !packet.buckets.transparent.is_empty() {
            builder.add_pass(format!("transparent[{view}]"), CorePass::Transparent { view, depth, color });
            pass_count += 1;
        }

        // 指定了合成目标的 view 导入它，否则写入 backbuffer
        let target = match &packet.composite_target {
            Some(texture) => {
                builder.import_texture(format!("composite-target[{view}]"), texture, ResourceState::SHADER_RESOURCE)
            }
            None => backbuffer,
        };
        builder.add_pass(format!("composite[{view}]"), CorePass::Composite { view, color, target });
        pass_count += 1;

        builder.bind_view(
            view,
            ViewTargetsDesc {
                depth: Some(depth),
                color: Some(color),
                composite: Some(target),
            },
        );
    }
    pass_count
}
