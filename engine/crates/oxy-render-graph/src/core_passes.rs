//! 内置的 pass
//!
//! 每个 pass 绘制 scene-prep 生成的某个 bucket，资源由调用者通过 builder 创建或导入。

use oxy_gfx::commands::command::GfxCommand;
use oxy_gfx::resource_state::ResourceState;
use oxy_render_interface::phase_error::PhaseError;

use crate::render_context::RenderContext;
use crate::render_graph::{RgPass, RgPassBuilder, RgResourceHandle};

/// composite 的 compute 线程组大小
pub const COMPOSITE_GROUP_SIZE: u32 = 8;

pub enum CorePass {
    /// 不透明和 alpha mask 的物体写入深度
    DepthPrePass { view: u32, depth: RgResourceHandle },

    /// 投射阴影的物体写入 shadow map
    Shadow { view: u32, shadow_map: RgResourceHandle },

    Opaque {
        view: u32,
        depth: RgResourceHandle,
        color: RgResourceHandle,
        shadow_map: Option<RgResourceHandle>,
    },

    /// 由远到近绘制半透明物体
    Transparent {
        view: u32,
        depth: RgResourceHandle,
        color: RgResourceHandle,
    },

    /// 按 view 的 opacity 把 color 合成到 target
    Composite {
        view: u32,
        color: RgResourceHandle,
        target: RgResourceHandle,
    },
}

impl CorePass {
    pub fn name(&self) -> &'static str {
        match self {
            CorePass::DepthPrePass { .. } => "depth-pre",
            CorePass::Shadow { .. } => "shadow",
            CorePass::Opaque { .. } => "opaque",
            CorePass::Transparent { .. } => "transparent",
            CorePass::Composite { .. } => "composite",
        }
    }

    fn view_index(&self) -> u32 {
        match *self {
            CorePass::DepthPrePass { view, .. }
            | CorePass::Shadow { view, .. }
            | CorePass::Opaque { view, .. }
            | CorePass::Transparent { view, .. }
            | CorePass::Composite { view, .. } => view,
        }
    }
}

impl RgPass for CorePass {
    fn declare(&mut self, builder: &mut RgPassBuilder) {
        match *self {
            CorePass::DepthPrePass { depth, .. } => {
                builder.write(depth, ResourceState::DEPTH_WRITE);
            }
            CorePass::Shadow { shadow_map, .. } => {
                builder.write(shadow_map, ResourceState::DEPTH_WRITE);
            }
            CorePass::Opaque {
                depth,
                color,
                shadow_map,
                ..
            } => {
                builder.read(depth, ResourceState::DEPTH_READ);
                if let Some(shadow_map) = shadow_map {
                    builder.read(shadow_map, ResourceState::SHADER_RESOURCE);
                }
                builder.write(color, ResourceState::RENDER_TARGET);
            }
            CorePass::Transparent { depth, color, .. } => {
                builder.read(depth, ResourceState::DEPTH_READ);
                builder.read_write(color, ResourceState::RENDER_TARGET);
            }
            CorePass::Composite { color, target, .. } => {
                builder.read(color, ResourceState::SHADER_RESOURCE);
                builder.write(target, ResourceState::RENDER_TARGET);
            }
        }
    }

    fn execute(&self, ctx: &mut RenderContext<'_, '_>) -> Result<(), PhaseError> {
        let packet = ctx.packet(self.view_index())?;
        let buckets = packet.buckets.clone();

        match *self {
            CorePass::DepthPrePass { .. } => {
                ctx.draw_bucket(&buckets.opaque)?;
                ctx.draw_bucket(&buckets.masked)?;
            }
            CorePass::Shadow { .. } => {
                ctx.draw_bucket(&buckets.shadow)?;
            }
            CorePass::Opaque { .. } => {
                ctx.draw_bucket(&buckets.opaque)?;
                ctx.draw_bucket(&buckets.masked)?;
            }
            CorePass::Transparent { .. } => {
                ctx.draw_bucket(&buckets.transparent)?;
            }
            CorePass::Composite { target, .. } => {
                let desc = ctx
                    .texture(target)
                    .map(|t| t.desc().clone())
                    .ok_or_else(|| PhaseError::new(format!("composite target of \"{}\" is not a texture", ctx.pass_name())))?;
                ctx.record(GfxCommand::Dispatch {
                    x: desc.width.div_ceil(COMPOSITE_GROUP_SIZE),
                    y: desc.height.div_ceil(COMPOSITE_GROUP_SIZE),
                    z: 1,
                })?;
            }
        }
        Ok(())
    }

    fn view(&self) -> Option<u32> {
        Some(self.view_index())
    }
}

/// 不访问任何资源、不录制命令的 pass
pub struct NullPass;

impl RgPass for NullPass {
    fn declare(&mut self, _builder: &mut RgPassBuilder) {}

    fn execute(&self, _ctx: &mut RenderContext<'_, '_>) -> Result<(), PhaseError> {
        Ok(())
    }
}
