use std::sync::Arc;

use itertools::Itertools;

use crate::commands::barrier::GfxBarrier;
use crate::resources::{GfxBuffer, GfxTexture, Subresource};

/// command list 中的一条命令
///
/// 命令持有源和目标资源的引用，保证 GPU 执行完之前资源存活。
/// 执行由后端负责，`serialize` 给出可读的调试文本。
#[derive(Clone, Debug)]
pub enum GfxCommand {
    CopyBuffer {
        src: Arc<GfxBuffer>,
        src_offset: u64,
        dst: Arc<GfxBuffer>,
        dst_offset: u64,
        size: u64,
    },
    CopyBufferToTexture {
        src: Arc<GfxBuffer>,
        src_offset: u64,
        row_pitch: u32,
        dst: Arc<GfxTexture>,
        subresource: Subresource,
    },
    Barriers(Vec<GfxBarrier>),
    BeginEvent(String),
    EndEvent,
    /// 把 constant block 写到固定的 binding slot
    SetViewConstants { slot: u32, data: Vec<u8> },
    /// 按 draw metadata 区间发起的间接绘制
    DrawIndexedIndirect { first_draw: u32, draw_count: u32 },
    Dispatch { x: u32, y: u32, z: u32 },
}

impl GfxCommand {
    pub fn serialize(&self) -> String {
        match self {
            GfxCommand::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => format!("copy_buffer {}+{} -> {}+{} ({} bytes)", src.name(), src_offset, dst.name(), dst_offset, size),
            GfxCommand::CopyBufferToTexture {
                src,
                src_offset,
                row_pitch,
                dst,
                subresource,
            } => format!(
                "copy_buffer_to_texture {}+{} (pitch {}) -> {}[mip {} layer {}]",
                src.name(),
                src_offset,
                row_pitch,
                dst.name(),
                subresource.mip,
                subresource.layer
            ),
            GfxCommand::Barriers(barriers) => {
                format!("barriers [{}]", barriers.iter().map(GfxBarrier::describe).join(", "))
            }
            GfxCommand::BeginEvent(name) => format!("begin_event \"{name}\""),
            GfxCommand::EndEvent => "end_event".to_string(),
            GfxCommand::SetViewConstants { slot, data } => format!("set_view_constants slot {slot} ({} bytes)", data.len()),
            GfxCommand::DrawIndexedIndirect { first_draw, draw_count } => {
                format!("draw_indexed_indirect draws [{}, {})", first_draw, first_draw + draw_count)
            }
            GfxCommand::Dispatch { x, y, z } => format!("dispatch {x}x{y}x{z}"),
        }
    }

    /// 命令中拷贝的字节数
    pub fn copy_bytes(&self) -> u64 {
        match self {
            GfxCommand::CopyBuffer { size, .. } => *size,
            GfxCommand::CopyBufferToTexture { dst, subresource, .. } => {
                let (_, height) = dst.desc().mip_extent(subresource.mip);
                dst.desc().tight_row_bytes(subresource.mip) as u64 * height as u64
            }
            _ => 0,
        }
    }
}
