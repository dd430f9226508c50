use std::sync::Arc;

use oxy_gfx::commands::command::GfxCommand;
use oxy_gfx::commands::pool::CommandRecorder;
use oxy_gfx::resources::{GfxBuffer, GfxTexture};
use oxy_render_interface::epoch::Epoch;
use oxy_render_interface::phase_error::PhaseError;
use oxy_render_interface::render_data::{FrameViewPacket, PreparedFrame};

use crate::render_graph::{RgResourceHandle, RgResourceRegistry};
use crate::view_constants::{VIEW_CONSTANTS_SLOT, ViewConstants};

/// 把一个 pass 绑定到当前帧的上下文
///
/// 不可复制。创建时打开 pass 的 debug event，
/// 任何退出路径（正常结束、错误、提前返回）在 drop 时都会关闭它。
pub struct RenderContext<'r, 'p> {
    recorder: &'r mut CommandRecorder<'p>,
    pass_name: &'r str,
    epoch: Epoch,
    frame: &'r PreparedFrame,
    resources: &'r RgResourceRegistry,
    view_constants: &'r [ViewConstants],
}

// new & init
impl<'r, 'p> RenderContext<'r, 'p> {
    pub(crate) fn begin(
        recorder: &'r mut CommandRecorder<'p>,
        pass_name: &'r str,
        epoch: Epoch,
        frame: &'r PreparedFrame,
        resources: &'r RgResourceRegistry,
        view_constants: &'r [ViewConstants],
    ) -> Result<Self, PhaseError> {
        recorder.record(GfxCommand::BeginEvent(pass_name.to_string()))?;
        Ok(Self {
            recorder,
            pass_name,
            epoch,
            frame,
            resources,
            view_constants,
        })
    }
}

// getters
impl RenderContext<'_, '_> {
    #[inline]
    pub fn pass_name(&self) -> &str {
        self.pass_name
    }

    #[inline]
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    #[inline]
    pub fn frame(&self) -> &PreparedFrame {
        self.frame
    }

    pub fn packet(&self, view: u32) -> Result<&FrameViewPacket, PhaseError> {
        self.frame
            .packets
            .get(view as usize)
            .ok_or_else(|| PhaseError::new(format!("pass \"{}\": view {} not prepared", self.pass_name, view)))
    }

    pub fn texture(&self, handle: RgResourceHandle) -> Option<&Arc<GfxTexture>> {
        self.resources.get(handle)?.physical()?.texture()
    }

    pub fn buffer(&self, handle: RgResourceHandle) -> Option<&Arc<GfxBuffer>> {
        self.resources.get(handle)?.physical()?.buffer()
    }
}

// record
impl RenderContext<'_, '_> {
    #[inline]
    pub fn record(&mut self, command: GfxCommand) -> Result<(), PhaseError> {
        Ok(self.recorder.record(command)?)
    }

    /// 把 view 的 constant block 写到固定的 binding slot
    pub fn bind_view(&mut self, view: u32) -> Result<(), PhaseError> {
        let constants = self
            .view_constants
            .get(view as usize)
            .ok_or_else(|| PhaseError::new(format!("pass \"{}\": view {} has no constants", self.pass_name, view)))?;
        let data = constants.as_bytes().to_vec();
        self.record(GfxCommand::SetViewConstants {
            slot: VIEW_CONSTANTS_SLOT,
            data,
        })
    }

    /// 绘制一个 bucket 中的 draw
    ///
    /// 连续的下标合并成一次间接绘制，保持 bucket 中的顺序。返回间接绘制的次数。
    pub fn draw_bucket(&mut self, draws: &[u32]) -> Result<u32, PhaseError> {
        let runs = draw_runs(draws);
        for &(first_draw, draw_count) in &runs {
            self.record(GfxCommand::DrawIndexedIndirect { first_draw, draw_count })?;
        }
        Ok(runs.len() as u32)
    }
}

impl Drop for RenderContext<'_, '_> {
    fn drop(&mut self) {
        if let Err(err) = self.recorder.record(GfxCommand::EndEvent) {
            log::error!("pass \"{}\": failed to close debug event: {}", self.pass_name, err);
        }
    }
}

/// 把 draw 下标切分成连续递增的区间 `(first, count)`
pub fn draw_runs(draws: &[u32]) -> Vec<(u32, u32)> {
    let mut runs: Vec<(u32, u32)> = Vec::new();
    for &draw in draws {
        match runs.last_mut() {
            Some((first, count)) if *first + *count == draw => *count += 1,
            _ => runs.push((draw, 1)),
        }
    }
    runs
}
