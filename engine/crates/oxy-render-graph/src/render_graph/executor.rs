//! 录制与提交
//!
//! 每个批次录制成一个 command list，跨队列依赖在提交时变成 fence 等待。

use oxy_gfx::commands::command::GfxCommand;
use oxy_gfx::commands::command_list::CommandList;
use oxy_gfx::commands::pool::CommandListPools;
use oxy_gfx::commands::submit_info::GfxSubmitInfo;
use oxy_gfx::device::GfxDevice;
use oxy_gfx::fence::FenceValue;
use oxy_gfx::queue::{QueueKey, QueueRole};
use oxy_render_interface::epoch::Epoch;
use oxy_render_interface::phase_error::PhaseError;
use oxy_render_interface::render_data::PreparedFrame;
use oxy_render_interface::state_tracker::ResourceStateTracker;

use crate::render_context::RenderContext;
use crate::render_graph::builder::CompiledGraph;

/// 录制时需要的渲染线程状态
pub struct GraphRecordContext<'a> {
    pub pools: &'a mut CommandListPools,
    pub tracker: &'a mut ResourceStateTracker,
    pub frame: &'a PreparedFrame,
    pub epoch: Epoch,
}

/// 同一帧内可重试的提交失败，最多重新录制并提交的次数
pub const MAX_SUBMIT_RETRIES: u32 = 2;

/// 录制完成、等待提交的批次
pub struct RecordedBatch {
    /// 在 `CompiledGraph::batches` 中的下标
    pub index: usize,
    pub queue_key: QueueKey,
    pub role: QueueRole,
    pub list: CommandList,
    pub passes: Vec<String>,
    pub depends_on: Vec<usize>,
}

/// 提交后的批次
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmittedBatch {
    pub queue_key: QueueKey,
    pub fence: FenceValue,
    pub passes: Vec<String>,
}

pub struct RecordedGraph {
    pub batches: Vec<RecordedBatch>,
    /// 所有批次执行完之后的资源状态，只是预期，真正的跟踪器在提交成功后才更新
    planned: ResourceStateTracker,
}

/// 提交失败
///
/// `submitted` 是失败之前已经提交的批次，它们的 fence 仍然需要等待。
#[derive(Debug)]
pub struct GraphSubmitError {
    pub error: PhaseError,
    pub submitted: Vec<SubmittedBatch>,
}

impl std::fmt::Display for GraphSubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} batches already submitted)", self.error, self.submitted.len())
    }
}

impl std::error::Error for GraphSubmitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl CompiledGraph<'_> {
    /// 按批次录制所有 pass
    ///
    /// pass 之前先写入它的 barrier，`execute` 在 `RenderContext` 里运行。
    /// 资源状态只在 `ctx.tracker` 的副本上推演，`ctx.tracker` 本身在 [`Self::submit`] 成功之后才更新；
    /// 任意 pass 失败时已经录制的 list 被丢弃。
    pub fn record(&self, ctx: &mut GraphRecordContext<'_>) -> Result<RecordedGraph, PhaseError> {
        let _span = tracy_client::span!("CompiledGraph::record");

        let mut planned = ctx.tracker.clone();
        let mut recorded: Vec<RecordedBatch> = Vec::with_capacity(self.batches.len());

        for index in 0..self.batches.len() {
            let batch = match self.record_batch(index, ctx.pools, ctx.frame, ctx.epoch) {
                Ok(batch) => batch,
                Err(err) => {
                    discard_batches(recorded);
                    return Err(err);
                }
            };
            recorded.push(batch);
            for &pass in &self.batches[index].passes {
                if let Err(err) = planned.commit(&self.usages[pass]) {
                    discard_batches(recorded);
                    return Err(err.into());
                }
            }
        }

        Ok(RecordedGraph {
            batches: recorded,
            planned,
        })
    }

    /// 按顺序提交所有批次
    ///
    /// 批次等待它依赖的其他队列上批次的 fence；`external_waits` 中不在本队列上的等待
    /// （例如上传队列）加到每个批次上。
    ///
    /// 可重试的失败会重新录制这个批次再提交，最多 [`MAX_SUBMIT_RETRIES`] 次。
    /// 每个批次提交成功之后才把它的资源状态写入 `ctx.tracker`，失败时没有提交的批次不影响跟踪器。
    pub fn submit(
        &self,
        recorded: RecordedGraph,
        device: &dyn GfxDevice,
        ctx: &mut GraphRecordContext<'_>,
        external_waits: &[(QueueKey, FenceValue)],
    ) -> Result<Vec<SubmittedBatch>, GraphSubmitError> {
        let _span = tracy_client::span!("CompiledGraph::submit");

        let mut submitted: Vec<SubmittedBatch> = Vec::with_capacity(recorded.batches.len());
        let mut pending = recorded.batches.into_iter();
        while let Some(batch) = pending.next() {
            match self.submit_batch(batch, device, ctx, &submitted, external_waits) {
                Ok(done) => submitted.push(done),
                Err(error) => {
                    discard_batches(pending);
                    return Err(GraphSubmitError { error, submitted });
                }
            }
        }
        Ok(submitted)
    }

    fn record_batch(
        &self,
        index: usize,
        pools: &mut CommandListPools,
        frame: &PreparedFrame,
        epoch: Epoch,
    ) -> Result<RecordedBatch, PhaseError> {
        let batch = &self.batches[index];
        let mut recorder = pools
            .pool_mut(batch.role)
            .recorder(format!("graph#{}-{}", index, batch.queue_key))?;

        for &pass in &batch.passes {
            let node = &self.passes[pass];
            let barriers = &self.barriers[pass];
            if barriers.has_barriers() {
                recorder.record(GfxCommand::Barriers(barriers.barriers.clone()))?;
            }

            let _span = tracy_client::span!("RgPass::execute");
            let mut rc = RenderContext::begin(&mut recorder, &node.name, epoch, frame, &self.resources, &self.view_constants)?;
            if let Some(view) = node.pass.view() {
                rc.bind_view(view)?;
            }
            node.pass.execute(&mut rc).map_err(|e| {
                log::error!("pass \"{}\" failed: {}", node.name, e);
                e
            })?;
        }

        Ok(RecordedBatch {
            index,
            queue_key: batch.queue_key.clone(),
            role: batch.role,
            list: recorder.finish()?,
            passes: batch.passes.iter().map(|&p| self.passes[p].name.clone()).collect(),
            depends_on: batch.depends_on.clone(),
        })
    }

    fn submit_batch(
        &self,
        batch: RecordedBatch,
        device: &dyn GfxDevice,
        ctx: &mut GraphRecordContext<'_>,
        submitted: &[SubmittedBatch],
        external_waits: &[(QueueKey, FenceValue)],
    ) -> Result<SubmittedBatch, PhaseError> {
        let RecordedBatch {
            index,
            queue_key,
            mut list,
            passes,
            depends_on,
            ..
        } = batch;
        let queue = match device.queue(&queue_key) {
            Ok(queue) => queue,
            Err(err) => {
                list.discard();
                return Err(err.into());
            }
        };

        let mut waits: Vec<(QueueKey, FenceValue)> = depends_on
            .iter()
            .map(|&dep| (submitted[dep].queue_key.clone(), submitted[dep].fence))
            .collect();
        waits.extend(external_waits.iter().filter(|(key, _)| *key != queue_key).cloned());

        let mut attempt = 0;
        let fence = loop {
            let info = waits
                .iter()
                .fold(GfxSubmitInfo::new(vec![list]), |info, (key, value)| info.wait(key.clone(), *value));
            match queue.submit(info) {
                Ok(fence) => break fence,
                Err(e) if e.is_retriable() && attempt < MAX_SUBMIT_RETRIES => {
                    attempt += 1;
                    log::warn!("graph batch on {} failed ({}), retry {}/{}", queue_key, e, attempt, MAX_SUBMIT_RETRIES);
                    list = self.record_batch(index, ctx.pools, ctx.frame, ctx.epoch)?.list;
                }
                Err(e) => return Err(e.into()),
            }
        };
        log::trace!("graph batch on {} submitted: {}", queue_key, fence);

        for &pass in &self.batches[index].passes {
            ctx.tracker.commit(&self.usages[pass])?;
        }
        Ok(SubmittedBatch {
            queue_key,
            fence,
            passes,
        })
    }
}

impl RecordedGraph {
    #[inline]
    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }

    /// 图执行完之后预期的资源状态，用来规划图之后的工作
    #[inline]
    pub fn planned_states(&self) -> &ResourceStateTracker {
        &self.planned
    }

    /// 不提交，丢弃所有批次
    pub fn discard(self) {
        log::debug!("discard {} unsubmitted batches", self.batches.len());
        discard_batches(self.batches);
    }
}

fn discard_batches(batches: impl IntoIterator<Item = RecordedBatch>) {
    for batch in batches {
        batch.list.discard();
    }
}

impl SubmittedBatch {
    /// 每个队列上最后一次提交的 fence
    pub fn last_fences(batches: &[SubmittedBatch]) -> Vec<(QueueKey, FenceValue)> {
        let mut fences: Vec<(QueueKey, FenceValue)> = Vec::new();
        for batch in batches {
            match fences.iter_mut().find(|(key, _)| *key == batch.queue_key) {
                Some((_, fence)) => *fence = (*fence).max(batch.fence),
                None => fences.push((batch.queue_key.clone(), batch.fence)),
            }
        }
        fences
    }
}
