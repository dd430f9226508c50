//! 声明式渲染图
//!
//! 每帧从 scene-prep 的结果重新构建，不做序列化。
//!
//! # 核心概念
//!
//! - **RgResourceHandle**: 虚拟资源句柄，指向导入的外部资源或每帧的临时资源
//! - **RgPass**: 渲染 Pass trait，声明资源读写（`declare`）和录制命令（`execute`）
//! - **RenderGraphBuilder**: 构建器，注册资源和 Pass，然后依次执行构建阶段
//! - **CompiledGraph**: 构建结果，包含执行顺序、每个 pass 的 barrier 和按队列划分的批次
//!
//! # 构建阶段
//!
//! `DeclareResources → DeclarePasses → Validate → OrderPasses → BindViews → InsertBarriers → Finalize`
//!
//! 任何一个阶段失败都会跳过剩下的阶段，返回 `PhaseError`。
//!
//! # 使用示例
//!
//! ```ignore
//! let mut builder = RenderGraphBuilder::new();
//! let backbuffer = builder.import_texture("backbuffer", &texture, ResourceState::PRESENT);
//! let depth = builder.create_texture(TextureDesc::new_2d("depth", w, h, TextureFormat::Depth32Float, TextureUsage::DEPTH_STENCIL));
//! builder.add_pass("depth-pre", CorePass::DepthPrePass { view: 0, depth });
//!
//! let compiled = builder.build(&mut build_ctx)?;
//! let recorded = compiled.record(&mut record_ctx)?;
//! let submitted = compiled.submit(recorded, device, &mut record_ctx, &[])?;
//! ```

mod barrier;
mod builder;
mod error;
mod executor;
mod graph;
mod pass;
mod resource;

pub use barrier::{AliasDecl, PassBarriers, insert_barriers};
pub use builder::{BuildPhase, CompiledGraph, GraphBuildContext, PassBatch, RenderGraphBuilder, ViewTargetsDesc};
pub use error::GraphError;
pub use executor::{GraphRecordContext, GraphSubmitError, MAX_SUBMIT_RETRIES, RecordedBatch, RecordedGraph, SubmittedBatch};
pub use graph::{DependencyAnalyzer, DependencyEdge, DependencyGraph, DependencyKind};
pub use pass::{RgAccess, RgPass, RgPassBuilder, RgPassId, RgPassNode};
pub use resource::{RgPhysical, RgResource, RgResourceDesc, RgResourceHandle, RgResourceRegistry, RgResourceSource};
