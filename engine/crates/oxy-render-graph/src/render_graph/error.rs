use thiserror::Error;

use oxy_gfx::error::GfxError;
use oxy_render_interface::bindless_manager::BindlessError;
use oxy_render_interface::phase_error::PhaseError;
use oxy_render_interface::state_tracker::StateTrackerError;

/// 渲染图构建阶段的错误
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("pass \"{pass}\" uses unknown resource {resource}")]
    UnknownResource { pass: String, resource: String },

    #[error("pass \"{pass}\" reads transient resource \"{resource}\" before any pass wrote it")]
    UninitializedRead { pass: String, resource: String },

    #[error("duplicate pass name \"{0}\"")]
    DuplicatePassName(String),

    #[error("pass \"{pass}\" uses invalid state combination {state}")]
    InvalidState { pass: String, state: String },

    #[error("explicit dependency references unknown pass #{0}")]
    UnknownPass(usize),

    #[error("cycle detected involving passes: {0:?}")]
    Cycle(Vec<String>),

    #[error("view {view} is bound but the frame only has {count} views")]
    ViewOutOfRange { view: u32, count: usize },

    #[error("resource \"{0}\" has no physical backing")]
    NotRealized(String),

    #[error(transparent)]
    Gfx(#[from] GfxError),

    #[error(transparent)]
    StateTracker(#[from] StateTrackerError),

    #[error(transparent)]
    Bindless(#[from] BindlessError),
}

impl From<GraphError> for PhaseError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::Gfx(err) => err.into(),
            GraphError::StateTracker(err) => err.into(),
            GraphError::Bindless(err) => err.into(),
            other => {
                let message = other.to_string();
                PhaseError::new(message).with_source(other)
            }
        }
    }
}
