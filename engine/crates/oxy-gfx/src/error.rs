use thiserror::Error;

use crate::commands::command_list::CommandListState;

/// CommandList 状态机的非法转换
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("command list \"{list}\": invalid transition {from:?} -> {to:?}")]
pub struct InvalidStateError {
    pub list: String,
    pub from: CommandListState,
    pub to: CommandListState,
}

/// 图形后端的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GfxError {
    #[error(transparent)]
    InvalidState(#[from] InvalidStateError),

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    /// 提交失败，丢弃 command list 后可以在同一帧重试
    #[error("submit failed on queue {queue}: {message}")]
    SubmitFailed { queue: String, message: String },

    #[error("fence wait timed out: queue {queue}, value {value}")]
    FenceWaitTimeout { queue: String, value: u64 },

    #[error("device lost")]
    DeviceLost,

    #[error("resource creation failed: {0}")]
    ResourceCreation(String),

    #[error("out of bounds: {0}")]
    OutOfBounds(String),
}

impl GfxError {
    /// 是否可以在同一帧内重新录制并提交
    pub fn is_retriable(&self) -> bool {
        matches!(self, GfxError::SubmitFailed { .. })
    }

    /// 是否是暂时性的错误
    pub fn is_transient(&self) -> bool {
        matches!(self, GfxError::FenceWaitTimeout { .. })
    }

    /// 设备丢失之后引擎无法继续
    pub fn is_fatal(&self) -> bool {
        matches!(self, GfxError::DeviceLost)
    }
}

pub type GfxResult<T> = Result<T, GfxError>;
