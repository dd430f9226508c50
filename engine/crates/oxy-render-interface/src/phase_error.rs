use std::error::Error;
use std::fmt;
use std::sync::Arc;

use oxy_gfx::error::{GfxError, InvalidStateError};

use crate::bindless_manager::BindlessError;
use crate::descriptor::DescriptorError;
use crate::state_tracker::StateTrackerError;

/// 错误的分类，决定帧循环如何处理
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// fence 等待超时、staging 暂时不够
    Transient,
    /// 丢弃 command list 后可以在同一帧重试
    Retriable,
    /// 当前帧失败：跳过 present，依然执行 FrameEnd 和回收
    FatalPerFrame,
    /// 引擎无法继续运行
    FatalToEngine,
    /// 关闭时的取消，不算作失败
    Operational,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Retriable => "retriable",
            ErrorClass::FatalPerFrame => "fatal-per-frame",
            ErrorClass::FatalToEngine => "fatal-to-engine",
            ErrorClass::Operational => "operational",
        };
        f.write_str(name)
    }
}

/// 阶段处理函数和构建阶段返回的错误
///
/// 带有分类、消息和可选的原因。
#[derive(Clone)]
pub struct PhaseError {
    class: ErrorClass,
    message: String,
    source: Option<Arc<dyn Error + Send + Sync>>,
}

// new & init
impl PhaseError {
    /// 当前帧失败的错误
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_class(ErrorClass::FatalPerFrame, message)
    }

    pub fn with_class(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            source: None,
        }
    }

    /// 关闭引擎时被取消
    pub fn cancelled() -> Self {
        Self::with_class(ErrorClass::Operational, "operation cancelled")
    }

    pub fn with_source(mut self, source: impl Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }
}

// getters
impl PhaseError {
    #[inline]
    pub fn class(&self) -> ErrorClass {
        self.class
    }

    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.class == ErrorClass::Operational
    }

    #[inline]
    pub fn is_fatal_to_engine(&self) -> bool {
        self.class == ErrorClass::FatalToEngine
    }
}

impl fmt::Display for PhaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.class, self.message)
    }
}

impl fmt::Debug for PhaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("PhaseError");
        s.field("class", &self.class).field("message", &self.message);
        if let Some(source) = &self.source {
            s.field("source", &source.to_string());
        }
        s.finish()
    }
}

impl Error for PhaseError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source.as_deref().map(|e| e as &(dyn Error + 'static))
    }
}

impl PartialEq for PhaseError {
    fn eq(&self, other: &Self) -> bool {
        self.class == other.class && self.message == other.message
    }
}

impl From<GfxError> for PhaseError {
    fn from(err: GfxError) -> Self {
        let class = if err.is_fatal() {
            ErrorClass::FatalToEngine
        } else if err.is_retriable() {
            ErrorClass::Retriable
        } else if err.is_transient() {
            ErrorClass::Transient
        } else {
            ErrorClass::FatalPerFrame
        };
        Self::with_class(class, err.to_string()).with_source(err)
    }
}

impl From<InvalidStateError> for PhaseError {
    fn from(err: InvalidStateError) -> Self {
        Self::new(err.to_string()).with_source(err)
    }
}

impl From<DescriptorError> for PhaseError {
    fn from(err: DescriptorError) -> Self {
        let class = match err {
            DescriptorError::HeapExhausted { .. } => ErrorClass::FatalToEngine,
            DescriptorError::NotAllocated(_) => ErrorClass::FatalPerFrame,
        };
        Self::with_class(class, err.to_string()).with_source(err)
    }
}

impl From<BindlessError> for PhaseError {
    fn from(err: BindlessError) -> Self {
        match err {
            BindlessError::Descriptor(err) => err.into(),
            BindlessError::Backend(err) => err.into(),
            other => Self::new(other.to_string()).with_source(other),
        }
    }
}

impl From<StateTrackerError> for PhaseError {
    fn from(err: StateTrackerError) -> Self {
        Self::new(err.to_string()).with_source(err)
    }
}
