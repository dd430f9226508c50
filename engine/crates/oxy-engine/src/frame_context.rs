use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use oxy_render_interface::epoch::Epoch;
use oxy_render_interface::phase_error::PhaseError;

use crate::cancellation::CancellationToken;
use crate::engine::EngineHandle;
use crate::graphics_layer::GraphicsLayer;
use crate::type_registry::{ComponentTypeId, TypeRegistry};

/// 当前 fixed update 的信息
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FixedStepInfo {
    /// 本帧中的第几步
    pub index: u32,
    /// 本帧一共执行的步数
    pub count: u32,
    pub dt: Duration,
}

/// 每帧传给模块的上下文
///
/// 除了帧的时间信息，还持有 GPU 帧生命周期以及模块之间共享的资源。
/// 只在渲染线程上使用。
pub struct FrameContext {
    pub epoch: Epoch,
    pub frame_name: String,
    pub delta: Duration,
    pub total: Duration,
    pub fixed_step: FixedStepInfo,

    pub graphics: GraphicsLayer,

    cancel: CancellationToken,
    handle: EngineHandle,
    resources: HashMap<ComponentTypeId, Box<dyn Any>>,
}

// new & init
impl FrameContext {
    pub(crate) fn new(graphics: GraphicsLayer, cancel: CancellationToken, handle: EngineHandle) -> Self {
        Self {
            epoch: Epoch::ZERO,
            frame_name: String::new(),
            delta: Duration::ZERO,
            total: Duration::ZERO,
            fixed_step: FixedStepInfo::default(),
            graphics,
            cancel,
            handle,
            resources: HashMap::new(),
        }
    }
}

// getters
impl FrameContext {
    #[inline]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 引擎的跨线程句柄
    #[inline]
    pub fn handle(&self) -> &EngineHandle {
        &self.handle
    }

    #[inline]
    pub fn delta_s(&self) -> f32 {
        self.delta.as_secs_f32()
    }
}

// tools
impl FrameContext {
    /// 关闭引擎时 `fut` 被取消，返回 `OperationCancelled`
    pub async fn cancellable<F: Future>(&self, fut: F) -> Result<F::Output, PhaseError> {
        self.cancel.run(fut).await
    }
}

// resources
impl FrameContext {
    /// 插入模块之间共享的资源，返回被替换的旧值
    pub fn insert_resource<T: 'static>(&mut self, value: T) -> Option<T> {
        let id = Self::resource_id::<T>()?;
        self.resources
            .insert(id, Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub fn resource<T: 'static>(&self) -> Option<&T> {
        let id = TypeRegistry::id_of::<T>()?;
        self.resources.get(&id)?.downcast_ref::<T>()
    }

    pub fn resource_mut<T: 'static>(&mut self) -> Option<&mut T> {
        let id = TypeRegistry::id_of::<T>()?;
        self.resources.get_mut(&id)?.downcast_mut::<T>()
    }

    /// 同时借用资源和 GraphicsLayer
    pub fn resource_and_graphics<T: 'static>(&mut self) -> Option<(&mut T, &mut GraphicsLayer)> {
        let id = TypeRegistry::id_of::<T>()?;
        let resource = self.resources.get_mut(&id)?.downcast_mut::<T>()?;
        Some((resource, &mut self.graphics))
    }

    pub fn remove_resource<T: 'static>(&mut self) -> Option<T> {
        let id = TypeRegistry::id_of::<T>()?;
        self.resources.remove(&id)?.downcast::<T>().ok().map(|value| *value)
    }

    fn resource_id<T: 'static>() -> Option<ComponentTypeId> {
        let id = TypeRegistry::register::<T>();
        if id.is_none() {
            log::error!("TypeRegistry is not initialized, resource {} dropped", std::any::type_name::<T>());
        }
        id
    }

    /// 资源之间的析构顺序不确定
    pub(crate) fn clear_resources(&mut self) {
        self.resources.clear();
    }
}
