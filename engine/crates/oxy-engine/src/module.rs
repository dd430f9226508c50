use futures::future::LocalBoxFuture;

use oxy_render_interface::phase_error::PhaseError;

use crate::events::{EngineEvent, EventBus, EventKind, SubscriptionId};
use crate::frame_context::FrameContext;
use crate::phase::{PhaseId, PhaseMask};

/// 引擎模块
///
/// 模块通过 `phases` 声明关心的阶段，引擎在这些阶段按注册顺序调用 `on_phase`。
/// handler 不能阻塞渲染线程，需要等待时 await（fence、事件或 I/O）。
///
/// ```ignore
/// impl EngineModule for MyModule {
///     fn name(&self) -> &str { "my-module" }
///     fn phases(&self) -> PhaseMask { PhaseMask::GAMEPLAY }
///     fn on_phase<'a>(&'a mut self, phase: PhaseId, ctx: &'a mut FrameContext) -> LocalBoxFuture<'a, Result<(), PhaseError>> {
///         Box::pin(async move { Ok(()) })
///     }
/// }
/// ```
pub trait EngineModule {
    fn name(&self) -> &str;

    fn phases(&self) -> PhaseMask;

    fn on_attach(&mut self, _ctx: &mut FrameContext) -> Result<(), PhaseError> {
        Ok(())
    }

    fn on_phase<'a>(&'a mut self, phase: PhaseId, ctx: &'a mut FrameContext) -> LocalBoxFuture<'a, Result<(), PhaseError>>;

    /// 引擎关闭时按注册的相反顺序调用，GPU 已经空闲
    fn on_shutdown(&mut self, _ctx: &mut FrameContext) {}
}

/// 按注册顺序保存模块
#[derive(Default)]
pub struct ModuleManager {
    modules: Vec<Box<dyn EngineModule>>,
}

// new & init
impl ModuleManager {
    pub fn new() -> Self {
        Self::default()
    }
}

// attach & detach
impl ModuleManager {
    /// 注册模块，返回它的注册序号
    ///
    /// `on_attach` 失败时模块不会被注册，也不会发出 `ModuleAttached`。
    pub fn attach(
        &mut self,
        mut module: Box<dyn EngineModule>,
        ctx: &mut FrameContext,
        events: &mut EventBus,
    ) -> Result<usize, PhaseError> {
        module.on_attach(ctx)?;

        let index = self.modules.len();
        let name = module.name().to_string();
        log::info!("attach module \"{}\" at {}, phases: {:?}", name, index, module.phases());
        self.modules.push(module);
        events.publish(EngineEvent::ModuleAttached { name, index });
        Ok(index)
    }

    /// 按注册的相反顺序卸载所有模块
    pub fn detach_all(&mut self, ctx: &mut FrameContext, events: &mut EventBus) {
        while let Some(mut module) = self.modules.pop() {
            module.on_shutdown(ctx);
            let name = module.name().to_string();
            log::info!("detach module \"{}\"", name);
            events.publish(EngineEvent::ModuleDetached { name });
        }
    }

    /// 订阅事件；`replay` 为 true 时，同步地把已经注册的模块按注册顺序通知给新的订阅者
    pub fn subscribe(
        &self,
        events: &mut EventBus,
        filter: Option<EventKind>,
        replay: bool,
        callback: impl FnMut(&EngineEvent) + 'static,
    ) -> SubscriptionId {
        let id = events.subscribe(filter, callback);
        if replay && filter.is_none_or(|kind| kind == EventKind::ModuleAttached) {
            for (index, module) in self.modules.iter().enumerate() {
                let event = EngineEvent::ModuleAttached {
                    name: module.name().to_string(),
                    index,
                };
                events.deliver_to(id, &event);
            }
        }
        id
    }
}

// phase call
impl ModuleManager {
    /// 按注册顺序执行关心 `phase` 的模块，第一个失败的 handler 结束这个阶段
    pub async fn run_phase(&mut self, phase: PhaseId, ctx: &mut FrameContext) -> Result<(), (String, PhaseError)> {
        for module in self.modules.iter_mut().filter(|m| m.phases().has(phase)) {
            let result = module.on_phase(phase, ctx).await;
            if let Err(err) = result {
                return Err((module.name().to_string(), err));
            }
        }
        Ok(())
    }
}

// getters
impl ModuleManager {
    #[inline]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.modules.iter().map(|m| m.name()).collect()
    }

    /// 关心 `phase` 的模块数量
    pub fn handler_count(&self, phase: PhaseId) -> usize {
        self.modules.iter().filter(|m| m.phases().has(phase)).count()
    }

    pub fn registered_phases(&self) -> PhaseMask {
        self.modules.iter().fold(PhaseMask::empty(), |mask, m| mask | m.phases())
    }
}
