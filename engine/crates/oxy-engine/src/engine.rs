use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use oxy_gfx::device::GfxDevice;
use oxy_render_interface::clock::Clock;
use oxy_render_interface::epoch::Epoch;
use oxy_render_interface::phase_error::PhaseError;
use oxy_render_interface::timer::Timer;

use crate::cancellation::CancellationToken;
use crate::config::{EngineConfigFile, EngineProps};
use crate::events::{EngineEvent, EventBus, EventKind, SubscriptionId};
use crate::fixed_timestep::{FixedStepPlan, FixedTimestep};
use crate::frame_context::{FixedStepInfo, FrameContext};
use crate::frame_state::FrameState;
use crate::graphics_layer::GraphicsLayer;
use crate::inbox::{Inbox, InboxError, InboxSender};
use crate::module::{EngineModule, ModuleManager};
use crate::phase::PhaseId;
use crate::type_registry::TypeRegistry;

/// 引擎和其他线程共享的状态
pub struct EngineShared {
    cancel: CancellationToken,
    shutdown_requested: AtomicBool,
}

impl EngineShared {
    /// 请求关闭，在当前帧结束时生效
    pub fn request_shutdown(&self) {
        if !self.shutdown_requested.swap(true, Ordering::AcqRel) {
            log::info!("engine shutdown requested");
        }
    }

    #[inline]
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }
}

/// 引擎的跨线程句柄
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<EngineShared>,
    inbox: InboxSender,
}

impl EngineHandle {
    /// 投递一个命令，在下一个阶段边界上执行
    pub fn post(&self, command: impl FnOnce(&mut FrameContext) + Send + 'static) -> Result<(), InboxError> {
        self.inbox.post(command)
    }

    #[inline]
    pub fn request_shutdown(&self) {
        self.shared.request_shutdown();
    }

    /// 立即取消所有正在等待的 awaitable，并在帧结束时关闭
    pub fn cancel(&self) {
        self.shared.request_shutdown();
        self.shared.cancel.cancel();
    }

    #[inline]
    pub fn is_shutdown_requested(&self) -> bool {
        self.shared.is_shutdown_requested()
    }
}

/// 一帧中失败的阶段
#[derive(Clone, Debug, PartialEq)]
pub struct FrameFailure {
    pub phase: PhaseId,
    /// 失败的模块，引擎自身的失败为 None
    pub module: Option<String>,
    pub error: PhaseError,
}

/// 一帧的执行结果
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameReport {
    pub epoch: Epoch,
    /// 按执行顺序记录的阶段，`FixedUpdate` 每一步记录一次
    pub phases_run: Vec<PhaseId>,
    pub fixed_steps: u32,
    pub time_debt_dropped: Duration,
    pub presented: bool,
    pub failure: Option<FrameFailure>,
}

impl FrameReport {
    #[inline]
    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    #[inline]
    pub fn ran(&self, phase: PhaseId) -> bool {
        self.phases_run.contains(&phase)
    }
}

/// 异步的阶段调度引擎
///
/// 单个协作式任务驱动每一帧依次经过所有阶段，同一阶段内按注册顺序调用模块。
/// 某个 handler 失败时跳过剩余阶段（包括 `Present`），但 `FrameEnd` 和回收总是执行。
pub struct Engine {
    props: EngineProps,

    ctx: FrameContext,
    modules: ModuleManager,
    events: EventBus,
    inbox: Inbox,

    timer: Timer,
    fixed: FixedTimestep,
    state: FrameState,

    shared: Arc<EngineShared>,
    frames_run: u64,
    shut_down: bool,
}

// new & init
impl Engine {
    pub fn new(config: &EngineConfigFile, device: Arc<dyn GfxDevice>, clock: Arc<dyn Clock>) -> Result<Self, PhaseError> {
        let _span = tracy_client::span!("Engine::new");

        config.validate()?;
        let strategy = config.renderer.queue_strategy()?;
        let mut graphics = GraphicsLayer::new(
            device,
            strategy,
            config.engine.target_fps as f32,
            config.renderer.fence_timeout(),
        )?;

        let shared = Arc::new(EngineShared {
            cancel: CancellationToken::new(),
            shutdown_requested: AtomicBool::new(false),
        });
        graphics.attach_engine(&shared);

        let inbox = Inbox::new(Inbox::DEFAULT_CAPACITY);
        let handle = EngineHandle {
            shared: shared.clone(),
            inbox: inbox.sender(),
        };
        let ctx = FrameContext::new(graphics, shared.cancel.clone(), handle);

        TypeRegistry::init();
        log::info!(
            "engine \"{}\" v{} created, target fps: {}, fixed step: {:?}",
            config.engine.application.name,
            config.engine.application.version,
            config.engine.target_fps,
            config.engine.fixed_timestep()
        );

        Ok(Self {
            props: config.engine.clone(),
            ctx,
            modules: ModuleManager::new(),
            events: EventBus::new(),
            inbox,
            timer: Timer::new(clock),
            fixed: FixedTimestep::new(config.engine.fixed_timestep(), config.engine.max_fixed_update_duration()),
            state: FrameState::Idle,
            shared,
            frames_run: 0,
            shut_down: false,
        })
    }

    /// 注册模块，发出 `ModuleAttached`
    pub fn attach(&mut self, module: impl EngineModule + 'static) -> Result<usize, PhaseError> {
        self.attach_boxed(Box::new(module))
    }

    pub fn attach_boxed(&mut self, module: Box<dyn EngineModule>) -> Result<usize, PhaseError> {
        self.modules.attach(module, &mut self.ctx, &mut self.events)
    }

    /// `replay` 为 true 时，已经注册的模块会同步地按注册顺序通知给订阅者
    pub fn subscribe(
        &mut self,
        filter: Option<EventKind>,
        replay: bool,
        callback: impl FnMut(&EngineEvent) + 'static,
    ) -> SubscriptionId {
        self.modules.subscribe(&mut self.events, filter, replay, callback)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }
}

// getters
impl Engine {
    #[inline]
    pub fn props(&self) -> &EngineProps {
        &self.props
    }

    #[inline]
    pub fn context(&self) -> &FrameContext {
        &self.ctx
    }

    #[inline]
    pub fn context_mut(&mut self) -> &mut FrameContext {
        &mut self.ctx
    }

    #[inline]
    pub fn graphics(&self) -> &GraphicsLayer {
        &self.ctx.graphics
    }

    #[inline]
    pub fn modules(&self) -> &ModuleManager {
        &self.modules
    }

    #[inline]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    #[inline]
    pub fn frame_state(&self) -> FrameState {
        self.state
    }

    #[inline]
    pub fn frames_run(&self) -> u64 {
        self.frames_run
    }

    #[inline]
    pub fn handle(&self) -> EngineHandle {
        self.ctx.handle().clone()
    }

    #[inline]
    pub fn is_shutdown_requested(&self) -> bool {
        self.shared.is_shutdown_requested()
    }
}

// update
impl Engine {
    /// 按 `frame_count` 和 `target_fps` 运行，直到关闭
    pub async fn run(&mut self) -> Result<(), PhaseError> {
        let frame_count = self.props.frame_count as u64;
        let interval = self.props.frame_interval();
        let clock = self.timer.clock().clone();

        let mut result = Ok(());
        while !self.shared.is_shutdown_requested() && (frame_count == 0 || self.frames_run < frame_count) {
            let frame_begin = clock.now();
            if let Err(err) = self.run_frame().await {
                result = Err(err);
                break;
            }

            // 帧率限制
            if let Some(interval) = interval {
                let elapsed = clock.now().saturating_sub(frame_begin);
                if elapsed < interval {
                    clock.sleep(interval - elapsed);
                }
            }
        }

        self.shutdown();
        result
    }

    /// 运行一帧
    ///
    /// 当前帧失败时返回 `Ok`，失败记录在 `FrameReport::failure` 中；
    /// 只有致命的错误（例如设备丢失）返回 `Err`，此时引擎已经请求关闭。
    pub async fn run_frame(&mut self) -> Result<FrameReport, PhaseError> {
        let mut report = FrameReport::default();
        self.set_state(FrameState::Preparing);

        // Frame Start ~ Present ==========================
        let mut failure = self.run_phases(&mut report).await.err();

        // Frame End ======================================
        self.drain_inbox();
        self.set_state(FrameState::Retiring);
        report.phases_run.push(PhaseId::FrameEnd);
        if let Err((module, error)) = self.modules.run_phase(PhaseId::FrameEnd, &mut self.ctx).await {
            let frame_end_failure = FrameFailure {
                phase: PhaseId::FrameEnd,
                module: Some(module),
                error,
            };
            match failure {
                None => failure = Some(frame_end_failure),
                Some(_) => log::error!("frame end also failed: {:?}", frame_end_failure),
            }
        }
        self.ctx.graphics.end_frame();
        self.set_state(FrameState::Idle);

        report.epoch = self.ctx.epoch;
        self.frames_run += 1;
        tracy_client::frame_mark();

        if let Some(failure) = &failure {
            self.report_failure(report.epoch, failure);
        }
        if self.shared.is_shutdown_requested() {
            self.shared.cancel.cancel();
        }

        report.failure = failure;
        match &report.failure {
            Some(failure) if failure.error.is_fatal_to_engine() => {
                self.shared.request_shutdown();
                self.shared.cancel.cancel();
                Err(failure.error.clone())
            }
            _ => Ok(report),
        }
    }

    /// 执行 `FrameStart` 到 `Present`，遇到第一个失败即返回
    async fn run_phases(&mut self, report: &mut FrameReport) -> Result<(), FrameFailure> {
        // Frame Start ======================================
        self.drain_inbox();
        report.phases_run.push(PhaseId::FrameStart);
        let delta = self.timer.tick();
        let epoch = self
            .ctx
            .graphics
            .begin_frame(&self.shared.cancel)
            .await
            .map_err(|error| FrameFailure {
                phase: PhaseId::FrameStart,
                module: None,
                error,
            })?;
        self.ctx.epoch = epoch;
        self.ctx.frame_name = self.ctx.graphics.frame_counter.frame_name();
        self.ctx.delta = delta;
        self.ctx.total = self.timer.total_time();
        self.ctx.fixed_step = FixedStepInfo::default();
        self.run_modules(PhaseId::FrameStart).await?;

        let plan = self.fixed.advance(delta);
        report.fixed_steps = plan.steps;
        report.time_debt_dropped = plan.dropped;

        for phase in PhaseId::ALL {
            match phase {
                PhaseId::FrameStart | PhaseId::FrameEnd => continue,
                PhaseId::Present => {
                    // 被取消的帧不呈现
                    if self.shared.cancel.is_cancelled() {
                        return Err(FrameFailure {
                            phase,
                            module: None,
                            error: PhaseError::cancelled(),
                        });
                    }
                    self.set_state(FrameState::Presenting);
                }
                PhaseId::CommandRecord => self.set_state(FrameState::Recording),
                _ => {}
            }

            self.drain_inbox();
            if phase == PhaseId::FixedUpdate {
                self.run_fixed_update(plan, report).await?;
            } else {
                report.phases_run.push(phase);
                self.run_modules(phase).await?;
            }

            if phase == PhaseId::CommandSubmit {
                self.set_state(FrameState::Submitted);
            }
        }

        report.presented = true;
        Ok(())
    }

    async fn run_fixed_update(&mut self, plan: FixedStepPlan, report: &mut FrameReport) -> Result<(), FrameFailure> {
        if !plan.dropped.is_zero() {
            log::warn!(
                "{} fixed update exceeds {:?}, dropped {:?} of time debt",
                self.ctx.frame_name,
                self.props.max_fixed_update_duration(),
                plan.dropped
            );
            self.events.publish(EngineEvent::TimeDebtDropped {
                epoch: self.ctx.epoch,
                dropped: plan.dropped,
            });
        }

        for index in 0..plan.steps {
            self.ctx.fixed_step = FixedStepInfo {
                index,
                count: plan.steps,
                dt: self.fixed.step(),
            };
            report.phases_run.push(PhaseId::FixedUpdate);
            self.run_modules(PhaseId::FixedUpdate).await?;
        }
        Ok(())
    }

    async fn run_modules(&mut self, phase: PhaseId) -> Result<(), FrameFailure> {
        self.modules
            .run_phase(phase, &mut self.ctx)
            .await
            .map_err(|(module, error)| FrameFailure {
                phase,
                module: Some(module),
                error,
            })
    }
}

// tools
impl Engine {
    fn drain_inbox(&mut self) {
        let count = self.inbox.drain(&mut self.ctx);
        if count > 0 {
            log::trace!("{} inbox commands executed", count);
        }
    }

    fn set_state(&mut self, to: FrameState) {
        if let Err(err) = self.state.transition(to) {
            log::error!("{}", err);
            self.state = to;
        }
    }

    /// 在帧边界上记录失败并通知订阅者，取消不算作失败
    fn report_failure(&mut self, epoch: Epoch, failure: &FrameFailure) {
        let module = failure.module.as_deref().unwrap_or("<engine>");
        if failure.error.is_cancelled() {
            log::info!("frame {} cancelled at {} ({})", epoch, failure.phase, module);
            return;
        }

        log::error!(
            "frame failed: epoch={} phase={} module={} class={} message={}",
            epoch,
            failure.phase,
            module,
            failure.error.class(),
            failure.error.message()
        );
        self.events.publish(EngineEvent::FrameFailed {
            epoch,
            phase: failure.phase,
            class: failure.error.class(),
            message: failure.error.message().to_string(),
        });
    }
}

// destroy
impl Engine {
    /// 等待 GPU 空闲，卸载模块，释放所有延迟回收的对象
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        let _span = tracy_client::span!("Engine::shutdown");

        self.shared.request_shutdown();
        self.shared.cancel.cancel();

        if let Err(err) = self.ctx.graphics.wait_idle() {
            log::error!("wait idle failed during shutdown: {}", err);
        }
        self.modules.detach_all(&mut self.ctx, &mut self.events);
        self.ctx.clear_resources();
        self.ctx.graphics.destroy();

        TypeRegistry::destroy();
        log::info!("engine shut down after {} frames", self.frames_run);
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use futures::future::LocalBoxFuture;
    use oxy_gfx::headless::HeadlessDevice;
    use oxy_gfx::queue::QueueKey;
    use oxy_render_interface::clock::ManualClock;
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::phase::PhaseMask;

    struct Recorder {
        log: Rc<RefCell<Vec<PhaseId>>>,
    }

    impl EngineModule for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn phases(&self) -> PhaseMask {
            PhaseMask::all()
        }

        fn on_phase<'a>(&'a mut self, phase: PhaseId, _ctx: &'a mut FrameContext) -> LocalBoxFuture<'a, Result<(), PhaseError>> {
            self.log.borrow_mut().push(phase);
            Box::pin(async { Ok(()) })
        }
    }

    fn engine(clock: &ManualClock) -> Engine {
        let config = EngineConfigFile::from_toml_str("[renderer]\nupload_queue_key = \"copy\"\n").unwrap();
        let device = HeadlessDevice::new(&[QueueKey::new("graphics"), QueueKey::new("copy")]);
        Engine::new(&config, device, Arc::new(clock.clone())).unwrap()
    }

    #[test]
    fn test_phase_order() {
        let clock = ManualClock::new();
        let mut engine = engine(&clock);
        let log = Rc::new(RefCell::new(Vec::new()));
        engine.attach(Recorder { log: log.clone() }).unwrap();

        // 不足一步，不执行 FixedUpdate
        clock.advance(Duration::from_millis(5));
        let report = block_on(engine.run_frame()).unwrap();
        let expected: Vec<_> = PhaseId::ALL.into_iter().filter(|p| *p != PhaseId::FixedUpdate).collect();
        assert_eq!(*log.borrow(), expected);
        assert_eq!(report.phases_run, expected);
        assert!(report.presented);
        assert_eq!(engine.frame_state(), FrameState::Idle);
    }

    #[test]
    fn test_inbox_drained_at_phase_boundary() {
        let clock = ManualClock::new();
        let mut engine = engine(&clock);
        let handle = engine.handle();

        let seen = Arc::new(parking_lot::Mutex::new(None));
        {
            let seen = seen.clone();
            handle.post(move |ctx| *seen.lock() = Some(ctx.epoch)).unwrap();
        }
        block_on(engine.run_frame()).unwrap();
        // FrameStart 之前执行，此时还没有进入新的 epoch
        assert_eq!(*seen.lock(), Some(Epoch::ZERO));
    }

    #[test]
    fn test_shutdown_request_stops_run() {
        let clock = ManualClock::new();
        let mut engine = engine(&clock);
        let handle = engine.handle();
        handle.post(|ctx| ctx.handle().request_shutdown()).unwrap();

        block_on(engine.run()).unwrap();
        assert_eq!(engine.frames_run(), 1);
        assert!(engine.context().is_cancelled());
    }
}
