use std::time::Duration;

use oxy_render_interface::epoch::Epoch;
use oxy_render_interface::phase_error::ErrorClass;

use crate::phase::PhaseId;

/// 引擎事件，在渲染线程上同步派发
#[derive(Clone, Debug, PartialEq)]
pub enum EngineEvent {
    ModuleAttached { name: String, index: usize },
    ModuleDetached { name: String },
    FrameFailed {
        epoch: Epoch,
        phase: PhaseId,
        class: ErrorClass,
        message: String,
    },
    /// fixed update 超出上限，丢弃了一部分时间
    TimeDebtDropped { epoch: Epoch, dropped: Duration },
}

impl EngineEvent {
    #[inline]
    pub fn kind(&self) -> EventKind {
        match self {
            EngineEvent::ModuleAttached { .. } => EventKind::ModuleAttached,
            EngineEvent::ModuleDetached { .. } => EventKind::ModuleDetached,
            EngineEvent::FrameFailed { .. } => EventKind::FrameFailed,
            EngineEvent::TimeDebtDropped { .. } => EventKind::TimeDebtDropped,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    ModuleAttached,
    ModuleDetached,
    FrameFailed,
    TimeDebtDropped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Callback = Box<dyn FnMut(&EngineEvent)>;

struct Subscriber {
    id: SubscriptionId,
    /// None 表示接收所有事件
    filter: Option<EventKind>,
    callback: Callback,
}

/// 事件总线
///
/// 只在渲染线程上使用，订阅者按订阅顺序被调用。
#[derive(Default)]
pub struct EventBus {
    subscribers: Vec<Subscriber>,
    next_id: u64,
    published: u64,
}

// new & init
impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }
}

// subscribe
impl EventBus {
    pub fn subscribe(&mut self, filter: Option<EventKind>, callback: impl FnMut(&EngineEvent) + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.subscribers.push(Subscriber {
            id,
            filter,
            callback: Box::new(callback),
        });
        id
    }

    /// 返回订阅是否存在
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| s.id != id);
        before != self.subscribers.len()
    }

    /// 只向一个订阅者发送，用于 replay
    pub(crate) fn deliver_to(&mut self, id: SubscriptionId, event: &EngineEvent) {
        if let Some(subscriber) = self.subscribers.iter_mut().find(|s| s.id == id) {
            (subscriber.callback)(event);
        }
    }
}

// publish
impl EventBus {
    pub fn publish(&mut self, event: EngineEvent) {
        log::trace!("engine event: {:?}", event);
        self.published += 1;
        let kind = event.kind();
        for subscriber in &mut self.subscribers {
            if subscriber.filter.is_none_or(|f| f == kind) {
                (subscriber.callback)(&event);
            }
        }
    }

    #[inline]
    pub fn published_count(&self) -> u64 {
        self.published
    }

    #[inline]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
