use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};

use crate::frame_context::FrameContext;

/// 其他线程投递到渲染线程的命令，在阶段边界上执行
pub type EngineCommand = Box<dyn FnOnce(&mut FrameContext) + Send>;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxError {
    #[error("engine inbox is full")]
    Full,
    #[error("engine has shut down")]
    Disconnected,
}

/// 有界的命令队列
pub struct Inbox {
    sender: Sender<EngineCommand>,
    receiver: Receiver<EngineCommand>,
    executed: u64,
}

// new & init
impl Inbox {
    pub const DEFAULT_CAPACITY: usize = 256;

    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(capacity.max(1));
        Self {
            sender,
            receiver,
            executed: 0,
        }
    }
}

// getters
impl Inbox {
    #[inline]
    pub fn sender(&self) -> InboxSender {
        InboxSender {
            sender: self.sender.clone(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    #[inline]
    pub fn executed_count(&self) -> u64 {
        self.executed
    }
}

// update
impl Inbox {
    /// 执行当前队列中的所有命令，执行过程中新投递的命令留到下一次
    pub fn drain(&mut self, ctx: &mut FrameContext) -> usize {
        let pending = self.receiver.len();
        let mut count = 0;
        while count < pending {
            match self.receiver.try_recv() {
                Ok(command) => {
                    command(ctx);
                    count += 1;
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        self.executed += count as u64;
        count
    }
}

/// 可以跨线程 clone 的投递端
#[derive(Clone)]
pub struct InboxSender {
    sender: Sender<EngineCommand>,
}

impl InboxSender {
    pub fn post(&self, command: impl FnOnce(&mut FrameContext) + Send + 'static) -> Result<(), InboxError> {
        self.sender.try_send(Box::new(command)).map_err(|err| match err {
            TrySendError::Full(_) => InboxError::Full,
            TrySendError::Disconnected(_) => InboxError::Disconnected,
        })
    }
}
