use crate::commands::command::GfxCommand;
use crate::commands::command_list::{CommandList, CommandListState};
use crate::error::InvalidStateError;
use crate::queue::QueueRole;

/// 某个队列角色的 command list 池
pub struct CommandListPool {
    role: QueueRole,
    free: Vec<CommandList>,
    next_id: u64,
}

// new & init
impl CommandListPool {
    pub fn new(role: QueueRole) -> Self {
        Self {
            role,
            free: Vec::new(),
            next_id: 0,
        }
    }
}

// getters
impl CommandListPool {
    #[inline]
    pub fn role(&self) -> QueueRole {
        self.role
    }

    #[inline]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// 池子一共创建过多少个 command list
    #[inline]
    pub fn created_count(&self) -> u64 {
        self.next_id
    }
}

// update
impl CommandListPool {
    /// 取一个处于 Free 状态的 command list
    pub fn acquire(&mut self) -> CommandList {
        self.free.pop().unwrap_or_else(|| {
            let list = CommandList::new(self.next_id, self.role);
            self.next_id += 1;
            list
        })
    }

    /// 归还队列回收的 command list，必须已经回到 Free
    pub fn release(&mut self, list: CommandList) -> Result<(), InvalidStateError> {
        if list.state() != CommandListState::Free {
            return Err(InvalidStateError {
                list: list.name().to_string(),
                from: list.state(),
                to: CommandListState::Free,
            });
        }
        self.free.push(list);
        Ok(())
    }

    /// 开始一次有作用域的录制
    pub fn recorder(&mut self, name: impl Into<String>) -> Result<CommandRecorder<'_>, InvalidStateError> {
        let mut list = self.acquire();
        list.begin(name)?;
        Ok(CommandRecorder {
            _pool: self,
            list: Some(list),
        })
    }
}

/// 有作用域的 command list 录制器
///
/// 调用 `finish` 得到 Recorded 状态的 command list；
/// 任何其他退出路径（错误、取消）都会在 drop 时丢弃正在录制的 list。
pub struct CommandRecorder<'a> {
    _pool: &'a mut CommandListPool,
    list: Option<CommandList>,
}

impl CommandRecorder<'_> {
    pub fn record(&mut self, command: GfxCommand) -> Result<(), InvalidStateError> {
        match self.list.as_mut() {
            Some(list) => list.record(command),
            None => Err(InvalidStateError {
                list: String::new(),
                from: CommandListState::Free,
                to: CommandListState::Recording,
            }),
        }
    }

    /// 在 debug event 范围内录制，闭包失败时 EndEvent 依然会被录制
    pub fn with_event<T, E>(
        &mut self,
        name: impl Into<String>,
        f: impl FnOnce(&mut Self) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<InvalidStateError>,
    {
        self.record(GfxCommand::BeginEvent(name.into()))?;
        let result = f(self);
        self.record(GfxCommand::EndEvent)?;
        result
    }

    pub fn command_count(&self) -> usize {
        self.list.as_ref().map_or(0, |list| list.commands().len())
    }

    /// 结束录制
    pub fn finish(mut self) -> Result<CommandList, InvalidStateError> {
        let mut list = self.list.take().ok_or(InvalidStateError {
            list: String::new(),
            from: CommandListState::Free,
            to: CommandListState::Recorded,
        })?;
        list.end()?;
        Ok(list)
    }
}

impl Drop for CommandRecorder<'_> {
    fn drop(&mut self) {
        if let Some(list) = self.list.take() {
            list.discard();
        }
    }
}

/// 按队列角色划分的 command list 池
///
/// 队列回收的 list 按 `queue_role` 回到对应的池子。
pub struct CommandListPools {
    pools: [CommandListPool; 4],
}

impl Default for CommandListPools {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandListPools {
    pub fn new() -> Self {
        Self {
            pools: QueueRole::ALL.map(CommandListPool::new),
        }
    }

    #[inline]
    pub fn pool_mut(&mut self, role: QueueRole) -> &mut CommandListPool {
        &mut self.pools[role.slot()]
    }

    #[inline]
    pub fn pool(&self, role: QueueRole) -> &CommandListPool {
        &self.pools[role.slot()]
    }

    pub fn recycle(&mut self, list: CommandList) -> Result<(), InvalidStateError> {
        self.pools[list.queue_role().slot()].release(list)
    }

    pub fn free_count(&self) -> usize {
        self.pools.iter().map(CommandListPool::free_count).sum()
    }
}
