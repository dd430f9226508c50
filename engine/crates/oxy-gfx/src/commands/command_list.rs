use itertools::Itertools;

use crate::commands::command::GfxCommand;
use crate::error::InvalidStateError;
use crate::queue::QueueRole;

/// CommandList 的状态
///
/// `Free → Recording → Recorded → Executing → Free`，其他转换都是错误。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandListState {
    Free,
    Recording,
    Recorded,
    Executing,
}

/// 录制好的命令序列
///
/// 放弃录制的 command list 直接销毁（`discard`），不会绕过状态机回到 Free。
#[derive(Debug)]
pub struct CommandList {
    id: u64,
    name: String,
    queue_role: QueueRole,
    state: CommandListState,
    commands: Vec<GfxCommand>,
}

// new & init
impl CommandList {
    pub fn new(id: u64, queue_role: QueueRole) -> Self {
        Self {
            id,
            name: String::new(),
            queue_role,
            state: CommandListState::Free,
            commands: Vec::new(),
        }
    }
}

// getters
impl CommandList {
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn queue_role(&self) -> QueueRole {
        self.queue_role
    }

    #[inline]
    pub fn state(&self) -> CommandListState {
        self.state
    }

    #[inline]
    pub fn commands(&self) -> &[GfxCommand] {
        &self.commands
    }
}

// 状态转换
impl CommandList {
    fn transition(&mut self, expected: CommandListState, to: CommandListState) -> Result<(), InvalidStateError> {
        if self.state != expected {
            return Err(InvalidStateError {
                list: self.name.clone(),
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// Free -> Recording
    pub fn begin(&mut self, name: impl Into<String>) -> Result<(), InvalidStateError> {
        let name = name.into();
        if self.state == CommandListState::Free {
            self.name = name;
        }
        self.transition(CommandListState::Free, CommandListState::Recording)
    }

    pub fn record(&mut self, command: GfxCommand) -> Result<(), InvalidStateError> {
        if self.state != CommandListState::Recording {
            return Err(InvalidStateError {
                list: self.name.clone(),
                from: self.state,
                to: CommandListState::Recording,
            });
        }
        self.commands.push(command);
        Ok(())
    }

    /// Recording -> Recorded
    pub fn end(&mut self) -> Result<(), InvalidStateError> {
        self.transition(CommandListState::Recording, CommandListState::Recorded)
    }

    /// Recorded -> Executing，由队列在提交时调用
    pub fn mark_executing(&mut self) -> Result<(), InvalidStateError> {
        self.transition(CommandListState::Recorded, CommandListState::Executing)
    }

    /// Executing -> Free，GPU 执行完成后由队列调用
    pub fn retire(&mut self) -> Result<(), InvalidStateError> {
        self.transition(CommandListState::Executing, CommandListState::Free)?;
        self.commands.clear();
        Ok(())
    }

    /// 放弃这个 command list
    pub fn discard(self) {
        log::debug!("command list \"{}\" discarded in state {:?}", self.name, self.state);
    }
}

// tools
impl CommandList {
    /// 每条命令一行的调试文本
    pub fn serialize(&self) -> String {
        self.commands.iter().map(GfxCommand::serialize).join("\n")
    }

    /// 所有拷贝命令的字节数之和
    pub fn copy_bytes(&self) -> u64 {
        self.commands.iter().map(GfxCommand::copy_bytes).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorded_list() -> CommandList {
        let mut list = CommandList::new(0, QueueRole::Graphics);
        list.begin("test").unwrap();
        list.record(GfxCommand::BeginEvent("pass".to_string())).unwrap();
        list.record(GfxCommand::EndEvent).unwrap();
        list.end().unwrap();
        list
    }

    #[test]
    fn test_full_cycle() {
        let mut list = recorded_list();
        assert_eq!(list.state(), CommandListState::Recorded);
        assert_eq!(list.serialize(), "begin_event \"pass\"\nend_event");

        list.mark_executing().unwrap();
        list.retire().unwrap();
        assert_eq!(list.state(), CommandListState::Free);
        assert!(list.commands().is_empty());
    }

    #[test]
    fn test_invalid_transitions() {
        let mut list = CommandList::new(0, QueueRole::Graphics);
        // Free 不能直接 end / 提交 / 回收
        assert!(list.end().is_err());
        assert!(list.mark_executing().is_err());
        assert!(list.retire().is_err());
        assert!(list.record(GfxCommand::EndEvent).is_err());

        list.begin("a").unwrap();
        let err = list.begin("b").unwrap_err();
        assert_eq!(err.from, CommandListState::Recording);
        assert_eq!(err.to, CommandListState::Recording);
        assert_eq!(list.name(), "a");

        list.end().unwrap();
        assert!(list.record(GfxCommand::EndEvent).is_err());
        assert!(list.retire().is_err());

        list.mark_executing().unwrap();
        assert!(list.mark_executing().is_err());
        assert!(list.begin("c").is_err());
    }
}
