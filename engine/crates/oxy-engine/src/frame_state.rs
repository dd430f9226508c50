use thiserror::Error;

/// 一帧的生命周期
///
/// `Idle → Preparing → Recording → Submitted → Presenting → Retiring → Idle`。
/// 失败的帧跳过 `Presenting`，但总是经过 `Retiring`。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum FrameState {
    #[default]
    Idle,
    Preparing,
    Recording,
    Submitted,
    Presenting,
    Retiring,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid frame state transition {from:?} -> {to:?}")]
pub struct FrameStateError {
    pub from: FrameState,
    pub to: FrameState,
}

impl FrameState {
    pub fn can_transition(self, to: FrameState) -> bool {
        use FrameState::*;
        matches!(
            (self, to),
            (Idle, Preparing)
                | (Preparing, Recording)
                | (Recording, Submitted)
                | (Submitted, Presenting)
                | (Preparing | Recording | Submitted | Presenting, Retiring)
                | (Retiring, Idle)
        )
    }

    pub fn transition(&mut self, to: FrameState) -> Result<(), FrameStateError> {
        if !self.can_transition(to) {
            return Err(FrameStateError { from: *self, to });
        }
        *self = to;
        Ok(())
    }
}
