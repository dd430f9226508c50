use std::fmt;

/// 每帧的阶段，按执行顺序排列
///
/// `FixedUpdate` 每帧执行 0..N 次，其余阶段各执行一次。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PhaseId {
    FrameStart,
    Input,
    FixedUpdate,
    Gameplay,
    SceneMutation,
    TransformPropagation,
    ScenePrep,
    FrameGraph,
    CommandRecord,
    CommandSubmit,
    Present,
    FrameEnd,
}

impl PhaseId {
    pub const ALL: [PhaseId; 12] = [
        PhaseId::FrameStart,
        PhaseId::Input,
        PhaseId::FixedUpdate,
        PhaseId::Gameplay,
        PhaseId::SceneMutation,
        PhaseId::TransformPropagation,
        PhaseId::ScenePrep,
        PhaseId::FrameGraph,
        PhaseId::CommandRecord,
        PhaseId::CommandSubmit,
        PhaseId::Present,
        PhaseId::FrameEnd,
    ];

    #[inline]
    pub const fn mask(self) -> PhaseMask {
        PhaseMask::from_bits_retain(1 << self as u32)
    }

    pub const fn name(self) -> &'static str {
        match self {
            PhaseId::FrameStart => "FrameStart",
            PhaseId::Input => "Input",
            PhaseId::FixedUpdate => "FixedUpdate",
            PhaseId::Gameplay => "Gameplay",
            PhaseId::SceneMutation => "SceneMutation",
            PhaseId::TransformPropagation => "TransformPropagation",
            PhaseId::ScenePrep => "ScenePrep",
            PhaseId::FrameGraph => "FrameGraph",
            PhaseId::CommandRecord => "CommandRecord",
            PhaseId::CommandSubmit => "CommandSubmit",
            PhaseId::Present => "Present",
            PhaseId::FrameEnd => "FrameEnd",
        }
    }
}

impl fmt::Display for PhaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

bitflags::bitflags! {
    /// 模块关心的阶段集合
    ///
    /// 模块通常声明为常量：
    /// ```ignore
    /// const PHASES: PhaseMask = PhaseMask::SCENE_PREP.union(PhaseMask::COMMAND_RECORD);
    /// ```
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct PhaseMask: u32 {
        const FRAME_START = 1 << 0;
        const INPUT = 1 << 1;
        const FIXED_UPDATE = 1 << 2;
        const GAMEPLAY = 1 << 3;
        const SCENE_MUTATION = 1 << 4;
        const TRANSFORM_PROPAGATION = 1 << 5;
        const SCENE_PREP = 1 << 6;
        const FRAME_GRAPH = 1 << 7;
        const COMMAND_RECORD = 1 << 8;
        const COMMAND_SUBMIT = 1 << 9;
        const PRESENT = 1 << 10;
        const FRAME_END = 1 << 11;
    }
}

impl PhaseMask {
    #[inline]
    pub const fn has(self, phase: PhaseId) -> bool {
        self.contains(phase.mask())
    }

    /// 按执行顺序列出包含的阶段
    pub fn phases(self) -> impl Iterator<Item = PhaseId> {
        PhaseId::ALL.into_iter().filter(move |p| self.has(*p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order() {
        for pair in PhaseId::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        assert_eq!(PhaseId::ALL.len(), 12);
    }

    #[test]
    fn test_mask() {
        const MASK: PhaseMask = PhaseMask::SCENE_PREP.union(PhaseMask::FRAME_START);
        assert!(MASK.has(PhaseId::FrameStart));
        assert!(!MASK.has(PhaseId::Present));
        assert_eq!(MASK.phases().collect::<Vec<_>>(), vec![PhaseId::FrameStart, PhaseId::ScenePrep]);
        assert_eq!(PhaseMask::all().phases().count(), 12);
    }
}
