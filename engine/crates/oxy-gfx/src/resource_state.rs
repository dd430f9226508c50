use std::fmt;

bitflags::bitflags! {
    /// buffer / texture 的抽象 GPU 状态
    ///
    /// 只读状态可以组合；写状态必须单独出现。
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct ResourceState: u32 {
        const COMMON = 0;
        const VERTEX_AND_CONSTANT_BUFFER = 1 << 0;
        const INDEX_BUFFER = 1 << 1;
        const RENDER_TARGET = 1 << 2;
        const UNORDERED_ACCESS = 1 << 3;
        const DEPTH_WRITE = 1 << 4;
        const DEPTH_READ = 1 << 5;
        const SHADER_RESOURCE = 1 << 6;
        const INDIRECT_ARGUMENT = 1 << 7;
        const COPY_DST = 1 << 8;
        const COPY_SRC = 1 << 9;
        const PRESENT = 1 << 10;
    }
}

impl ResourceState {
    const WRITE_MASK: ResourceState = ResourceState::RENDER_TARGET
        .union(ResourceState::UNORDERED_ACCESS)
        .union(ResourceState::DEPTH_WRITE)
        .union(ResourceState::COPY_DST);

    /// 包含任意写访问
    #[inline]
    pub fn is_write(self) -> bool {
        self.intersects(Self::WRITE_MASK)
    }

    /// 纯只读（COMMON 也算只读）
    #[inline]
    pub fn is_read_only(self) -> bool {
        !self.is_write()
    }

    #[inline]
    pub fn is_uav(self) -> bool {
        self.contains(Self::UNORDERED_ACCESS)
    }

    /// 写状态和其他状态组合是非法的
    pub fn is_valid_combination(self) -> bool {
        let writes = self.intersection(Self::WRITE_MASK);
        writes.is_empty() || (writes.bits().count_ones() == 1 && writes == self)
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("COMMON");
        }
        let mut first = true;
        for (name, _) in self.iter_names() {
            if !first {
                f.write_str("|")?;
            }
            f.write_str(name)?;
            first = false;
        }
        Ok(())
    }
}
