use std::fmt;

/// 队列在帧中扮演的角色
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueRole {
    Graphics,
    Compute,
    Transfer,
    Present,
}

impl QueueRole {
    pub const ALL: [QueueRole; 4] = [QueueRole::Graphics, QueueRole::Compute, QueueRole::Transfer, QueueRole::Present];

    #[inline]
    pub(crate) const fn slot(self) -> usize {
        self as usize
    }
}

impl fmt::Display for QueueRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueueRole::Graphics => "graphics",
            QueueRole::Compute => "compute",
            QueueRole::Transfer => "transfer",
            QueueRole::Present => "present",
        };
        f.write_str(name)
    }
}

/// 具体后端队列的名字
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueKey(String);

impl QueueKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for QueueKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 从 QueueRole 到 QueueKey 的映射
///
/// single-queue 策略下所有角色都指向同一个 key。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueStrategy {
    keys: [QueueKey; 4],
}

// new & init
impl QueueStrategy {
    pub fn single_queue(key: impl Into<QueueKey>) -> Self {
        let key = key.into();
        Self {
            keys: [key.clone(), key.clone(), key.clone(), key],
        }
    }

    pub fn dedicated(
        graphics: impl Into<QueueKey>,
        compute: impl Into<QueueKey>,
        transfer: impl Into<QueueKey>,
        present: impl Into<QueueKey>,
    ) -> Self {
        Self {
            keys: [graphics.into(), compute.into(), transfer.into(), present.into()],
        }
    }

    /// 替换某个角色的 key
    pub fn with_role(mut self, role: QueueRole, key: impl Into<QueueKey>) -> Self {
        self.keys[role.slot()] = key.into();
        self
    }
}

impl From<String> for QueueKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// getters
impl QueueStrategy {
    #[inline]
    pub fn key_for(&self, role: QueueRole) -> &QueueKey {
        &self.keys[role.slot()]
    }

    /// 去重后的 key，按角色顺序
    pub fn unique_keys(&self) -> Vec<QueueKey> {
        let mut keys: Vec<QueueKey> = Vec::with_capacity(4);
        for key in &self.keys {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
        keys
    }

    pub fn is_single_queue(&self) -> bool {
        self.unique_keys().len() == 1
    }

    /// 两个角色是否落在同一个队列上
    pub fn shares_queue(&self, a: QueueRole, b: QueueRole) -> bool {
        self.key_for(a) == self.key_for(b)
    }
}
