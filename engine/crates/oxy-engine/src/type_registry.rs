use std::any::{TypeId, type_name};
use std::collections::HashMap;

use parking_lot::RwLock;

/// 组件类型的编号，进程内唯一
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentTypeId(u32);

impl ComponentTypeId {
    #[inline]
    pub const fn value(self) -> u32 {
        self.0
    }
}

#[derive(Default)]
struct RegistryState {
    /// 初始化次数，引擎析构时减一，归零时清空
    users: u32,
    ids: HashMap<TypeId, ComponentTypeId>,
    names: Vec<&'static str>,
}

static REGISTRY: RwLock<Option<RegistryState>> = RwLock::new(None);

/// 进程内唯一的类型注册表
///
/// 在引擎构造时 `init`，关闭时 `destroy`。多个引擎共享同一张表。
pub struct TypeRegistry;

// init & destroy
impl TypeRegistry {
    pub fn init() {
        let mut guard = REGISTRY.write();
        let state = guard.get_or_insert_with(RegistryState::default);
        state.users += 1;
        log::debug!("TypeRegistry init, users: {}", state.users);
    }

    pub fn destroy() {
        let mut guard = REGISTRY.write();
        let Some(state) = guard.as_mut() else {
            log::warn!("TypeRegistry destroyed without init");
            return;
        };
        state.users = state.users.saturating_sub(1);
        if state.users == 0 {
            log::debug!("TypeRegistry torn down, {} types", state.names.len());
            *guard = None;
        }
    }

    pub fn is_initialized() -> bool {
        REGISTRY.read().is_some()
    }
}

// register
impl TypeRegistry {
    /// 注册类型，重复注册返回同一个编号；未初始化时返回 None
    pub fn register<T: 'static>() -> Option<ComponentTypeId> {
        let key = TypeId::of::<T>();
        if let Some(id) = REGISTRY.read().as_ref()?.ids.get(&key) {
            return Some(*id);
        }

        let mut guard = REGISTRY.write();
        let state = guard.as_mut()?;
        let next = ComponentTypeId(state.names.len() as u32);
        let id = *state.ids.entry(key).or_insert(next);
        if id == next {
            state.names.push(type_name::<T>());
        }
        Some(id)
    }

    pub fn id_of<T: 'static>() -> Option<ComponentTypeId> {
        REGISTRY.read().as_ref()?.ids.get(&TypeId::of::<T>()).copied()
    }

    pub fn name_of(id: ComponentTypeId) -> Option<&'static str> {
        REGISTRY.read().as_ref()?.names.get(id.0 as usize).copied()
    }
}
