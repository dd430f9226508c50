use glam::Mat4;
use slotmap::SlotMap;
use thiserror::Error;

use crate::components::geometry::GeometryAsset;
use crate::components::material::MaterialAsset;
use crate::components::transform::Transform;
use crate::guid_new_type::{GeometryHandle, MaterialHandle, NodeHandle};

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct NodeFlags: u32 {
        const VISIBLE = 1 << 0;
        const CAST_SHADOWS = 1 << 1;
    }
}

impl Default for NodeFlags {
    fn default() -> Self {
        NodeFlags::VISIBLE | NodeFlags::CAST_SHADOWS
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SceneError {
    #[error("node {0:?} not found")]
    NodeNotFound(NodeHandle),

    #[error("geometry {0:?} not found")]
    GeometryNotFound(GeometryHandle),

    #[error("material {0:?} not found")]
    MaterialNotFound(MaterialHandle),
}

/// 节点上可以被绘制的部分
#[derive(Clone, Debug, PartialEq)]
pub struct Renderable {
    pub geometry: GeometryHandle,
    /// 按 submesh 的材质槽索引，缺失的槽使用默认材质
    pub materials: Vec<MaterialHandle>,
}

#[derive(Clone, Debug)]
pub struct SceneNode {
    pub name: String,
    parent: Option<NodeHandle>,
    children: Vec<NodeHandle>,

    local: Transform,
    world: Mat4,
    /// 本节点的 local 变换在上次传播之后被修改过
    dirty: bool,

    pub renderable: Option<Renderable>,
    pub flags: NodeFlags,
}

impl SceneNode {
    #[inline]
    pub fn parent(&self) -> Option<NodeHandle> {
        self.parent
    }

    #[inline]
    pub fn children(&self) -> &[NodeHandle] {
        &self.children
    }

    #[inline]
    pub fn local_transform(&self) -> &Transform {
        &self.local
    }

    /// 最近一次传播得到的世界变换
    #[inline]
    pub fn world_transform(&self) -> &Mat4 {
        &self.world
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// 在 CPU 侧管理场景数据
///
/// 子节点按插入顺序保存，遍历是深度优先、父节点先于子节点。
#[derive(Default)]
pub struct Scene {
    name: String,
    nodes: SlotMap<NodeHandle, SceneNode>,
    roots: Vec<NodeHandle>,

    geometries: SlotMap<GeometryHandle, GeometryAsset>,
    materials: SlotMap<MaterialHandle, MaterialAsset>,
}

// new & init
impl Scene {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: SlotMap::with_key(),
            roots: Vec::new(),
            geometries: SlotMap::with_key(),
            materials: SlotMap::with_key(),
        }
    }
}

// getters
impl Scene {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn node(&self, handle: NodeHandle) -> Option<&SceneNode> {
        self.nodes.get(handle)
    }

    #[inline]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn roots(&self) -> &[NodeHandle] {
        &self.roots
    }

    #[inline]
    pub fn geometry(&self, handle: GeometryHandle) -> Option<&GeometryAsset> {
        self.geometries.get(handle)
    }

    #[inline]
    pub fn material(&self, handle: MaterialHandle) -> Option<&MaterialAsset> {
        self.materials.get(handle)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

// update
impl Scene {
    pub fn add_geometry(&mut self, geometry: GeometryAsset) -> GeometryHandle {
        self.geometries.insert(geometry)
    }

    pub fn add_material(&mut self, material: MaterialAsset) -> MaterialHandle {
        self.materials.insert(material)
    }

    /// 创建节点，`parent` 为 None 时作为根节点
    pub fn create_node(&mut self, name: impl Into<String>, parent: Option<NodeHandle>) -> Result<NodeHandle, SceneError> {
        if let Some(parent) = parent
            && !self.nodes.contains_key(parent)
        {
            return Err(SceneError::NodeNotFound(parent));
        }

        let handle = self.nodes.insert(SceneNode {
            name: name.into(),
            parent,
            children: Vec::new(),
            local: Transform::IDENTITY,
            world: Mat4::IDENTITY,
            dirty: true,
            renderable: None,
            flags: NodeFlags::default(),
        });

        match parent.and_then(|p| self.nodes.get_mut(p)) {
            Some(parent) => parent.children.push(handle),
            None => self.roots.push(handle),
        }
        Ok(handle)
    }

    /// 删除节点和它的整棵子树，返回删除的节点数
    pub fn destroy_node(&mut self, handle: NodeHandle) -> Result<usize, SceneError> {
        let parent = self.nodes.get(handle).ok_or(SceneError::NodeNotFound(handle))?.parent;
        match parent {
            Some(parent) => {
                if let Some(parent) = self.nodes.get_mut(parent) {
                    parent.children.retain(|&c| c != handle);
                }
            }
            None => self.roots.retain(|&r| r != handle),
        }

        let mut removed = 0;
        let mut stack = vec![handle];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.remove(current) {
                stack.extend(node.children);
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn set_local_transform(&mut self, handle: NodeHandle, transform: Transform) -> Result<(), SceneError> {
        let node = self.nodes.get_mut(handle).ok_or(SceneError::NodeNotFound(handle))?;
        node.local = transform;
        node.dirty = true;
        Ok(())
    }

    pub fn set_renderable(&mut self, handle: NodeHandle, renderable: Option<Renderable>) -> Result<(), SceneError> {
        if let Some(renderable) = &renderable {
            if !self.geometries.contains_key(renderable.geometry) {
                return Err(SceneError::GeometryNotFound(renderable.geometry));
            }
            if let Some(&missing) = renderable.materials.iter().find(|&&m| !self.materials.contains_key(m)) {
                return Err(SceneError::MaterialNotFound(missing));
            }
        }
        let node = self.nodes.get_mut(handle).ok_or(SceneError::NodeNotFound(handle))?;
        node.renderable = renderable;
        Ok(())
    }

    pub fn set_flags(&mut self, handle: NodeHandle, flags: NodeFlags) -> Result<(), SceneError> {
        let node = self.nodes.get_mut(handle).ok_or(SceneError::NodeNotFound(handle))?;
        node.flags = flags;
        Ok(())
    }

    /// 从脏节点向下重新计算世界变换，返回更新的节点数
    pub fn propagate_transforms(&mut self) -> usize {
        let _span = tracy_client::span!("Scene::propagate_transforms");

        let mut updated = 0;
        // (节点, 父节点世界变换, 祖先是否被更新)
        let mut stack: Vec<(NodeHandle, Mat4, bool)> =
            self.roots.iter().rev().map(|&r| (r, Mat4::IDENTITY, false)).collect();

        while let Some((handle, parent_world, parent_updated)) = stack.pop() {
            let Some(node) = self.nodes.get_mut(handle) else {
                continue;
            };
            let update = parent_updated || node.dirty;
            if update {
                node.world = parent_world * node.local.to_mat4();
                node.dirty = false;
                updated += 1;
            }
            let world = node.world;
            stack.extend(node.children.iter().rev().map(|&c| (c, world, update)));
        }
        updated
    }
}

// tools
impl Scene {
    /// 深度优先遍历：父节点先于子节点，兄弟节点按插入顺序
    pub fn traverse(&self, mut visit: impl FnMut(NodeHandle, &SceneNode)) {
        let mut stack: Vec<NodeHandle> = self.roots.iter().rev().copied().collect();
        while let Some(handle) = stack.pop() {
            let Some(node) = self.nodes.get(handle) else {
                continue;
            };
            visit(handle, node);
            stack.extend(node.children.iter().rev());
        }
    }
}

impl Drop for Scene {
    fn drop(&mut self) {
        log::debug!("Scene \"{}\" dropped with {} nodes.", self.name, self.nodes.len());
    }
}
