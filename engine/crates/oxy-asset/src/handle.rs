use slotmap::new_key_type;

new_key_type! { pub struct AssetHandle; }

/// 资产在 GPU 上的形态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AssetKind {
    /// 顶点、索引等数据
    Buffer,
    /// 单 mip 的 2D 纹理
    Texture,
}

/// 资源加载状态机
///
/// 状态流转: Unloaded -> Loading -> Uploading -> Ready
///                                  \-> Failed
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LoadStatus {
    /// 初始状态，资源尚未请求加载
    Unloaded,
    /// 后台线程正在读取并烘焙数据
    Loading,
    /// 数据已经交给上传协调器，等待 transfer 队列的 fence
    Uploading,
    /// GPU 资源已经就绪
    Ready,
    /// 读取、解析或上传失败
    Failed,
}

impl LoadStatus {
    #[inline]
    pub fn is_pending(self) -> bool {
        matches!(self, LoadStatus::Loading | LoadStatus::Uploading)
    }
}
