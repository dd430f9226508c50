use glam::Vec4;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum AlphaMode {
    #[default]
    Opaque,
    /// alpha 小于 cutoff 的像素被丢弃
    Mask { cutoff: f32 },
    Blend,
}

/// CPU 侧的材质数据
#[derive(Clone, Debug, PartialEq)]
pub struct MaterialAsset {
    pub name: String,
    pub base_color: Vec4,
    pub metallic: f32,
    pub roughness: f32,
    pub alpha_mode: AlphaMode,
    pub double_sided: bool,

    /// 贴图的资产 label，空表示不使用贴图
    pub base_color_map: String,
    pub normal_map: String,
}

impl Default for MaterialAsset {
    fn default() -> Self {
        Self {
            name: String::new(),
            base_color: Vec4::ONE,
            metallic: 0.0,
            roughness: 0.5,
            alpha_mode: AlphaMode::Opaque,
            double_sided: false,
            base_color_map: String::new(),
            normal_map: String::new(),
        }
    }
}

impl MaterialAsset {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_alpha_mode(mut self, alpha_mode: AlphaMode) -> Self {
        self.alpha_mode = alpha_mode;
        self
    }
}
