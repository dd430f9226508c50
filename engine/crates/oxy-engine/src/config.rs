//! 引擎、渲染器和平台配置
//!
//! 从 TOML 加载，时长以整数毫秒（或微秒）书写。
//!
//! ```toml
//! [engine]
//! target_fps = 60
//! max_fixed_update_duration_ms = 200
//!
//! [engine.application]
//! name = "demo"
//!
//! [renderer]
//! upload_queue_key = "copy"
//!
//! [platform]
//! headless = true
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use oxy_gfx::queue::QueueStrategy;
use oxy_render_interface::phase_error::{ErrorClass, PhaseError};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("required field `{0}` is missing")]
    MissingField(&'static str),

    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl From<ConfigError> for PhaseError {
    fn from(err: ConfigError) -> Self {
        let message = err.to_string();
        PhaseError::with_class(ErrorClass::FatalToEngine, message).with_source(err)
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ApplicationInfo {
    pub name: String,
    pub version: u32,
}

impl Default for ApplicationInfo {
    fn default() -> Self {
        Self {
            name: "oxy".to_string(),
            version: 1,
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct EngineProps {
    pub application: ApplicationInfo,
    /// 0 表示不限制帧率
    pub target_fps: u32,
    /// 运行的帧数，0 表示不限制
    pub frame_count: u32,
    pub max_fixed_update_duration_ms: u64,
    pub fixed_timestep_us: u64,
    pub enable_imgui_layer: bool,
    pub main_window_id: u32,
    pub extensions: Vec<String>,
}

impl Default for EngineProps {
    fn default() -> Self {
        Self {
            application: ApplicationInfo::default(),
            target_fps: 0,
            frame_count: 0,
            max_fixed_update_duration_ms: 200,
            fixed_timestep_us: 16_667,
            enable_imgui_layer: false,
            main_window_id: 0,
            extensions: Vec::new(),
        }
    }
}

impl EngineProps {
    #[inline]
    pub fn max_fixed_update_duration(&self) -> Duration {
        Duration::from_millis(self.max_fixed_update_duration_ms)
    }

    #[inline]
    pub fn fixed_timestep(&self) -> Duration {
        Duration::from_micros(self.fixed_timestep_us)
    }

    /// 帧间隔下限，`target_fps` 为 0 时返回 None
    pub fn frame_interval(&self) -> Option<Duration> {
        (self.target_fps > 0).then(|| Duration::from_secs_f64(1.0 / self.target_fps as f64))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fixed_timestep_us == 0 {
            return Err(ConfigError::Invalid {
                field: "engine.fixed_timestep_us",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.max_fixed_update_duration() < self.fixed_timestep() {
            return Err(ConfigError::Invalid {
                field: "engine.max_fixed_update_duration_ms",
                reason: format!(
                    "{:?} is shorter than one fixed step of {:?}",
                    self.max_fixed_update_duration(),
                    self.fixed_timestep()
                ),
            });
        }
        Ok(())
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct RendererConfig {
    /// 上传使用的队列，必须提供
    pub upload_queue_key: Option<String>,
    pub graphics_queue_key: String,
    /// 不提供时 compute pass 跑在 graphics 队列上
    pub compute_queue_key: Option<String>,
    /// 等待 fence 的超时，0 表示不超时
    pub fence_timeout_ms: u64,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            upload_queue_key: None,
            graphics_queue_key: "graphics".to_string(),
            compute_queue_key: None,
            fence_timeout_ms: 5000,
        }
    }
}

impl RendererConfig {
    pub fn upload_queue_key(&self) -> Result<&str, ConfigError> {
        match self.upload_queue_key.as_deref() {
            Some(key) if !key.is_empty() => Ok(key),
            _ => Err(ConfigError::MissingField("renderer.upload_queue_key")),
        }
    }

    pub fn fence_timeout(&self) -> Option<Duration> {
        (self.fence_timeout_ms > 0).then(|| Duration::from_millis(self.fence_timeout_ms))
    }

    /// 由配置得到队列映射，present 总是和 graphics 同一个队列
    pub fn queue_strategy(&self) -> Result<QueueStrategy, ConfigError> {
        let upload = self.upload_queue_key()?;
        if self.graphics_queue_key.is_empty() {
            return Err(ConfigError::MissingField("renderer.graphics_queue_key"));
        }
        let graphics = self.graphics_queue_key.as_str();
        let compute = self.compute_queue_key.as_deref().filter(|k| !k.is_empty()).unwrap_or(graphics);
        Ok(QueueStrategy::dedicated(graphics, compute, upload, graphics))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.queue_strategy().map(|_| ())
    }
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct PlatformConfig {
    pub headless: bool,
    /// 资源加载线程池的大小，0 表示不使用线程池
    pub thread_pool_size: u32,
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfigFile {
    pub engine: EngineProps,
    pub renderer: RendererConfig,
    pub platform: PlatformConfig,
}

impl EngineConfigFile {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        log::info!("load config from {}", path.display());
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;
        self.renderer.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxy_gfx::queue::{QueueKey, QueueRole};

    #[test]
    fn test_parse_full() {
        let text = r#"
            [engine]
            target_fps = 60
            frame_count = 3
            max_fixed_update_duration_ms = 100
            fixed_timestep_us = 20000
            extensions = ["a", "b"]

            [engine.application]
            name = "demo"
            version = 7

            [renderer]
            upload_queue_key = "copy"
            compute_queue_key = "async"

            [platform]
            headless = true
            thread_pool_size = 4
        "#;
        let config = EngineConfigFile::from_toml_str(text).unwrap();
        assert_eq!(config.engine.application.name, "demo");
        assert_eq!(config.engine.fixed_timestep(), Duration::from_millis(20));
        assert_eq!(config.engine.extensions, vec!["a".to_string(), "b".to_string()]);
        assert!(config.platform.headless);

        let strategy = config.renderer.queue_strategy().unwrap();
        assert_eq!(strategy.key_for(QueueRole::Transfer), &QueueKey::new("copy"));
        assert_eq!(strategy.key_for(QueueRole::Compute), &QueueKey::new("async"));
        assert!(strategy.shares_queue(QueueRole::Graphics, QueueRole::Present));
    }

    #[test]
    fn test_upload_queue_key_required() {
        let err = EngineConfigFile::from_toml_str("[engine]\ntarget_fps = 30\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingField("renderer.upload_queue_key")));

        let err = EngineConfigFile::from_toml_str("[renderer]\nupload_queue_key = \"\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(_)));

        let phase: PhaseError = err.into();
        assert!(phase.is_fatal_to_engine());
    }

    #[test]
    fn test_validate_fixed_update() {
        let props = EngineProps {
            fixed_timestep_us: 0,
            ..Default::default()
        };
        assert!(props.validate().is_err());

        let props = EngineProps {
            max_fixed_update_duration_ms: 10,
            fixed_timestep_us: 20_000,
            ..Default::default()
        };
        assert!(props.validate().is_err());
        assert!(EngineProps::default().validate().is_ok());
    }
}
