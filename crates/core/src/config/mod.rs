//! 分发服务配置
//!
//! 加载顺序：内置默认值 → TOML 配置文件 → `DISPATCH__` 前缀的环境变量，
//! 后者覆盖前者。例如 `DISPATCH__POOL__MAX_WORKERS=32`。

mod settings;
mod validation;

use std::path::Path;

use config::{Config, Environment, File, FileFormat};

pub use settings::{
    AppConfig, BusConfig, DatabaseConfig, NodeConfig, ObservabilityConfig, PoolConfig,
    ReaperSettings, ScheduleConfig,
};
pub use validation::{ConfigValidator, ValidationUtils};

use crate::{DispatchError, DispatchResult};

/// 未指定配置文件时依次查找的位置
const DEFAULT_CONFIG_PATHS: [&str; 2] = ["dispatch.toml", "/etc/dispatch/dispatch.toml"];

pub const ENV_PREFIX: &str = "DISPATCH";

impl AppConfig {
    /// 加载并校验配置
    ///
    /// 显式给出的配置文件必须存在；未给出时使用第一个存在的默认路径，都不存在则只用默认值。
    pub fn load(path: Option<&Path>) -> DispatchResult<Self> {
        let defaults = Config::try_from(&AppConfig::default())
            .map_err(|e| DispatchError::config(format!("无法构建默认配置: {e}")))?;

        let mut builder = Config::builder().add_source(defaults);

        match path {
            Some(path) => {
                builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
            }
            None => {
                if let Some(found) = DEFAULT_CONFIG_PATHS.iter().find(|p| Path::new(p).exists()) {
                    builder = builder.add_source(File::new(found, FileFormat::Toml));
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("bus.broadcast_channels")
                .with_list_parse_key("pool.worker_args"),
        );

        let config: AppConfig = builder
            .build()
            .map_err(|e| DispatchError::config(format!("构建配置失败: {e}")))?
            .try_deserialize()
            .map_err(|e| DispatchError::config(format!("反序列化配置失败: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// 从 TOML 字符串解析，缺省字段不补默认值
    pub fn from_toml(toml_str: &str) -> DispatchResult<Self> {
        let config: AppConfig = toml::from_str(toml_str)
            .map_err(|e| DispatchError::config(format!("解析TOML配置失败: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> DispatchResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| DispatchError::config(format!("序列化配置为TOML失败: {e}")))
    }

    /// 本节点需要订阅的全部频道，第一个总是节点自身的频道
    pub fn listen_channels(&self) -> Vec<String> {
        let mut channels = vec![self.node.hostname.clone()];
        for channel in &self.bus.broadcast_channels {
            if !channels.contains(channel) {
                channels.push(channel.clone());
            }
        }
        channels
    }
}
