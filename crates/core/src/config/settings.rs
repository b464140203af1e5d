use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::NodeType;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout_seconds: u64,
    /// 作业记录所在的表（外部数据模型）
    pub jobs_table: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/dispatch".to_string(),
            max_connections: 10,
            min_connections: 1,
            connection_timeout_seconds: 30,
            jobs_table: "unified_jobs".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// 单次轮询最长阻塞时间
    pub poll_interval_seconds: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_interval_seconds: u64,
    /// 除本节点频道外额外订阅的广播频道
    pub broadcast_channels: Vec<String>,
    /// 等待控制命令回复的超时
    pub control_reply_timeout_seconds: u64,
}

impl BusConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_seconds)
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 5,
            max_reconnect_attempts: 40,
            reconnect_interval_seconds: 4,
            broadcast_channels: vec!["dispatch_broadcast_all".to_string()],
            control_reply_timeout_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// 本节点身份，同时也是本节点的队列/频道名
    pub hostname: String,
    pub node_type: NodeType,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            hostname: local_hostname(),
            node_type: NodeType::default(),
        }
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    /// 停止时等待worker退出的宽限期，超时后强制终止
    pub shutdown_grace_seconds: u64,
    /// worker进程可执行文件；为空时使用当前可执行文件
    pub worker_program: Option<String>,
    pub worker_args: Vec<String>,
}

impl PoolConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 4,
            max_workers: 16,
            shutdown_grace_seconds: 10,
            worker_program: None,
            worker_args: vec!["worker".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperSettings {
    /// 等待中的作业超过这个时长未被修改才会被回收
    pub waiting_grace_period_seconds: u64,
    /// 分发进程启动时回收本节点遗留的运行中作业
    pub reap_on_startup: bool,
}

impl ReaperSettings {
    pub fn waiting_grace_period(&self) -> Duration {
        Duration::from_secs(self.waiting_grace_period_seconds)
    }
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            waiting_grace_period_seconds: 360,
            reap_on_startup: true,
        }
    }
}

/// 一个周期性任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// 到期时分发的已注册任务名
    pub task: String,
    pub interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// `pretty` 或 `json`
    pub log_format: String,
    /// Prometheus 指标监听地址，为空时不导出
    pub metrics_listen: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_listen: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub bus: BusConfig,
    pub node: NodeConfig,
    pub pool: PoolConfig,
    pub reaper: ReaperSettings,
    pub schedules: BTreeMap<String, ScheduleConfig>,
    pub observability: ObservabilityConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        let mut schedules = BTreeMap::new();
        schedules.insert(
            "reap_orphans".to_string(),
            ScheduleConfig {
                task: "dispatch.tasks.system.reap_orphans".to_string(),
                interval_seconds: 60,
            },
        );

        Self {
            database: DatabaseConfig::default(),
            bus: BusConfig::default(),
            node: NodeConfig::default(),
            pool: PoolConfig::default(),
            reaper: ReaperSettings::default(),
            schedules,
            observability: ObservabilityConfig::default(),
        }
    }
}
