use serde::{Deserialize, Serialize};

use super::TaskEnvelope;

/// 控制命令
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlCommand {
    /// 返回进程池与调度器快照
    Status,
    /// 返回正在处理的任务uuid列表
    Running,
}

/// 发往节点频道的控制消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub control: ControlCommand,
    /// 回复频道，为空时不回复
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

/// 分发进程从总线上收到的消息
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum InboundMessage {
    Control(ControlMessage),
    Task(TaskEnvelope),
}

impl InboundMessage {
    pub fn parse(payload: &str) -> serde_json::Result<Self> {
        serde_json::from_str(payload)
    }
}
