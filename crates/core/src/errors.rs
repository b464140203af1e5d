use thiserror::Error;

/// 分发层错误类型定义
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("配置错误: {0}")]
    Configuration(String),

    /// 发布任务时没有给出目标队列
    #[error("{task}: Queue value required and may not be None")]
    QueueRequired { task: String },

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 通知总线连接重试耗尽
    #[error("通知总线不可用，已重试 {attempts} 次: {message}")]
    BusUnavailable { attempts: u32, message: String },

    /// 通知总线断线后重连成功，订阅状态不可信，需要进程重启
    #[error("通知总线已重连，需要重启分发进程")]
    BusRestartRequired,

    #[error("通知总线错误: {0}")]
    Bus(String),

    #[error("Worker进程错误: {0}")]
    Process(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl DispatchError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// 连接类错误会触发总线重连逻辑
    pub fn is_connection_error(&self) -> bool {
        match self {
            DispatchError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
                    | sqlx::Error::Tls(_)
            ),
            DispatchError::Bus(_) | DispatchError::Io(_) => true,
            _ => false,
        }
    }
}

/// 统一的Result类型
pub type DispatchResult<T> = std::result::Result<T, DispatchError>;
