use serde::{Deserialize, Serialize};

/// worker 完成一个任务后写回的一行报告
///
/// 未知字段被忽略；`error` 为 `None` 表示成功。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishedReport {
    pub uuid: String,
    #[serde(default)]
    pub error: Option<String>,
}

impl FinishedReport {
    pub fn success(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            error: None,
        }
    }

    pub fn failure(uuid: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
