use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{DispatchError, DispatchResult};

/// 日志输出目标
///
/// worker 进程的 stdout 是与分发进程通信的管道，只能写 stderr。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    Stdout,
    Stderr,
}

/// 初始化日志系统
///
/// `RUST_LOG` 存在时优先于 `log_level`。
pub fn init_logging(log_level: &str, log_format: &str, target: LogTarget) -> DispatchResult<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match (log_format, target) {
        ("json", LogTarget::Stdout) => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        ("json", LogTarget::Stderr) => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        ("pretty", LogTarget::Stdout) => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init(),
        ("pretty", LogTarget::Stderr) => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        _ => {
            return Err(DispatchError::config(format!(
                "不支持的日志格式: {log_format}"
            )))
        }
    };

    result.map_err(|e| DispatchError::config(format!("初始化日志系统失败: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_format_is_rejected() {
        let err = init_logging("info", "xml", LogTarget::Stdout).unwrap_err();
        assert!(matches!(err, DispatchError::Configuration(_)));
    }
}
