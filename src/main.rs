use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dispatch_core::{init_logging, AppConfig, ControlCommand, LogTarget, ShutdownReason};
use tracing::{error, info};

mod app;
mod control_client;
mod tasks;

/// 进程管理器看到这个退出码时应重新拉起分发进程
const RESTART_EXIT_CODE: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "dispatchd")]
#[command(version)]
#[command(about = "集群任务分发：本地进程池、周期任务与孤儿作业回收")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// 配置文件路径
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// 日志级别，覆盖配置文件
    #[arg(short, long, global = true, value_parser = ["trace", "debug", "info", "warn", "error"])]
    log_level: Option<String>,

    /// 日志格式，覆盖配置文件
    #[arg(long, global = true, value_parser = ["json", "pretty"])]
    log_format: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 运行本节点的分发进程
    Dispatcher,
    /// 运行一个 worker 进程（由分发进程启动，通过 stdin/stdout 通信）
    Worker,
    /// 查询分发进程的状态
    Status {
        /// 目标节点，默认为本节点
        #[arg(long)]
        node: Option<String>,
    },
    /// 列出分发进程正在处理的任务uuid
    Running {
        #[arg(long)]
        node: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref()).with_context(|| match &cli.config {
        Some(path) => format!("加载配置文件失败: {}", path.display()),
        None => "加载配置失败".to_string(),
    })?;

    let log_level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.observability.log_level);
    let log_format = cli
        .log_format
        .as_deref()
        .unwrap_or(&config.observability.log_format);
    let target = match cli.command {
        Commands::Worker => LogTarget::Stderr,
        _ => LogTarget::Stdout,
    };
    init_logging(log_level, log_format, target)?;

    match cli.command {
        Commands::Dispatcher => {
            info!("启动分发进程，节点: {}", config.node.hostname);
            match app::run_dispatcher(config, cli.config).await {
                Ok(ShutdownReason::Requested) => {
                    info!("分发进程已退出");
                    Ok(ExitCode::SUCCESS)
                }
                Ok(ShutdownReason::Restart(why)) => {
                    info!("分发进程退出等待重启: {why}");
                    Ok(ExitCode::from(RESTART_EXIT_CODE))
                }
                Err(e) => {
                    error!("分发进程运行失败: {e:#}");
                    Err(e)
                }
            }
        }
        Commands::Worker => {
            app::run_worker(config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status { node } => {
            control_client::query(&config, node, ControlCommand::Status).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Running { node } => {
            control_client::query(&config, node, ControlCommand::Running).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
