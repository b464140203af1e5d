use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dispatch_core::{
    AppConfig, Instance, PubSub, ReconnectPolicy, ShutdownManager, ShutdownReason,
};
use dispatch_dispatcher::{
    AutoscalePool, DispatcherService, ProcessSpawner, Reaper, ReaperConfig, Scheduler,
    ServiceConfig,
};
use dispatch_infrastructure::{DatabaseManager, PgNotifier, PgPubSubConnection, PostgresJobRepository};
use dispatch_worker::TaskWorker;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::io::BufReader;
use tracing::{debug, info, warn};

use crate::tasks;

/// 组装并运行分发进程，直到收到关闭信号或总线要求重启
pub async fn run_dispatcher(
    config: AppConfig,
    config_path: Option<PathBuf>,
) -> Result<ShutdownReason> {
    if let Some(listen) = &config.observability.metrics_listen {
        install_metrics_exporter(listen)?;
    }

    let instance =
        Instance::new(config.node.hostname.clone()).with_node_type(config.node.node_type);

    let db = DatabaseManager::new(&config.database)
        .await
        .context("连接数据库失败")?;
    let conn = PgPubSubConnection::connect(db.pool().clone())
        .await
        .context("建立订阅连接失败")?;

    let shutdown = ShutdownManager::new();
    let bus = PubSub::new(conn)?
        .with_reconnect_policy(ReconnectPolicy {
            max_attempts: config.bus.max_reconnect_attempts,
            interval: config.bus.reconnect_interval(),
        })
        .with_supervisor(shutdown.clone());

    let spawner = worker_spawner(&config, config_path.as_ref())?;
    let pool = AutoscalePool::new(
        Arc::new(spawner),
        config.pool.min_workers,
        config.pool.max_workers,
    )?
    .with_shutdown_grace(config.pool.shutdown_grace());

    let (scheduler, schedule_tasks) = build_scheduler(&config)?;

    let repo = PostgresJobRepository::new(db.pool().clone(), config.database.jobs_table.clone())?;
    let reaper = Reaper::new(Arc::new(repo), ReaperConfig::from(&config.reaper));

    let service = DispatcherService::new(
        instance,
        bus,
        Arc::new(PgNotifier::new(db.pool().clone())),
        pool,
        shutdown.clone(),
        ServiceConfig {
            poll_interval: config.bus.poll_interval(),
            reap_on_startup: config.reaper.reap_on_startup,
        },
    )
    .with_channels(config.listen_channels())
    .with_schedules(scheduler, schedule_tasks)
    .with_reaper(reaper);

    let signals = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        signals.shutdown().await;
    });

    let result = service.run().await;
    db.close().await;
    Ok(result?)
}

/// worker 进程入口：stdin 读任务，stdout 写完成报告
pub async fn run_worker(config: AppConfig) -> Result<()> {
    let registry = tasks::build_registry(&config)?;
    let worker = TaskWorker::new(Arc::new(registry));
    info!("worker进程已启动 pid={}", std::process::id());

    // Ctrl+C 由分发进程统一处理
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut interrupt = signal(SignalKind::interrupt()).context("安装SIGINT信号处理器失败")?;
        tokio::spawn(async move {
            while interrupt.recv().await.is_some() {
                debug!("worker忽略SIGINT");
            }
        });
    }

    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    worker
        .work_loop_until(stdin, stdout, terminate_signal())
        .await?;

    info!("worker进程退出 pid={}", std::process::id());
    Ok(())
}

fn worker_spawner(config: &AppConfig, config_path: Option<&PathBuf>) -> Result<ProcessSpawner> {
    let mut args = config.pool.worker_args.clone();
    if let Some(path) = config_path {
        args.push("--config".to_string());
        args.push(path.display().to_string());
    }

    let spawner = match &config.pool.worker_program {
        Some(program) => ProcessSpawner::new(program, args),
        None => ProcessSpawner::current_exe(args).context("无法确定当前可执行文件路径")?,
    };
    // worker 与分发进程使用同一个节点身份
    Ok(spawner.with_env("DISPATCH__NODE__HOSTNAME", config.node.hostname.clone()))
}

/// 按配置构造调度器，返回周期任务名到任务名的映射
fn build_scheduler(config: &AppConfig) -> Result<(Scheduler, HashMap<String, String>)> {
    let entries: Vec<(String, Duration)> = config
        .schedules
        .iter()
        .map(|(name, schedule)| (name.clone(), Duration::from_secs(schedule.interval_seconds)))
        .collect();
    let scheduler = Scheduler::new(entries, Instant::now())?;

    let schedule_tasks = config
        .schedules
        .iter()
        .map(|(name, schedule)| (name.clone(), schedule.task.clone()))
        .collect();
    Ok((scheduler, schedule_tasks))
}

fn install_metrics_exporter(listen: &str) -> Result<()> {
    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("无效的指标监听地址: {listen}"))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("启动Prometheus指标导出失败")?;
    info!("Prometheus指标导出已启动: http://{addr}/metrics");
    Ok(())
}

/// 等待关闭信号
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("安装Ctrl+C信号处理器失败: {e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("收到Ctrl+C信号");
        },
        _ = terminate_signal() => {
            info!("收到SIGTERM信号");
        },
    }
}

async fn terminate_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(e) => {
                warn!("安装SIGTERM信号处理器失败: {e}");
                std::future::pending::<()>().await;
            }
        }
    }

    #[cfg(not(unix))]
    std::future::pending::<()>().await;
}
