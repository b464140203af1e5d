use std::sync::Arc;
use std::time::Duration;

use dispatch_core::models::TaskEnvelope;
use dispatch_dispatcher::{AutoscalePool, CleanupReport, PoolWorker, StopSignal};
use dispatch_testing_utils::{eventually, test_registry, InProcessSpawner, TestTasks, BLOCK_TASK};

async fn autoscale(min: usize, max: usize) -> (AutoscalePool, Arc<InProcessSpawner>, TestTasks) {
    let (registry, tasks) = test_registry();
    let spawner = Arc::new(InProcessSpawner::new(Arc::new(registry)));
    let mut pool = AutoscalePool::new(spawner.clone(), min, max)
        .unwrap()
        .with_shutdown_grace(Duration::from_millis(200));
    pool.init_workers().await.unwrap();
    (pool, spawner, tasks)
}

fn block() -> TaskEnvelope {
    TaskEnvelope::bare(BLOCK_TASK)
}

/// 反复维护直到发现已退出的 worker
async fn cleanup_until_removed(pool: &mut AutoscalePool) -> CleanupReport {
    for _ in 0..200 {
        let report = pool.cleanup().await.unwrap();
        if !report.removed_workers.is_empty() {
            return report;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no dead worker was detected");
}

#[tokio::test]
async fn test_invalid_bounds() {
    let (registry, _tasks) = test_registry();
    let spawner = Arc::new(InProcessSpawner::new(Arc::new(registry)));
    assert!(AutoscalePool::new(spawner.clone(), 4, 2).is_err());
    assert!(AutoscalePool::new(spawner.clone(), 0, 0).is_err());
    assert!(AutoscalePool::new(spawner, 0, 1).is_ok());
}

#[tokio::test]
async fn test_grows_by_one_when_all_workers_are_busy() {
    let (mut pool, _spawner, tasks) = autoscale(2, 4).await;
    assert_eq!(pool.len(), 2);

    assert_eq!(pool.write(0, block()).await.unwrap(), 0);
    assert_eq!(pool.write(0, block()).await.unwrap(), 1);
    assert_eq!(pool.len(), 2);

    // 全部在忙，扩容一个并写给新 worker
    assert_eq!(pool.write(0, block()).await.unwrap(), 2);
    assert_eq!(pool.len(), 3);
    assert_eq!(pool.write(1, block()).await.unwrap(), 3);
    assert_eq!(pool.len(), 4);
    assert!(pool.full());

    // 已满，不再扩容
    pool.write(0, block()).await.unwrap();
    assert_eq!(pool.len(), 4);
    assert_eq!(pool.pool().qsize(), 1);
    assert_eq!(pool.up().await.unwrap(), None);

    tasks.release(5);
    pool.stop(StopSignal::Terminate).await;
}

#[tokio::test]
async fn test_idle_worker_is_preferred_over_growth() {
    let (mut pool, _spawner, tasks) = autoscale(2, 4).await;
    assert_eq!(pool.write(1, block()).await.unwrap(), 1);
    // 首选的 worker 在忙，但还有空闲 worker，不扩容
    assert_eq!(pool.write(1, block()).await.unwrap(), 0);
    assert_eq!(pool.len(), 2);

    tasks.release(2);
    pool.stop(StopSignal::Terminate).await;
}

#[tokio::test]
async fn test_cleanup_shrinks_back_to_min_workers() {
    let (mut pool, _spawner, tasks) = autoscale(1, 3).await;
    for _ in 0..3 {
        pool.write(0, block()).await.unwrap();
    }
    assert_eq!(pool.len(), 3);

    // 负载未消退时不回收
    let report = pool.cleanup().await.unwrap();
    assert!(report.retired_workers.is_empty());
    assert_eq!(pool.len(), 3);

    tasks.release(3);
    assert!(
        eventually(Duration::from_secs(2), || {
            pool.calculate_managed_tasks();
            pool.iter().all(PoolWorker::idle)
        })
        .await
    );

    let report = pool.cleanup().await.unwrap();
    assert_eq!(report.retired_workers, vec![2, 1]);
    assert_eq!(pool.len(), 1);

    let report = pool.cleanup().await.unwrap();
    assert!(report.retired_workers.is_empty());
    assert_eq!(pool.len(), 1);

    pool.stop(StopSignal::Terminate).await;
}

#[tokio::test]
async fn test_busy_workers_are_not_retired() {
    let (mut pool, _spawner, tasks) = autoscale(1, 3).await;
    for _ in 0..3 {
        pool.write(0, block()).await.unwrap();
    }

    // 只放行一个任务：哪个 worker 先完成不确定，只有空闲的那个会被回收
    tasks.release(1);
    assert!(
        eventually(Duration::from_secs(2), || {
            pool.calculate_managed_tasks();
            pool.iter().filter(|w| w.idle()).count() == 1
        })
        .await
    );

    let report = pool.cleanup().await.unwrap();
    assert_eq!(report.retired_workers.len(), 1);
    assert_eq!(pool.len(), 2);
    assert!(pool.iter().all(PoolWorker::busy));

    tasks.release(2);
    pool.stop(StopSignal::Terminate).await;
}

#[tokio::test]
async fn test_dead_worker_is_replaced_and_its_tasks_orphaned() {
    let (mut pool, spawner, tasks) = autoscale(2, 4).await;
    let envelope = block();
    let uuid = envelope.uuid.clone();
    assert_eq!(pool.write(0, envelope).await.unwrap(), 0);

    spawner.crash(0);
    let report = cleanup_until_removed(&mut pool).await;

    assert_eq!(report.removed_workers, vec![0]);
    assert_eq!(report.spawned, 1);
    assert_eq!(report.orphaned.len(), 1);
    assert_eq!(report.orphaned[0].uuid, uuid);
    assert_eq!(pool.len(), 2);
    assert_eq!(spawner.spawned_count(), 3);
    assert!(pool.debug().running_uuids().is_empty());

    tasks.release(1);
    pool.stop(StopSignal::Terminate).await;
}

#[tokio::test]
async fn test_write_replaces_dead_workers_first() {
    let (mut pool, spawner, tasks) = autoscale(1, 2).await;
    spawner.crash(0);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let index = pool.write(0, block()).await.unwrap();
    assert_eq!(index, 0);
    assert_eq!(pool.len(), 1);
    assert_eq!(pool.iter().next().unwrap().id(), 1);

    tasks.release(1);
    pool.stop(StopSignal::Terminate).await;
}

#[tokio::test]
async fn test_spawn_failure_is_reported() {
    let (mut pool, spawner, _tasks) = autoscale(1, 2).await;
    spawner.crash(0);
    spawner.fail_next_spawns(1);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(pool.cleanup().await.is_err());
    // 下一轮维护恢复
    let report = pool.cleanup().await.unwrap();
    assert_eq!(report.spawned, 1);
    assert_eq!(pool.len(), 1);
    pool.stop(StopSignal::Terminate).await;
}

fn is_managed(pool: &AutoscalePool, uuid: &str) -> bool {
    pool.iter()
        .any(|w| w.managed_tasks().iter().any(|t| t.uuid == uuid))
}

#[tokio::test]
async fn test_failed_growth_queues_on_existing_worker() {
    let (mut pool, spawner, tasks) = autoscale(2, 4).await;
    pool.write(0, block()).await.unwrap();
    pool.write(1, block()).await.unwrap();

    spawner.fail_next_spawns(1);
    let envelope = block();
    let uuid = envelope.uuid.clone();
    let index = pool.write(0, envelope).await.unwrap();

    assert!(index < 2);
    assert_eq!(pool.len(), 2);
    assert!(is_managed(&pool, &uuid));
    assert_eq!(pool.pool().qsize(), 1);

    tasks.release(3);
    pool.stop(StopSignal::Terminate).await;
}

#[tokio::test]
async fn test_failed_replacement_writes_to_surviving_worker() {
    let (mut pool, spawner, tasks) = autoscale(2, 4).await;
    spawner.crash(0);
    tokio::time::sleep(Duration::from_millis(50)).await;

    spawner.fail_next_spawns(1);
    let envelope = block();
    let uuid = envelope.uuid.clone();
    assert_eq!(pool.write(0, envelope).await.unwrap(), 0);

    assert_eq!(pool.len(), 1);
    assert_eq!(pool.iter().next().unwrap().id(), 1);
    assert!(is_managed(&pool, &uuid));

    // 下一轮维护补足下限
    let report = pool.cleanup().await.unwrap();
    assert_eq!(report.spawned, 1);
    assert_eq!(pool.len(), 2);

    tasks.release(1);
    pool.stop(StopSignal::Terminate).await;
}

#[tokio::test]
async fn test_write_fails_only_without_any_worker() {
    let (mut pool, spawner, _tasks) = autoscale(1, 1).await;
    spawner.crash(0);
    tokio::time::sleep(Duration::from_millis(50)).await;

    spawner.fail_next_spawns(2);
    assert!(pool.write(0, block()).await.is_err());
    assert!(pool.is_empty());
    pool.stop(StopSignal::Terminate).await;
}

#[tokio::test]
async fn test_debug_reports_bounds() {
    let (mut pool, _spawner, _tasks) = autoscale(2, 5).await;
    let snapshot = pool.debug();
    assert_eq!(snapshot.min_workers, 2);
    assert_eq!(snapshot.max_workers, Some(5));
    assert_eq!(snapshot.workers.len(), 2);
    pool.stop(StopSignal::Terminate).await;
}
