//! 周期性任务调度器
//!
//! 同一周期的多个任务在周期内均匀错开（offset），避免同时触发。
//! 调度器只做计数：某一时刻应完成的次数减去已完成次数即为错过的次数。

use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};

use dispatch_core::{DispatchError, DispatchResult};
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    name: String,
    interval: Duration,
    offset: Duration,
    completed_runs: u64,
    last_run: Option<Instant>,
}

impl ScheduleEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn offset(&self) -> Duration {
        self.offset
    }

    pub fn completed_runs(&self) -> u64 {
        self.completed_runs
    }

    /// 截至 `elapsed` 应该完成的运行次数
    fn expected_runs(&self, elapsed: Duration) -> u64 {
        if elapsed < self.offset {
            return 0;
        }
        let runs = (elapsed - self.offset).as_nanos() / self.interval.as_nanos();
        u64::try_from(runs).unwrap_or(u64::MAX)
    }

    /// 截至 `elapsed` 错过的运行次数，不小于0；大于0即为到期
    pub fn missed_runs(&self, elapsed: Duration) -> u64 {
        self.expected_runs(elapsed)
            .saturating_sub(self.completed_runs)
    }

    /// 下一次运行相对 `global_start` 的时间；超出 `Duration` 范围时为 `None`
    fn next_run(&self) -> Option<Duration> {
        let runs = u32::try_from(self.completed_runs.saturating_add(1)).ok()?;
        self.interval.checked_mul(runs)?.checked_add(self.offset)
    }

    fn mark_run(&mut self, elapsed: Duration, now: Instant) {
        let expected = self.expected_runs(elapsed);
        let missed = expected.saturating_sub(self.completed_runs.saturating_add(1));
        if missed > 0 {
            warn!("周期任务 {} 错过了 {} 次运行", self.name, missed);
        }
        self.completed_runs = expected;
        self.last_run = Some(now);
    }
}

/// 单个周期任务的诊断信息
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScheduleStatus {
    pub last_run_seconds_ago: Option<f64>,
    pub next_run_in_seconds: f64,
    pub offset_in_seconds: f64,
    pub completed_runs: u64,
    pub missed_runs: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SchedulerSnapshot {
    pub schedule_list: BTreeMap<String, ScheduleStatus>,
}

pub struct Scheduler {
    global_start: Instant,
    entries: Vec<ScheduleEntry>,
}

impl Scheduler {
    /// `entries` 按给定顺序分配 offset：同一周期 `T` 的第 `i` 个（共 `k` 个）任务
    /// 的 offset 为 `i·T/k`
    pub fn new(entries: Vec<(String, Duration)>, global_start: Instant) -> DispatchResult<Self> {
        let mut seen = HashSet::new();
        for (name, interval) in &entries {
            if !seen.insert(name.as_str()) {
                return Err(DispatchError::config(format!("重复的周期任务名称: {name}")));
            }
            if interval.is_zero() {
                return Err(DispatchError::config(format!("周期任务 {name} 的周期不能为0")));
            }
        }

        let mut by_interval: BTreeMap<Duration, u32> = BTreeMap::new();
        for (_, interval) in &entries {
            *by_interval.entry(*interval).or_default() += 1;
        }
        for (interval, count) in &by_interval {
            if *count > 1 && *interval / *count < Duration::from_secs(1) {
                return Err(DispatchError::config(format!(
                    "too many schedules: {count} 个周期任务共享 {:?} 的周期，间隔不足1秒",
                    interval
                )));
            }
        }

        let mut positions: BTreeMap<Duration, u32> = BTreeMap::new();
        let entries = entries
            .into_iter()
            .map(|(name, interval)| {
                let count = by_interval[&interval];
                let position = positions.entry(interval).or_default();
                let offset = interval
                    .checked_mul(*position)
                    .map(|d| d / count)
                    .unwrap_or_else(|| interval / count * *position);
                *position += 1;
                debug!("周期任务 {name}: 周期 {:?}, offset {:?}", interval, offset);
                ScheduleEntry {
                    name,
                    interval,
                    offset,
                    completed_runs: 0,
                    last_run: None,
                }
            })
            .collect();

        Ok(Self {
            global_start,
            entries,
        })
    }

    /// 没有任何周期任务的调度器
    pub fn empty() -> Self {
        Self {
            global_start: Instant::now(),
            entries: Vec::new(),
        }
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get_and_mark_pending(&mut self) -> Vec<String> {
        self.get_and_mark_pending_at(Instant::now())
    }

    /// 返回在 `now` 时刻到期的任务并标记为已运行
    ///
    /// 连续错过的多次运行合并为一次。
    pub fn get_and_mark_pending_at(&mut self, now: Instant) -> Vec<String> {
        let elapsed = now.saturating_duration_since(self.global_start);
        let mut due = Vec::new();
        for entry in &mut self.entries {
            if entry.missed_runs(elapsed) > 0 {
                entry.mark_run(elapsed, now);
                due.push(entry.name.clone());
            }
        }
        due
    }

    /// 距离下一个任务到期还有多久
    pub fn time_until_next_run_at(&self, now: Instant) -> Option<Duration> {
        let elapsed = now.saturating_duration_since(self.global_start);
        self.entries
            .iter()
            .map(|entry| match entry.next_run() {
                Some(next) => next.saturating_sub(elapsed),
                None => Duration::MAX,
            })
            .min()
    }

    pub fn debug(&self) -> SchedulerSnapshot {
        self.debug_at(Instant::now())
    }

    pub fn debug_at(&self, now: Instant) -> SchedulerSnapshot {
        let elapsed = now.saturating_duration_since(self.global_start);
        let schedule_list = self
            .entries
            .iter()
            .map(|entry| {
                let next_run = entry.offset.as_secs_f64()
                    + entry.interval.as_secs_f64() * entry.completed_runs.saturating_add(1) as f64;
                let status = ScheduleStatus {
                    last_run_seconds_ago: entry
                        .last_run
                        .map(|t| now.saturating_duration_since(t).as_secs_f64()),
                    next_run_in_seconds: next_run - elapsed.as_secs_f64(),
                    offset_in_seconds: entry.offset.as_secs_f64(),
                    completed_runs: entry.completed_runs,
                    missed_runs: entry.missed_runs(elapsed),
                };
                (entry.name.clone(), status)
            })
            .collect();
        SchedulerSnapshot { schedule_list }
    }
}
