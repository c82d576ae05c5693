//! 进程级共享定时线程。
//!
//! ## 设计目标（Why）
//! - 延迟与周期任务统一路由到一条定时线程，到期后把立即任务回投给
//!   目标 Worker，避免每个 Worker 自带定时器的线程开销。
//!
//! ## 契约说明（What）
//! - 到期顺序：按（截止时刻, 提交序号）排序，同一时刻先提交者先触发；
//! - 已释放句柄的任务不再执行；启用清扫时（`purge-enabled`），定时线程按
//!   `purge-period-seconds` 的节奏把已取消条目从堆中移除，防止堆无界膨胀；
//! - 周期任务按固定节拍触发：下一次截止 = 上一次截止 + 周期，不随执行耗时漂移。

use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use crate::config;
use crate::disposable::FnDisposable;
use crate::protocol::DisposableRef;

use super::{PeriodicTask, Task};

/// 进程单调纪元；所有调度时间均为相对该纪元的偏移。
pub fn now_since_epoch() -> Duration {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed()
}

enum TimerJob {
    Once(Task),
    Periodic { task: PeriodicTask, period: Duration },
}

struct TimerEntry {
    deadline: Duration,
    seq: u64,
    job: TimerJob,
    disposed: Arc<AtomicBool>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap 为最大堆，反转比较得到“最早截止优先”。
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct TimerShared {
    heap: Mutex<BinaryHeap<TimerEntry>>,
    available: Condvar,
    seq: AtomicU64,
}

/// 共享定时器；经 [`Timer::global`] 获取进程级单例。
pub(crate) struct Timer {
    shared: Arc<TimerShared>,
}

impl Timer {
    pub(crate) fn global() -> &'static Timer {
        static TIMER: OnceLock<Timer> = OnceLock::new();
        TIMER.get_or_init(|| {
            let timer = Timer::start();
            if config::runtime().purge_enabled() {
                timer.spawn_purge(config::runtime().purge_period());
            }
            timer
        })
    }

    fn start() -> Self {
        let shared = Arc::new(TimerShared {
            heap: Mutex::new(BinaryHeap::new()),
            available: Condvar::new(),
            seq: AtomicU64::new(0),
        });
        let loop_shared = Arc::clone(&shared);
        thread::Builder::new()
            .name("rill-timer".into())
            .spawn(move || run_loop(loop_shared))
            .expect("定时线程必须能够启动");
        Self { shared }
    }

    /// 延迟一次性任务。
    pub(crate) fn schedule(&self, delay: Duration, task: Task) -> DisposableRef {
        self.push(now_since_epoch() + delay, TimerJobKind::Once(task))
    }

    /// 固定节拍周期任务。
    pub(crate) fn schedule_periodic(
        &self,
        initial_delay: Duration,
        period: Duration,
        task: PeriodicTask,
    ) -> DisposableRef {
        self.push(
            now_since_epoch() + initial_delay,
            TimerJobKind::Periodic { task, period },
        )
    }

    fn push(&self, deadline: Duration, job: TimerJobKind) -> DisposableRef {
        let disposed = Arc::new(AtomicBool::new(false));
        let entry = TimerEntry {
            deadline,
            seq: self.shared.seq.fetch_add(1, Ordering::AcqRel),
            job: match job {
                TimerJobKind::Once(task) => TimerJob::Once(task),
                TimerJobKind::Periodic { task, period } => TimerJob::Periodic { task, period },
            },
            disposed: Arc::clone(&disposed),
        };
        {
            let mut heap = self.shared.heap.lock();
            heap.push(entry);
        }
        self.shared.available.notify_one();
        FnDisposable::shared(move || disposed.store(true, Ordering::Release))
    }

    fn spawn_purge(&self, period: Duration) {
        let shared = Arc::clone(&self.shared);
        let task: PeriodicTask = Arc::new(move || {
            let mut heap = shared.heap.lock();
            if heap.iter().any(|e| e.disposed.load(Ordering::Acquire)) {
                heap.retain(|e| !e.disposed.load(Ordering::Acquire));
            }
        });
        // 清扫任务自身常驻，不提供取消句柄。
        let _ = self.schedule_periodic(period, period, task);
    }
}

enum TimerJobKind {
    Once(Task),
    Periodic { task: PeriodicTask, period: Duration },
}

fn run_loop(shared: Arc<TimerShared>) {
    loop {
        let due = {
            let mut heap = shared.heap.lock();
            loop {
                let now = now_since_epoch();
                match heap.peek() {
                    None => {
                        shared.available.wait(&mut heap);
                    }
                    Some(entry) if entry.deadline <= now => {
                        break heap.pop().expect("peek 已确认堆非空");
                    }
                    Some(entry) => {
                        let timeout = entry.deadline - now;
                        let _ = shared.available.wait_for(&mut heap, timeout);
                    }
                }
            }
        };
        // 任务在锁外执行，执行期间不阻塞新的提交。
        if due.disposed.load(Ordering::Acquire) {
            continue;
        }
        match due.job {
            TimerJob::Once(task) => task(),
            TimerJob::Periodic { task, period } => {
                task();
                if !due.disposed.load(Ordering::Acquire) {
                    let next = TimerEntry {
                        deadline: due.deadline + period,
                        seq: shared.seq.fetch_add(1, Ordering::AcqRel),
                        job: TimerJob::Periodic { task, period },
                        disposed: due.disposed,
                    };
                    shared.heap.lock().push(next);
                    shared.available.notify_one();
                }
            }
        }
    }
}
