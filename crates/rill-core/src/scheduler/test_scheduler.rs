//! 虚拟时钟调度器，测试以编程方式推进时间。
//!
//! ## 契约说明（What）
//! - [`TestScheduler::advance_time_by`] / [`advance_time_to`]：推进虚拟时钟并
//!   依（截止时刻, 提交序号）顺序执行所有到期任务；推进过程中新提交且仍在
//!   目标时刻之内的任务同样会被执行；
//! - [`TestScheduler::trigger_actions`]：只执行“当前时刻及更早”的任务，不推进时钟；
//! - 周期任务按固定节拍重新入队；任务执行发生在调用 `advance_*` 的线程上，
//!   因而测试天然确定。

use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::disposable::FnDisposable;
use crate::protocol::{DisposableRef, NoopDisposable};

use super::{PeriodicTask, Scheduler, Task, Worker};

enum VirtualJob {
    Once(Task),
    Periodic { task: PeriodicTask, period: Duration },
}

struct VirtualEntry {
    at: Duration,
    seq: u64,
    job: VirtualJob,
    disposed: Arc<AtomicBool>,
}

impl PartialEq for VirtualEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for VirtualEntry {}

impl PartialOrd for VirtualEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for VirtualEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.at.cmp(&self.at).then_with(|| other.seq.cmp(&self.seq))
    }
}

struct VirtualState {
    now: Duration,
    seq: u64,
    queue: BinaryHeap<VirtualEntry>,
}

/// 虚拟时钟调度器。
#[derive(Clone)]
pub struct TestScheduler {
    state: Arc<Mutex<VirtualState>>,
}

impl Default for TestScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TestScheduler {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(VirtualState {
                now: Duration::ZERO,
                seq: 0,
                queue: BinaryHeap::new(),
            })),
        }
    }

    /// 将虚拟时钟推进 `delta` 并执行途中到期的全部任务。
    pub fn advance_time_by(&self, delta: Duration) {
        let target = self.state.lock().now + delta;
        self.advance_time_to(target);
    }

    /// 将虚拟时钟推进到绝对时刻 `target`。
    pub fn advance_time_to(&self, target: Duration) {
        self.run_due(target);
        let mut state = self.state.lock();
        if state.now < target {
            state.now = target;
        }
    }

    /// 执行当前时刻及更早的任务，不推进时钟。
    pub fn trigger_actions(&self) {
        let now = self.state.lock().now;
        self.run_due(now);
    }

    fn run_due(&self, target: Duration) {
        loop {
            let entry = {
                let mut state = self.state.lock();
                match state.queue.peek() {
                    Some(entry) if entry.at <= target => {
                        let entry = state.queue.pop().expect("peek 已确认堆非空");
                        // 任务观察到的“当前时刻”即其截止时刻。
                        if state.now < entry.at {
                            state.now = entry.at;
                        }
                        entry
                    }
                    _ => return,
                }
            };
            if entry.disposed.load(Ordering::Acquire) {
                continue;
            }
            match entry.job {
                VirtualJob::Once(task) => task(),
                VirtualJob::Periodic { task, period } => {
                    task();
                    if !entry.disposed.load(Ordering::Acquire) {
                        let mut state = self.state.lock();
                        let seq = state.seq;
                        state.seq += 1;
                        state.queue.push(VirtualEntry {
                            at: entry.at + period,
                            seq,
                            job: VirtualJob::Periodic { task, period },
                            disposed: entry.disposed,
                        });
                    }
                }
            }
        }
    }

    fn push(&self, delay: Duration, job: VirtualJob) -> DisposableRef {
        let disposed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&disposed);
        let mut state = self.state.lock();
        let seq = state.seq;
        state.seq += 1;
        let at = state.now + delay;
        state.queue.push(VirtualEntry {
            at,
            seq,
            job,
            disposed,
        });
        FnDisposable::shared(move || flag.store(true, Ordering::Release))
    }
}

impl Scheduler for TestScheduler {
    fn create_worker(&self) -> Arc<dyn Worker> {
        Arc::new(TestWorker {
            scheduler: self.clone(),
            disposed: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
        })
    }

    fn now(&self) -> Duration {
        self.state.lock().now
    }
}

struct TestWorker {
    scheduler: TestScheduler,
    disposed: AtomicBool,
    handles: Mutex<Vec<DisposableRef>>,
}

impl TestWorker {
    fn track(&self, handle: DisposableRef) -> DisposableRef {
        self.handles.lock().push(Arc::clone(&handle));
        handle
    }
}

impl Worker for TestWorker {
    fn schedule(&self, task: Task) -> DisposableRef {
        self.schedule_delayed(task, Duration::ZERO)
    }

    fn schedule_delayed(&self, task: Task, delay: Duration) -> DisposableRef {
        if self.disposed.load(Ordering::Acquire) {
            return NoopDisposable::shared();
        }
        self.track(self.scheduler.push(delay, VirtualJob::Once(task)))
    }

    fn schedule_periodically(
        &self,
        task: PeriodicTask,
        initial_delay: Duration,
        period: Duration,
    ) -> DisposableRef {
        if self.disposed.load(Ordering::Acquire) {
            return NoopDisposable::shared();
        }
        self.track(
            self.scheduler
                .push(initial_delay, VirtualJob::Periodic { task, period }),
        )
    }

    fn now(&self) -> Duration {
        self.scheduler.now()
    }

    fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            for handle in self.handles.lock().drain(..) {
                handle.dispose();
            }
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    /// 到期任务按（时刻, 提交序号）顺序执行，未到期任务保持待命。
    #[test]
    fn advances_run_due_tasks_in_order() {
        let scheduler = TestScheduler::new();
        let worker = scheduler.create_worker();
        let log = Arc::new(PlMutex::new(Vec::new()));

        for (tag, delay_ms) in [(1u32, 100u64), (2, 50), (3, 100), (4, 200)] {
            let log = Arc::clone(&log);
            worker.schedule_delayed(
                Box::new(move || log.lock().push(tag)),
                Duration::from_millis(delay_ms),
            );
        }

        scheduler.advance_time_by(Duration::from_millis(100));
        assert_eq!(log.lock().clone(), vec![2, 1, 3], "同刻任务按提交顺序执行");
        scheduler.advance_time_by(Duration::from_millis(100));
        assert_eq!(log.lock().clone(), vec![2, 1, 3, 4]);
    }

    /// 任务执行时观察到的 now 等于其截止时刻。
    #[test]
    fn task_observes_its_deadline_as_now() {
        let scheduler = TestScheduler::new();
        let worker = scheduler.create_worker();
        let observed = Arc::new(PlMutex::new(None));
        let slot = Arc::clone(&observed);
        let probe = scheduler.clone();
        worker.schedule_delayed(
            Box::new(move || *slot.lock() = Some(probe.now())),
            Duration::from_millis(30),
        );
        scheduler.advance_time_by(Duration::from_millis(90));
        assert_eq!(*observed.lock(), Some(Duration::from_millis(30)));
        assert_eq!(scheduler.now(), Duration::from_millis(90), "推进后时钟落在目标时刻");
    }

    /// 周期任务按节拍触发；释放 Worker 后停止。
    #[test]
    fn periodic_reenqueues_until_worker_disposed() {
        let scheduler = TestScheduler::new();
        let worker = scheduler.create_worker();
        let hits = Arc::new(PlMutex::new(0u32));
        let counter = Arc::clone(&hits);
        worker.schedule_periodically(
            Arc::new(move || *counter.lock() += 1),
            Duration::from_millis(10),
            Duration::from_millis(10),
        );
        scheduler.advance_time_by(Duration::from_millis(35));
        assert_eq!(*hits.lock(), 3, "10/20/30ms 三个节拍必须触发");
        worker.dispose();
        scheduler.advance_time_by(Duration::from_millis(100));
        assert_eq!(*hits.lock(), 3, "释放后不得再触发");
    }

    /// trigger_actions 只触发当前时刻内的任务。
    #[test]
    fn trigger_actions_does_not_advance_clock() {
        let scheduler = TestScheduler::new();
        let worker = scheduler.create_worker();
        let hits = Arc::new(PlMutex::new(0u32));
        let counter = Arc::clone(&hits);
        worker.schedule(Box::new(move || *counter.lock() += 1));
        let counter = Arc::clone(&hits);
        worker.schedule_delayed(
            Box::new(move || *counter.lock() += 10),
            Duration::from_millis(1),
        );
        scheduler.trigger_actions();
        assert_eq!(*hits.lock(), 1, "零延迟任务触发，未来任务保持待命");
        assert_eq!(scheduler.now(), Duration::ZERO);
    }
}
