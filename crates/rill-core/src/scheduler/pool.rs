//! 进程级线程池执行器与标准调度器入口。
//!
//! ## 契约说明（What）
//! - [`ThreadPoolExecutor`]：固定线程数的任务池；提交的闭包在任一空闲线程
//!   上执行，串行性由上层 [`ExecutorScheduler`](super::ExecutorScheduler)
//!   的 Worker 队列保证，与池内线程数无关；
//! - [`computation`]：按可用并行度定容的共享池，首次使用时惰性初始化；
//! - [`single`]：单线程共享池，适合严格串行的轻量任务。

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};
use std::thread;

use super::executor::{Executor, ExecutorScheduler};
use super::{SchedulerRef, Task};

struct PoolShared {
    queue: Mutex<VecDeque<Task>>,
    available: Condvar,
}

/// 固定线程数的执行器。
pub struct ThreadPoolExecutor {
    shared: Arc<PoolShared>,
}

impl ThreadPoolExecutor {
    /// 启动 `threads` 条工作线程，线程名为 `{name}-{序号}`。
    pub fn new(threads: usize, name: &str) -> Self {
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        });
        for index in 0..threads.max(1) {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || {
                    loop {
                        let job = {
                            let mut queue = shared.queue.lock();
                            loop {
                                match queue.pop_front() {
                                    Some(job) => break job,
                                    None => shared.available.wait(&mut queue),
                                }
                            }
                        };
                        job();
                    }
                })
                .expect("线程池工作线程必须能够启动");
        }
        Self { shared }
    }
}

impl Executor for ThreadPoolExecutor {
    fn execute(&self, job: Task) {
        self.shared.queue.lock().push_back(job);
        self.shared.available.notify_one();
    }
}

/// 共享计算调度器；容量等于可用并行度。
pub fn computation() -> SchedulerRef {
    static COMPUTATION: OnceLock<SchedulerRef> = OnceLock::new();
    Arc::clone(COMPUTATION.get_or_init(|| {
        let parallelism = thread::available_parallelism().map_or(2, |n| n.get());
        Arc::new(ExecutorScheduler::new(Arc::new(ThreadPoolExecutor::new(
            parallelism,
            "rill-computation",
        ))))
    }))
}

/// 共享单线程调度器。
pub fn single() -> SchedulerRef {
    static SINGLE: OnceLock<SchedulerRef> = OnceLock::new();
    Arc::clone(SINGLE.get_or_init(|| {
        Arc::new(ExecutorScheduler::new(Arc::new(ThreadPoolExecutor::new(
            1,
            "rill-single",
        ))))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// 计算调度器的任务在池内线程执行，而非调用线程。
    #[test]
    fn computation_runs_off_caller_thread() {
        let caller = thread::current().id();
        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        computation().schedule_direct(Box::new(move || {
            *slot.lock() = Some(thread::current().id());
        }));
        for _ in 0..1_000 {
            if seen.lock().is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        let executed_on = seen.lock().expect("任务必须执行");
        assert_ne!(executed_on, caller, "任务必须脱离调用线程执行");
    }

    /// 多 Worker 并发提交互不干扰，任务计数完整。
    #[test]
    fn pool_handles_many_workers() {
        let scheduler = computation();
        let hits = Arc::new(AtomicUsize::new(0));
        let workers: Vec<_> = (0..4).map(|_| scheduler.create_worker()).collect();
        for worker in &workers {
            for _ in 0..100 {
                let counter = Arc::clone(&hits);
                worker.schedule(Box::new(move || {
                    counter.fetch_add(1, Ordering::AcqRel);
                }));
            }
        }
        for _ in 0..2_000 {
            if hits.load(Ordering::Acquire) == 400 {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(hits.load(Ordering::Acquire), 400, "任务不得丢失");
        for worker in workers {
            worker.dispose();
        }
    }
}
