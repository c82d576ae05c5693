//! 执行器型调度器：把任意“接受闭包的执行器”适配为满足串行契约的 Worker。
//!
//! ## 执行逻辑（How）
//! - Worker 内部是一条 MPSC 任务队列加 WIP 门闩（排空惯用法的直接复用）：
//!   `schedule` 入队任务，若门闩此前空闲则把排空例程提交给底层执行器；
//! - 纯延迟任务路由到共享定时线程，到期后把立即任务回投本 Worker，
//!   由此保证延迟任务与立即任务在同一 Worker 上仍互不重叠；
//! - 周期任务由定时线程按节拍触发，每个节拍都以普通任务身份入队。

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::disposable::{CompositeDisposable, SerialDisposable};
use crate::drain::DrainGate;
use crate::protocol::{Disposable, DisposableRef, NoopDisposable};
use crate::queue::MpscLinkedQueue;

use super::timer::{Timer, now_since_epoch};
use super::{PeriodicTask, Scheduler, Task, Worker};

/// 底层执行器契约：接受闭包并在某个线程上运行它。
pub trait Executor: Send + Sync {
    fn execute(&self, job: Task);
}

/// 包装执行器的调度器。
pub struct ExecutorScheduler {
    executor: Arc<dyn Executor>,
}

impl ExecutorScheduler {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }
}

impl Scheduler for ExecutorScheduler {
    fn create_worker(&self) -> Arc<dyn Worker> {
        ExecutorWorker::create(Arc::clone(&self.executor))
    }

    fn now(&self) -> Duration {
        now_since_epoch()
    }
}

/// 入队任务：值语义的一次性闭包加取消标志。
struct ScheduledJob {
    task: Mutex<Option<Task>>,
    disposed: AtomicBool,
}

impl ScheduledJob {
    fn new(task: Task) -> Arc<Self> {
        Arc::new(Self {
            task: Mutex::new(Some(task)),
            disposed: AtomicBool::new(false),
        })
    }

    fn run(&self) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        if let Some(task) = self.task.lock().take() {
            task();
        }
    }
}

impl Disposable for ScheduledJob {
    fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            self.task.lock().take();
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

struct ExecutorWorker {
    executor: Arc<dyn Executor>,
    queue: MpscLinkedQueue<Arc<ScheduledJob>>,
    gate: DrainGate,
    disposed: AtomicBool,
    /// 路由到定时线程的句柄；Worker 释放时整组取消，残留条目由清扫回收。
    timed: CompositeDisposable,
    this: Weak<ExecutorWorker>,
}

impl ExecutorWorker {
    fn create(executor: Arc<dyn Executor>) -> Arc<dyn Worker> {
        Arc::new_cyclic(|this| ExecutorWorker {
            executor,
            queue: MpscLinkedQueue::new(),
            gate: DrainGate::new(),
            disposed: AtomicBool::new(false),
            timed: CompositeDisposable::new(),
            this: this.clone(),
        })
    }

    fn submit_drain(&self) {
        if let Some(worker) = self.this.upgrade() {
            self.executor.execute(Box::new(move || worker.drain()));
        }
    }

    fn drain(&self) {
        let mut missed = 1;
        loop {
            while let Some(job) = self.queue.poll() {
                if self.disposed.load(Ordering::Acquire) {
                    self.queue.clear();
                    break;
                }
                job.run();
            }
            missed = self.gate.leave(missed);
            if missed == 0 {
                return;
            }
        }
    }
}

impl Worker for ExecutorWorker {
    fn schedule(&self, task: Task) -> DisposableRef {
        if self.disposed.load(Ordering::Acquire) {
            return NoopDisposable::shared();
        }
        let job = ScheduledJob::new(task);
        self.queue.offer(Arc::clone(&job));
        if self.gate.enter() {
            self.submit_drain();
        }
        job
    }

    fn schedule_delayed(&self, task: Task, delay: Duration) -> DisposableRef {
        if delay.is_zero() {
            return self.schedule(task);
        }
        if self.disposed.load(Ordering::Acquire) {
            return NoopDisposable::shared();
        }
        // 先持有定时句柄，到期后换持 Worker 内的任务句柄。
        let chain = Arc::new(SerialDisposable::new());
        let chain_at_fire = Arc::clone(&chain);
        let worker = self.this.clone();
        let timer_handle = Timer::global().schedule(
            delay,
            Box::new(move || {
                if chain_at_fire.is_disposed() {
                    return;
                }
                if let Some(worker) = worker.upgrade() {
                    chain_at_fire.set(worker.schedule(task));
                }
            }),
        );
        chain.set(timer_handle);
        self.timed.add(Arc::clone(&chain) as DisposableRef);
        chain
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
        let worker = self.this.clone();
        let handle = Timer::global().schedule_periodic(
            initial_delay,
            period,
            Arc::new(move || {
                if let Some(worker) = worker.upgrade() {
                    let tick = Arc::clone(&task);
                    worker.schedule(Box::new(move || tick()));
                }
            }),
        );
        self.timed.add(Arc::clone(&handle));
        handle
    }

    fn now(&self) -> Duration {
        now_since_epoch()
    }

    fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            // 队列清理留给当选的排空例程（单消费者纪律）；
            // 若此刻没有排空在场，残余任务随 Worker 析构回收。
            self.timed.dispose();
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
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    /// 直接起新线程的朴素执行器，专供单元测试。
    struct SpawnExecutor;

    impl Executor for SpawnExecutor {
        fn execute(&self, job: Task) {
            thread::spawn(job);
        }
    }

    fn wait_until(deadline_ms: u64, check: impl Fn() -> bool) -> bool {
        for _ in 0..deadline_ms {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        check()
    }

    /// 同一 Worker 上的任务必须严格按提交顺序执行且互不重叠。
    #[test]
    fn worker_runs_tasks_in_order() {
        let scheduler = ExecutorScheduler::new(Arc::new(SpawnExecutor));
        let worker = scheduler.create_worker();
        let order = Arc::new(PlMutex::new(Vec::new()));
        for tag in 0..64 {
            let order = Arc::clone(&order);
            worker.schedule(Box::new(move || order.lock().push(tag)));
        }
        assert!(
            wait_until(1_000, || order.lock().len() == 64),
            "任务必须全部执行完毕"
        );
        assert_eq!(order.lock().clone(), (0..64).collect::<Vec<_>>(), "顺序必须与提交一致");
        worker.dispose();
    }

    /// 释放 Worker 后，未执行任务被取消、新任务被拒绝。
    #[test]
    fn disposed_worker_rejects_new_tasks() {
        let scheduler = ExecutorScheduler::new(Arc::new(SpawnExecutor));
        let worker = scheduler.create_worker();
        worker.dispose();
        assert!(worker.is_disposed());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let handle = worker.schedule(Box::new(move || {
            counter.fetch_add(1, Ordering::AcqRel);
        }));
        assert!(handle.is_disposed(), "释放后的调度必须返回已释放句柄");
        thread::sleep(Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::Acquire), 0, "已释放 Worker 不得执行任务");
    }

    /// 延迟任务在到期前可释放；到期后照常执行。
    #[test]
    fn delayed_task_respects_disposal() {
        let scheduler = ExecutorScheduler::new(Arc::new(SpawnExecutor));
        let worker = scheduler.create_worker();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let handle = worker.schedule_delayed(
            Box::new(move || {
                counter.fetch_add(1, Ordering::AcqRel);
            }),
            Duration::from_millis(40),
        );
        handle.dispose();

        let counter = Arc::clone(&fired);
        worker.schedule_delayed(
            Box::new(move || {
                counter.fetch_add(10, Ordering::AcqRel);
            }),
            Duration::from_millis(40),
        );

        assert!(
            wait_until(1_000, || fired.load(Ordering::Acquire) == 10),
            "未释放的延迟任务必须执行，已释放的不得执行"
        );
        worker.dispose();
    }
}
