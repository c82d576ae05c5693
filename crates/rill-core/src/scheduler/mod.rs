//! 可插拔调度层。
//!
//! ## 设计目标（Why）
//! - 内核中任务变成线程的唯一通道就是这里；操作符只依赖 [`Scheduler`] 与
//!   [`Worker`] 两个契约，时间语义（真实或虚拟）由实现注入。
//!
//! ## 契约说明（What）
//! - [`Worker`]：同一 Worker 上的任务严格按提交顺序、互不重叠地执行；
//!   释放 Worker 取消其全部未执行任务，在途任务跑完不被打断；
//! - [`Scheduler`]：Worker 工厂，另提供绕过 Worker 生命周期管理的
//!   `schedule_direct` 族便捷入口；
//! - 同一时刻到期的任务按提交先后执行；任务句柄在执行前释放可阻止执行；
//! - [`Scheduler::now`] 返回相对进程单调纪元的偏移，虚拟时钟实现可自由推进。
//!
//! ## 模块结构（How）
//! - `timer`：共享定时线程（二叉堆 + 条件变量），带可配置的取消任务清扫；
//! - `executor`：MPSC 队列 + WIP 门闩的执行器型 Worker（排空惯用法的直接复用）；
//! - `pool`：进程级 `computation`/`single` 线程池调度器；
//! - `test_scheduler`：虚拟时钟调度器，测试以 `advance_time_by` 驱动。

mod executor;
mod pool;
mod test_scheduler;
mod timer;

pub use executor::{Executor, ExecutorScheduler};
pub use pool::{ThreadPoolExecutor, computation, single};
pub use test_scheduler::TestScheduler;
pub use timer::now_since_epoch;

use std::sync::Arc;
use std::time::Duration;

use crate::disposable::FnDisposable;
use crate::protocol::DisposableRef;

/// 一次性任务。
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// 周期任务；每个周期各执行一次，共享同一闭包。
pub type PeriodicTask = Arc<dyn Fn() + Send + Sync + 'static>;

/// 串行任务执行单元。
pub trait Worker: Send + Sync {
    /// 尽快执行任务；返回的句柄在执行前释放可阻止执行。
    fn schedule(&self, task: Task) -> DisposableRef;

    /// 延迟执行任务。
    fn schedule_delayed(&self, task: Task, delay: Duration) -> DisposableRef;

    /// 周期执行任务；按固定节拍（初始延迟 + N × 周期）触发，不随执行耗时漂移。
    fn schedule_periodically(
        &self,
        task: PeriodicTask,
        initial_delay: Duration,
        period: Duration,
    ) -> DisposableRef;

    /// 当前时间相对进程单调纪元的偏移。
    fn now(&self) -> Duration;

    /// 幂等释放；取消全部未执行任务。
    fn dispose(&self);

    fn is_disposed(&self) -> bool;
}

/// Worker 工厂与直达调度入口。
pub trait Scheduler: Send + Sync {
    fn create_worker(&self) -> Arc<dyn Worker>;

    /// 当前时间相对进程单调纪元的偏移。
    fn now(&self) -> Duration;

    /// 在一次性 Worker 上执行任务，执行完毕自动回收 Worker。
    fn schedule_direct(&self, task: Task) -> DisposableRef {
        let worker = self.create_worker();
        let cleanup = Arc::clone(&worker);
        worker.schedule(Box::new(move || {
            task();
            cleanup.dispose();
        }));
        FnDisposable::shared(move || worker.dispose())
    }

    /// 延迟版 `schedule_direct`。
    fn schedule_direct_delayed(&self, task: Task, delay: Duration) -> DisposableRef {
        let worker = self.create_worker();
        let cleanup = Arc::clone(&worker);
        worker.schedule_delayed(
            Box::new(move || {
                task();
                cleanup.dispose();
            }),
            delay,
        );
        FnDisposable::shared(move || worker.dispose())
    }

    /// 周期版直达调度；返回句柄释放时连同 Worker 一并回收。
    fn schedule_periodically_direct(
        &self,
        task: PeriodicTask,
        initial_delay: Duration,
        period: Duration,
    ) -> DisposableRef {
        let worker = self.create_worker();
        worker.schedule_periodically(task, initial_delay, period);
        FnDisposable::shared(move || worker.dispose())
    }
}

/// 共享调度器引用。
pub type SchedulerRef = Arc<dyn Scheduler>;
