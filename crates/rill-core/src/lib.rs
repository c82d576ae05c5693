#![allow(clippy::type_complexity)]
#![doc = "rill-core：拉式背压协议下的响应式流运行时内核。"]
#![doc = ""]
#![doc = "== 分层结构 =="]
#![doc = "1. 协议原语（`protocol`）：两种风味的信号契约与校验辅助；"]
#![doc = "2. 队列原语（`queue`，crate 内部）：SPSC / MPSC 无锁队列；"]
#![doc = "3. 需求账本（`demand`）：在 MAX 处饱和的原子请求计数；"]
#![doc = "4. 排空惯用法（`drain`）：WIP 门闩与串行化投递；"]
#![doc = "5. 调度层（`scheduler`）：Worker 工厂、执行器适配、虚拟时钟；"]
#![doc = "6. 订阅仲裁（`arbiter`）与资源容器（`disposable`）；"]
#![doc = "7. 操作符（`operators`，经 `Stream` 方法暴露）与多播主体（`subject`）。"]
#![doc = ""]
#![doc = "== 并发契约 =="]
#![doc = "任何阶段保证同一时刻至多一个调用方位于下游 Sink 之内；取消与释放幂等；"]
#![doc = "核心不持有全局事件环，任务只经由 `Scheduler` 抽象成为线程。"]

pub mod arbiter;
pub mod config;
pub mod demand;
pub mod disposable;
pub mod drain;
pub mod error;
pub mod hook;
mod operators;
pub mod protocol;
pub(crate) mod queue;
pub mod scalar;
pub mod scheduler;
pub mod stream;
pub mod stream_n;
pub mod subject;
pub mod testkit;

pub use error::{ErrorKind, RillError};
pub use operators::connectable::ConnectableStream;
pub use operators::group_by::GroupedStream;
pub use protocol::{
    Disposable, DisposableRef, Handle, HandleRef, Notification, Sink, SinkN, SinkNRef, SinkRef,
    UNBOUNDED,
};
pub use scheduler::{Scheduler, SchedulerRef, TestScheduler, Worker};
pub use stream::{Stream, StreamSource};
pub use stream_n::{StreamN, StreamNSource};

/// 常用导出集合。
///
/// # 使用方式（How）
/// - `use rill_core::prelude::*;` 即可获得流类型、协议契约与调度入口；
/// - 测试辅助（`testkit`）不在此列，需显式引入。
pub mod prelude {
    pub use crate::error::{ErrorKind, RillError};
    pub use crate::operators::connectable::ConnectableStream;
    pub use crate::operators::group_by::GroupedStream;
    pub use crate::protocol::{
        Disposable, DisposableRef, Handle, HandleRef, Notification, Sink, SinkN, SinkNRef,
        SinkRef, UNBOUNDED,
    };
    pub use crate::scheduler::{Scheduler, SchedulerRef, TestScheduler, Worker};
    pub use crate::stream::{Stream, StreamSource};
    pub use crate::stream_n::{StreamN, StreamNSource};
    pub use crate::subject::{AsyncSubject, PublishSubject, ReplaySubject, UnicastSubject};
}
