//! 队列排空惯用法：WIP 计数与串行化投递。
//!
//! ## 设计目标（Why）
//! - 所有带内部缓冲的操作符共享同一个串行化装置：将 WIP 从 0 翻转到 1 的
//!   线程当选唯一排空者，其余线程只入队并累加 WIP；排空者在本地计数归零后
//!   重新检查 WIP，决定再入循环或让出所有权。
//! - 按组合而非继承建模：排空门闩与队列作为字段嵌入操作符状态，而不是让
//!   订阅者结构去继承原子计数器。
//!
//! ## 契约说明（What）
//! - [`DrainGate::try_fast_path`]：CAS 0→1，当选者可直接对下游发射；
//! - [`DrainGate::enter`]：自增并返回“此前是否空闲”，`true` 表示须进入排空循环；
//! - [`DrainGate::leave`]：扣除本轮消化的 missed 数，返回剩余；仅当返回 0
//!   时排空者才允许退出循环；
//! - 循环体内不得阻塞；取消与终止标志必须在每轮迭代复查。

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::RillError;
use crate::hook;
use crate::protocol::{HandleRef, Notification, Sink, SinkRef};
use crate::queue::MpscLinkedQueue;

/// 工作中（WIP）计数门闩。
#[derive(Debug, Default)]
pub struct DrainGate {
    wip: AtomicUsize,
}

impl DrainGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// 快速路径：仅当完全空闲时当选。
    pub fn try_fast_path(&self) -> bool {
        self.wip
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// 争用路径：登记一份工作，返回“此前是否空闲”。
    pub fn enter(&self) -> bool {
        self.wip.fetch_add(1, Ordering::AcqRel) == 0
    }

    /// 扣除已消化的工作量，返回剩余；非零表示循环必须继续。
    pub fn leave(&self, missed: usize) -> usize {
        self.wip.fetch_sub(missed, Ordering::AcqRel) - missed
    }

    /// 当前登记量；仅用于诊断与测试。
    pub fn load(&self) -> usize {
        self.wip.load(Ordering::Acquire)
    }
}

/// 把并发信号串行化到单一下游的包装 Sink。
///
/// # 设计背景（Why）
/// - `merge` 等多源操作符的内部订阅者可能从不同线程同时发射；
///   协议要求同一时刻至多一个调用方位于下游方法之内。
///
/// # 执行逻辑（How）
/// - 无争用时经快速路径直接发射；有争用时把信号物化为 [`Notification`]
///   入 MPSC 队列，由当选排空者按序重放；
/// - 首个终止信号终结下游，其后到达的错误转入全局钩子。
pub struct SerializedSink<T> {
    downstream: SinkRef<T>,
    queue: MpscLinkedQueue<Notification<T>>,
    gate: DrainGate,
    terminated: AtomicBool,
}

impl<T: Send + 'static> SerializedSink<T> {
    pub fn new(downstream: SinkRef<T>) -> Self {
        Self {
            downstream,
            queue: MpscLinkedQueue::new(),
            gate: DrainGate::new(),
            terminated: AtomicBool::new(false),
        }
    }

    /// 下游引用；供协调器直接转发 `on_subscribe`。
    pub fn downstream(&self) -> &SinkRef<T> {
        &self.downstream
    }

    fn emit(&self, signal: Notification<T>) {
        if self.terminated.load(Ordering::Acquire) {
            if let Notification::Error(err) = signal {
                hook::on_error(err);
            }
            return;
        }
        if self.gate.try_fast_path() {
            self.deliver(signal);
            if self.gate.leave(1) == 0 {
                return;
            }
        } else {
            self.queue.offer(signal);
            if !self.gate.enter() {
                return;
            }
        }
        self.drain();
    }

    fn drain(&self) {
        let mut missed = 1;
        loop {
            while let Some(signal) = self.queue.poll() {
                self.deliver(signal);
            }
            missed = self.gate.leave(missed);
            if missed == 0 {
                return;
            }
        }
    }

    fn deliver(&self, signal: Notification<T>) {
        match signal {
            Notification::Next(value) => {
                if !self.terminated.load(Ordering::Acquire) {
                    self.downstream.on_next(value);
                }
            }
            Notification::Error(err) => {
                if self.terminated.swap(true, Ordering::AcqRel) {
                    hook::on_error(err);
                } else {
                    self.queue.clear();
                    self.downstream.on_error(err);
                }
            }
            Notification::Complete => {
                if !self.terminated.swap(true, Ordering::AcqRel) {
                    self.downstream.on_complete();
                }
            }
        }
    }
}

impl<T: Send + 'static> Sink<T> for SerializedSink<T> {
    fn on_subscribe(&self, handle: HandleRef) {
        self.downstream.on_subscribe(handle);
    }

    fn on_next(&self, value: T) {
        self.emit(Notification::Next(value));
    }

    fn on_error(&self, error: RillError) {
        self.emit(Notification::Error(error));
    }

    fn on_complete(&self) {
        self.emit(Notification::Complete);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    /// 进入下游时断言互斥，任何并发重入都会立刻暴露。
    struct ReentrancyProbe {
        inside: AtomicBool,
        count: AtomicUsize,
        completed: AtomicBool,
    }

    impl ReentrancyProbe {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inside: AtomicBool::new(false),
                count: AtomicUsize::new(0),
                completed: AtomicBool::new(false),
            })
        }
    }

    impl Sink<u64> for ReentrancyProbe {
        fn on_subscribe(&self, _handle: HandleRef) {}

        fn on_next(&self, _value: u64) {
            assert!(
                !self.inside.swap(true, Ordering::AcqRel),
                "串行化保证被破坏：多个线程同时位于下游之内"
            );
            self.count.fetch_add(1, Ordering::AcqRel);
            thread::sleep(Duration::from_micros(10));
            self.inside.store(false, Ordering::Release);
        }

        fn on_error(&self, _error: RillError) {}

        fn on_complete(&self) {
            assert!(
                !self.inside.load(Ordering::Acquire),
                "终止信号不得与 on_next 交错"
            );
            self.completed.store(true, Ordering::Release);
        }
    }

    /// 门闩语义：快速路径当选、争用登记与 missed 扣减。
    #[test]
    fn gate_elects_single_drainer() {
        let gate = DrainGate::new();
        assert!(gate.try_fast_path(), "空闲时快速路径必须当选");
        assert!(!gate.try_fast_path(), "已有排空者时快速路径必须失败");
        assert!(!gate.enter(), "排空者在场时 enter 只登记不当选");
        assert_eq!(gate.leave(1), 1, "仍有一份登记未消化");
        assert_eq!(gate.leave(1), 0, "消化完毕后归零");
        assert!(gate.try_fast_path(), "归零后可再次当选");
    }

    /// 多线程并发发射经包装后必须串行到达下游，计数不丢失。
    #[test]
    fn serialized_sink_delivers_serially() {
        const THREADS: u64 = 4;
        const PER_THREAD: u64 = 200;
        let probe = ReentrancyProbe::new();
        let serialized = Arc::new(SerializedSink::new(probe.clone() as SinkRef<u64>));

        let mut handles = Vec::new();
        for t in 0..THREADS {
            let s = Arc::clone(&serialized);
            handles.push(thread::spawn(move || {
                for i in 0..PER_THREAD {
                    s.on_next(t * PER_THREAD + i);
                }
            }));
        }
        for h in handles {
            h.join().expect("发射线程必须平稳退出");
        }
        serialized.on_complete();

        assert_eq!(probe.count.load(Ordering::Acquire), (THREADS * PER_THREAD) as usize);
        assert!(probe.completed.load(Ordering::Acquire), "完成信号必须到达");
    }

    /// 第一个终止信号之后的次生错误转入全局钩子，而非下游。
    #[test]
    fn secondary_terminal_goes_to_hook() {
        use crate::hook::{ErrorHandler, set_error_handler};
        use parking_lot::Mutex;

        let _guard = crate::testkit::exclusive_hook_access();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        set_error_handler(Some(ErrorHandler::new(move |err| {
            sink.lock().push(err.code());
        })));

        let probe = ReentrancyProbe::new();
        let serialized = SerializedSink::new(probe.clone() as SinkRef<u64>);
        serialized.on_complete();
        serialized.on_error(RillError::new("test.drain_late", "late"));

        assert!(probe.completed.load(Ordering::Acquire));
        assert!(
            seen.lock().contains(&"test.drain_late"),
            "次生错误必须进入钩子"
        );
        set_error_handler(None);
    }
}
