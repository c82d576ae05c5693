//! 订阅仲裁器：在上游句柄更替时维持需求账本与取消语义。
//!
//! ## 设计目标（Why）
//! - `retry`、`on_error_resume_next` 等操作符会在运行期切换上游源；
//!   下游的需求不随切换丢失，未消费的需求必须转移给新句柄。
//!
//! ## 契约说明（What）
//! - [`SingleAssignmentArbiter`]：句柄恰好设置一次；第二次设置取消新句柄并
//!   上报 `protocol.handle_already_set`；设置前积累的需求在设置时一次性转移；
//! - [`SerialArbiter`]：接受一串句柄，每次赋值取消前任；未消费需求
//!   （已请求 − 已产出）转移给新句柄；
//! - [`FullArbiter`]：`(句柄, 信号)` 对的 FIFO，经排空门闩串行消化；
//!   来自过时句柄的信号被丢弃。
//!
//! ## 并发语义
//! - 需求账本无锁（[`Demand`]），句柄槽位的交换为短临界区；
//! - 所有取消路径幂等，可与在途信号并发。

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::demand::Demand;
use crate::drain::DrainGate;
use crate::error::RillError;
use crate::protocol::{Handle, HandleRef, Sink, SinkRef, report_handle_already_set, validate_request};
use crate::queue::MpscLinkedQueue;

/// 恰好一次赋值的仲裁器，支持赋值前的需求暂存。
#[derive(Default)]
pub struct SingleAssignmentArbiter {
    current: Mutex<Option<HandleRef>>,
    pending: Demand,
    set_once: AtomicBool,
    cancelled: AtomicBool,
}

impl SingleAssignmentArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置上游句柄；重复设置按协议违规处理。
    pub fn set(&self, handle: HandleRef) -> bool {
        if self.set_once.swap(true, Ordering::AcqRel) {
            report_handle_already_set(&*handle);
            return false;
        }
        if self.cancelled.load(Ordering::Acquire) {
            handle.cancel();
            return false;
        }
        let pending = {
            let mut slot = self.current.lock();
            *slot = Some(handle.clone());
            self.pending.take()
        };
        if self.cancelled.load(Ordering::Acquire) {
            // 与 cancel 竞争：确保句柄最终被取消。
            if let Some(h) = self.take_current() {
                h.cancel();
            }
            return false;
        }
        if pending > 0 {
            handle.request(pending);
        }
        true
    }

    /// 是否已被取消。
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn take_current(&self) -> Option<HandleRef> {
        self.current.lock().take()
    }
}

impl Handle for SingleAssignmentArbiter {
    fn request(&self, n: u64) {
        if !validate_request(n) {
            return;
        }
        let target = {
            let slot = self.current.lock();
            match &*slot {
                Some(handle) => Some(handle.clone()),
                None => {
                    self.pending.add(n);
                    None
                }
            }
        };
        if let Some(handle) = target {
            handle.request(n);
        }
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            if let Some(handle) = self.take_current() {
                handle.cancel();
            }
        }
    }
}

/// 串行仲裁器：句柄可多次更替，未消费需求随切换转移。
#[derive(Default)]
pub struct SerialArbiter {
    current: Mutex<Option<HandleRef>>,
    requested: Demand,
    cancelled: AtomicBool,
}

impl SerialArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 切换到新句柄；前任被取消，未消费需求转移给新任。
    pub fn set(&self, handle: HandleRef) {
        if self.cancelled.load(Ordering::Acquire) {
            handle.cancel();
            return;
        }
        let (previous, outstanding) = {
            let mut slot = self.current.lock();
            let previous = slot.replace(handle.clone());
            (previous, self.requested.current())
        };
        if let Some(previous) = previous {
            previous.cancel();
        }
        if self.cancelled.load(Ordering::Acquire) {
            if let Some(h) = self.current.lock().take() {
                h.cancel();
            }
            return;
        }
        if outstanding > 0 {
            handle.request(outstanding);
        }
    }

    /// 记录已向下游产出的数量，缩减待转移需求。
    pub fn produced(&self, n: u64) {
        self.requested.produced(n);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Handle for SerialArbiter {
    fn request(&self, n: u64) {
        if !validate_request(n) {
            return;
        }
        self.requested.add(n);
        let target = self.current.lock().clone();
        if let Some(handle) = target {
            handle.request(n);
        }
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            if let Some(handle) = self.current.lock().take() {
                handle.cancel();
            }
        }
    }
}

enum FullEvent<T> {
    SetHandle(HandleRef),
    Next(T, HandleRef),
    Error(RillError, HandleRef),
    Complete(HandleRef),
}

/// 全量仲裁器：上下游都可能在争用中切换时，以 FIFO 串行化一切变更。
pub struct FullArbiter<T> {
    downstream: SinkRef<T>,
    queue: MpscLinkedQueue<FullEvent<T>>,
    gate: DrainGate,
    requested: Demand,
    current: Mutex<Option<HandleRef>>,
    cancelled: AtomicBool,
    terminated: AtomicBool,
}

impl<T: Send + 'static> FullArbiter<T> {
    pub fn new(downstream: SinkRef<T>) -> Self {
        Self {
            downstream,
            queue: MpscLinkedQueue::new(),
            gate: DrainGate::new(),
            requested: Demand::new(),
            current: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        }
    }

    /// 登记新的上游句柄；生效顺序由 FIFO 决定。
    pub fn arbitrate_handle(&self, handle: HandleRef) {
        self.enqueue(FullEvent::SetHandle(handle));
    }

    /// 登记来自 `origin` 的一个值；若 `origin` 已过时则在排空时丢弃。
    pub fn arbitrate_next(&self, value: T, origin: HandleRef) {
        self.enqueue(FullEvent::Next(value, origin));
    }

    pub fn arbitrate_error(&self, error: RillError, origin: HandleRef) {
        self.enqueue(FullEvent::Error(error, origin));
    }

    pub fn arbitrate_complete(&self, origin: HandleRef) {
        self.enqueue(FullEvent::Complete(origin));
    }

    fn enqueue(&self, event: FullEvent<T>) {
        if self.cancelled.load(Ordering::Acquire) || self.terminated.load(Ordering::Acquire) {
            return;
        }
        self.queue.offer(event);
        if self.gate.enter() {
            self.drain();
        }
    }

    fn is_current(&self, origin: &HandleRef) -> bool {
        match &*self.current.lock() {
            Some(active) => Arc::ptr_eq(active, origin),
            None => false,
        }
    }

    fn drain(&self) {
        let mut missed = 1;
        loop {
            while let Some(event) = self.queue.poll() {
                if self.cancelled.load(Ordering::Acquire) {
                    self.queue.clear();
                    break;
                }
                match event {
                    FullEvent::SetHandle(handle) => {
                        let previous = self.current.lock().replace(handle.clone());
                        if let Some(previous) = previous {
                            previous.cancel();
                        }
                        let outstanding = self.requested.current();
                        if outstanding > 0 {
                            handle.request(outstanding);
                        }
                    }
                    FullEvent::Next(value, origin) => {
                        if self.is_current(&origin) && !self.terminated.load(Ordering::Acquire) {
                            self.requested.produced(1);
                            self.downstream.on_next(value);
                        }
                    }
                    FullEvent::Error(error, origin) => {
                        if self.is_current(&origin)
                            && !self.terminated.swap(true, Ordering::AcqRel)
                        {
                            self.downstream.on_error(error);
                        }
                    }
                    FullEvent::Complete(origin) => {
                        if self.is_current(&origin)
                            && !self.terminated.swap(true, Ordering::AcqRel)
                        {
                            self.downstream.on_complete();
                        }
                    }
                }
            }
            missed = self.gate.leave(missed);
            if missed == 0 {
                return;
            }
        }
    }
}

impl<T: Send + 'static> Handle for FullArbiter<T> {
    fn request(&self, n: u64) {
        if !validate_request(n) {
            return;
        }
        self.requested.add(n);
        let target = self.current.lock().clone();
        if let Some(handle) = target {
            handle.request(n);
        }
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            if let Some(handle) = self.current.lock().take() {
                handle.cancel();
            }
            // 队列清理由当选排空者完成，维持单消费者纪律。
            if self.gate.enter() {
                self.drain();
            }
        }
    }
}
