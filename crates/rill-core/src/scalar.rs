//! 延迟标量发射：单值结果与下游需求的会合点。
//!
//! ## 设计目标（Why）
//! - `all`、`single`、`to_list` 等聚合操作符在上游终止时才产出唯一结果，
//!   而下游可能尚未 `request`；值与需求谁先到达都必须正确发射恰好一次。
//!
//! ## 契约说明（What）
//! - 状态机四态：空 → 已请求 / 已有值 → 已终止；值与请求的任一方后到即触发发射；
//! - [`DeferredScalar::error`] 与 [`DeferredScalar::complete_empty`] 为终止信号，
//!   不需要需求即可投递；
//! - 取消后一切发射静默丢弃。

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::error::RillError;
use crate::protocol::{SinkRef, validate_request};

const EMPTY: u8 = 0;
const REQUESTED: u8 = 1;
const HAS_VALUE: u8 = 2;
const TERMINATED: u8 = 3;

/// 单值发射状态机。
pub struct DeferredScalar<T> {
    state: AtomicU8,
    value: Mutex<Option<T>>,
    downstream: SinkRef<T>,
    cancelled: AtomicBool,
}

impl<T: Send + 'static> DeferredScalar<T> {
    pub fn new(downstream: SinkRef<T>) -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            value: Mutex::new(None),
            downstream,
            cancelled: AtomicBool::new(false),
        }
    }

    /// 下游需求到达；若值已就绪则立即发射。
    pub fn request(&self, n: u64) {
        if !validate_request(n) {
            return;
        }
        loop {
            match self.state.load(Ordering::Acquire) {
                EMPTY => {
                    if self
                        .state
                        .compare_exchange(EMPTY, REQUESTED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    }
                }
                HAS_VALUE => {
                    if self
                        .state
                        .compare_exchange(HAS_VALUE, TERMINATED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.emit_stored();
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    /// 上游以单值完成；若需求已就绪则立即发射。
    pub fn complete_with(&self, value: T) {
        *self.value.lock() = Some(value);
        loop {
            match self.state.load(Ordering::Acquire) {
                EMPTY => {
                    if self
                        .state
                        .compare_exchange(EMPTY, HAS_VALUE, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    }
                }
                REQUESTED => {
                    if self
                        .state
                        .compare_exchange(REQUESTED, TERMINATED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.emit_stored();
                        return;
                    }
                }
                _ => {
                    self.value.lock().take();
                    return;
                }
            }
        }
    }

    /// 无值完成；终止信号不需要需求。
    pub fn complete_empty(&self) {
        if self.state.swap(TERMINATED, Ordering::AcqRel) != TERMINATED
            && !self.cancelled.load(Ordering::Acquire)
        {
            self.downstream.on_complete();
        }
    }

    /// 错误终止；终止信号不需要需求。
    pub fn error(&self, error: RillError) {
        if self.state.swap(TERMINATED, Ordering::AcqRel) != TERMINATED
            && !self.cancelled.load(Ordering::Acquire)
        {
            self.value.lock().take();
            self.downstream.on_error(error);
        }
    }

    /// 下游取消；此后一切发射静默丢弃。
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.state.store(TERMINATED, Ordering::Release);
        self.value.lock().take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn emit_stored(&self) {
        let value = self.value.lock().take();
        if let Some(value) = value {
            if !self.cancelled.load(Ordering::Acquire) {
                self.downstream.on_next(value);
                self.downstream.on_complete();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{HandleRef, Sink};
    use std::sync::Arc;

    #[derive(Default)]
    struct Probe {
        values: Mutex<Vec<u32>>,
        completed: AtomicBool,
        errored: AtomicBool,
    }

    impl Sink<u32> for Probe {
        fn on_subscribe(&self, _handle: HandleRef) {}
        fn on_next(&self, value: u32) {
            self.values.lock().push(value);
        }
        fn on_error(&self, _error: RillError) {
            self.errored.store(true, Ordering::Release);
        }
        fn on_complete(&self) {
            self.completed.store(true, Ordering::Release);
        }
    }

    /// 先请求后出值：值到达即发射。
    #[test]
    fn request_then_value_emits() {
        let probe = Arc::new(Probe::default());
        let scalar = DeferredScalar::new(probe.clone() as SinkRef<u32>);
        scalar.request(1);
        scalar.complete_with(42);
        assert_eq!(probe.values.lock().clone(), vec![42]);
        assert!(probe.completed.load(Ordering::Acquire));
    }

    /// 先出值后请求：请求到达即发射，且只发射一次。
    #[test]
    fn value_then_request_emits_once() {
        let probe = Arc::new(Probe::default());
        let scalar = DeferredScalar::new(probe.clone() as SinkRef<u32>);
        scalar.complete_with(7);
        assert!(probe.values.lock().is_empty(), "无需求时不得发射");
        scalar.request(1);
        scalar.request(1);
        assert_eq!(probe.values.lock().clone(), vec![7], "重复请求不得重复发射");
    }

    /// 取消后的值与请求都静默丢弃。
    #[test]
    fn cancel_suppresses_emission() {
        let probe = Arc::new(Probe::default());
        let scalar = DeferredScalar::new(probe.clone() as SinkRef<u32>);
        scalar.cancel();
        scalar.complete_with(1);
        scalar.request(1);
        assert!(probe.values.lock().is_empty());
        assert!(!probe.completed.load(Ordering::Acquire));
    }

    /// 空完成与错误不需要需求即可终止。
    #[test]
    fn terminal_without_demand() {
        let probe = Arc::new(Probe::default());
        let scalar = DeferredScalar::new(probe.clone() as SinkRef<u32>);
        scalar.complete_empty();
        assert!(probe.completed.load(Ordering::Acquire), "空完成直接投递");

        let probe2 = Arc::new(Probe::default());
        let scalar2 = DeferredScalar::new(probe2.clone() as SinkRef<u32>);
        scalar2.error(RillError::new("upstream.failure", "boom"));
        assert!(probe2.errored.load(Ordering::Acquire), "错误直接投递");
    }
}
