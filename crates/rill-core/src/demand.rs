//! 背压需求计数器。
//!
//! ## 设计目标（Why）
//! - 多个生产者可能并发抬升需求（下游 `request` 与排空循环的补偿请求同时发生），
//!   计数器必须允许无锁竞争而不与消费侧的排空互相阻塞。
//!
//! ## 契约说明（What）
//! - 计数单调不减，加法在 [`UNBOUNDED`] 处饱和且“无界”状态具有粘性；
//! - [`Demand::produced`] 在扣减越界时钳制为零并向全局钩子上报
//!   `protocol.produced_overflow`；
//! - 所有方法可在任意线程并发调用。

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{RillError, codes};
use crate::hook;
pub use crate::protocol::UNBOUNDED;

/// 饱和加法：任一侧为 [`UNBOUNDED`] 时结果保持无界。
pub fn add_cap(a: u64, b: u64) -> u64 {
    a.saturating_add(b)
}

/// “已请求 − 已产出”的原子账本。
#[derive(Debug, Default)]
pub struct Demand {
    value: AtomicU64,
}

impl Demand {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加需求，返回追加前的值。
    ///
    /// # 执行逻辑（How）
    /// - 读取当前值；若已是 [`UNBOUNDED`] 直接返回（无界粘性）；
    /// - 否则按饱和加法计算新值并 CAS，失败重试直至成功。
    pub fn add(&self, n: u64) -> u64 {
        let mut current = self.value.load(Ordering::Acquire);
        loop {
            if current == UNBOUNDED {
                return UNBOUNDED;
            }
            let next = add_cap(current, n);
            match self
                .value
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(prev) => return prev,
                Err(observed) => current = observed,
            }
        }
    }

    /// 扣减已产出数量，返回扣减后的剩余需求。
    ///
    /// # 契约说明（What）
    /// - 无界状态下不做账，直接返回 [`UNBOUNDED`]；
    /// - 扣减越界说明上游多发（协议违规）：剩余钳制为零并上报钩子。
    pub fn produced(&self, n: u64) -> u64 {
        let mut current = self.value.load(Ordering::Acquire);
        loop {
            if current == UNBOUNDED {
                return UNBOUNDED;
            }
            let (next, overflow) = match current.checked_sub(n) {
                Some(rest) => (rest, false),
                None => (0, true),
            };
            match self
                .value
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    if overflow {
                        hook::on_error(RillError::protocol(
                            codes::PROTOCOL_PRODUCED_OVERFLOW,
                            "more produced than requested",
                        ));
                    }
                    return next;
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// 取走全部暂存需求并清零；用于赋值时的需求转移。
    pub fn take(&self) -> u64 {
        self.value.swap(0, Ordering::AcqRel)
    }

    /// 读取当前未消费需求。
    pub fn current(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// 是否处于无界状态。
    pub fn is_unbounded(&self) -> bool {
        self.current() == UNBOUNDED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    /// 加法在 MAX 处饱和，且无界状态具有粘性。
    #[test]
    fn add_saturates_and_unbounded_is_sticky() {
        let d = Demand::new();
        d.add(UNBOUNDED - 1);
        d.add(16);
        assert_eq!(d.current(), UNBOUNDED, "饱和加法必须停在无界哨兵");
        d.produced(1_000);
        assert_eq!(d.current(), UNBOUNDED, "无界状态不做产出记账");
    }

    /// 并发抬升需求不得丢失任何一次请求。
    #[test]
    fn concurrent_adds_are_lossless() {
        let d = Arc::new(Demand::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let d = Arc::clone(&d);
            handles.push(thread::spawn(move || {
                for _ in 0..1_000 {
                    d.add(3);
                }
            }));
        }
        for h in handles {
            h.join().expect("需求线程必须平稳退出");
        }
        assert_eq!(d.current(), 4 * 1_000 * 3);
    }

    /// 扣减越界必须钳制为零，不得出现负值回绕。
    #[test]
    fn produced_overflow_clamps_to_zero() {
        let d = Demand::new();
        d.add(2);
        assert_eq!(d.produced(2), 0);
        assert_eq!(d.produced(1), 0, "越界扣减后剩余仍为零");
        assert_eq!(d.current(), 0);
    }
}
