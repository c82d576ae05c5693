//! 实时多播主体。
//!
//! ## 契约说明（What）
//! - 值只发给发射瞬间在场的订阅者；订阅前的历史不补课；
//! - 逐订阅者需求记账：发射瞬间无剩余需求的订阅者以
//!   `backpressure.missing` 终止并移出登记表，其余订阅者不受影响；
//! - 终止信号对晚到订阅者重放。
//!
//! ## 并发语义
//! - 登记表写侧（订阅/取消/终止）持锁做写时复制，发射侧无锁读快照；
//! - 信号端由调用方串行投递。

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::demand::Demand;
use crate::error::RillError;
use crate::hook;
use crate::protocol::{Handle, HandleRef, SinkRef, validate_request};
use crate::stream::{Stream, StreamSource};

struct Slot<T> {
    downstream: SinkRef<T>,
    requested: Demand,
    cancelled: AtomicBool,
    subject: Weak<PublishSubject<T>>,
}

impl<T: Clone + Send + 'static> Slot<T> {
    fn emit(&self, value: T) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        if self.requested.current() > 0 {
            self.downstream.on_next(value);
            self.requested.produced(1);
        } else if !self.cancelled.swap(true, Ordering::AcqRel) {
            if let Some(subject) = self.subject.upgrade() {
                subject.remove_by_ptr(self);
            }
            self.downstream.on_error(RillError::missing_backpressure(
                "publish subject subscriber lacks demand",
            ));
        }
    }
}

impl<T: Clone + Send + 'static> Handle for Slot<T> {
    fn request(&self, n: u64) {
        if !validate_request(n) {
            return;
        }
        self.requested.add(n);
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            if let Some(subject) = self.subject.upgrade() {
                subject.remove_by_ptr(self);
            }
        }
    }
}

enum TerminalState {
    Live,
    Completed,
    Failed(RillError),
}

pub struct PublishSubject<T> {
    slots: ArcSwap<Vec<Arc<Slot<T>>>>,
    write_lock: Mutex<TerminalState>,
    this: Weak<Self>,
}

impl<T: Clone + Send + 'static> PublishSubject<T> {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            slots: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(TerminalState::Live),
            this: this.clone(),
        })
    }

    /// 以流视图暴露本主体。
    pub fn stream(&self) -> Stream<T> {
        let this = self.this.upgrade().expect("主体存活期内 Weak 必然可升级");
        Stream::from_source(this)
    }

    /// 当前在场订阅者数量。
    pub fn subscriber_count(&self) -> usize {
        self.slots.load().len()
    }

    pub fn on_next(&self, value: T) {
        let slots = self.slots.load_full();
        match slots.as_slice() {
            [] => {}
            [only] => only.emit(value),
            many => {
                for slot in many {
                    slot.emit(value.clone());
                }
            }
        }
    }

    pub fn on_error(&self, error: RillError) {
        let slots = {
            let mut terminal = self.write_lock.lock();
            if !matches!(*terminal, TerminalState::Live) {
                drop(terminal);
                hook::on_error(error);
                return;
            }
            *terminal = TerminalState::Failed(error.clone());
            self.slots.swap(Arc::new(Vec::new()))
        };
        for slot in slots.iter() {
            if !slot.cancelled.swap(true, Ordering::AcqRel) {
                slot.downstream.on_error(error.clone());
            }
        }
    }

    pub fn on_complete(&self) {
        let slots = {
            let mut terminal = self.write_lock.lock();
            if !matches!(*terminal, TerminalState::Live) {
                return;
            }
            *terminal = TerminalState::Completed;
            self.slots.swap(Arc::new(Vec::new()))
        };
        for slot in slots.iter() {
            if !slot.cancelled.swap(true, Ordering::AcqRel) {
                slot.downstream.on_complete();
            }
        }
    }

    fn remove_by_ptr(&self, target: &Slot<T>) {
        let _guard = self.write_lock.lock();
        let current = self.slots.load_full();
        let next: Vec<Arc<Slot<T>>> = current
            .iter()
            .filter(|slot| !std::ptr::eq(Arc::as_ref(slot), target))
            .cloned()
            .collect();
        self.slots.store(Arc::new(next));
    }
}

impl<T: Clone + Send + 'static> StreamSource<T> for PublishSubject<T> {
    fn subscribe(&self, sink: SinkRef<T>) {
        let slot = Arc::new(Slot {
            downstream: Arc::clone(&sink),
            requested: Demand::new(),
            cancelled: AtomicBool::new(false),
            subject: self.this.clone(),
        });
        sink.on_subscribe(Arc::clone(&slot) as HandleRef);

        let replay = {
            let mut terminal = self.write_lock.lock();
            match &mut *terminal {
                TerminalState::Live => {
                    let current = self.slots.load_full();
                    let mut next = Vec::with_capacity(current.len() + 1);
                    next.extend(current.iter().cloned());
                    next.push(Arc::clone(&slot));
                    self.slots.store(Arc::new(next));
                    None
                }
                TerminalState::Completed => Some(None),
                TerminalState::Failed(error) => Some(Some(error.clone())),
            }
        };
        if let Some(terminal) = replay {
            slot.cancelled.store(true, Ordering::Release);
            match terminal {
                Some(error) => sink.on_error(error),
                None => sink.on_complete(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;
    use crate::testkit::TestSink;

    /// 订阅时序决定可见值：后订阅者看不到此前的发射。
    #[test]
    fn late_subscriber_sees_only_later_values() {
        let subject = PublishSubject::new();
        let a = TestSink::unbounded();
        subject.stream().subscribe(a.clone());
        subject.on_next(42);

        let b = TestSink::unbounded();
        subject.stream().subscribe(b.clone());
        subject.on_next(4711);
        subject.on_complete();

        a.assert_values(&[42, 4711]);
        a.assert_completed();
        b.assert_values(&[4711]);
        b.assert_completed();
    }

    /// 终止后的订阅者收到终止重放。
    #[test]
    fn terminal_replays_to_late_subscriber() {
        let subject = PublishSubject::<i32>::new();
        subject.on_complete();
        let late = TestSink::unbounded();
        subject.stream().subscribe(late.clone());
        late.assert_completed();

        let failed = PublishSubject::<i32>::new();
        failed.on_error(RillError::new(codes::UPSTREAM_FAILURE, "boom"));
        let late2 = TestSink::unbounded();
        failed.stream().subscribe(late2.clone());
        late2.assert_error_code(codes::UPSTREAM_FAILURE);
    }

    /// 无需求的订阅者以 backpressure.missing 出局，不拖累他人。
    #[test]
    fn missing_demand_terminates_only_that_subscriber() {
        let subject = PublishSubject::new();
        let hungry = TestSink::unbounded();
        let starved = TestSink::with_request(0);
        subject.stream().subscribe(hungry.clone());
        subject.stream().subscribe(starved.clone());

        subject.on_next(1);
        hungry.assert_values(&[1]);
        starved.assert_error_code(codes::BACKPRESSURE_MISSING);
        assert_eq!(subject.subscriber_count(), 1, "出局订阅者必须移出登记表");

        subject.on_next(2);
        subject.on_complete();
        hungry.assert_values(&[1, 2]);
        hungry.assert_completed();
    }

    /// 取消的订阅者从登记表移除，之后的值与终止不再送达。
    #[test]
    fn cancelled_subscriber_stops_receiving() {
        let subject = PublishSubject::new();
        let sink = TestSink::unbounded();
        subject.stream().subscribe(sink.clone());
        subject.on_next(1);
        sink.cancel();
        subject.on_next(2);
        subject.on_complete();
        sink.assert_values(&[1]);
        sink.assert_not_terminated();
        assert_eq!(subject.subscriber_count(), 0);
    }
}
