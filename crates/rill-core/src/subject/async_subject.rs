//! 末值主体：只在完成时发射最后一个值。
//!
//! ## 契约说明（What）
//! - 运行期间只记录最新值，不向任何订阅者转发；
//! - `on_complete` 时若存在末值，按各订阅者的需求经延迟标量状态机发射
//!   “末值 + 完成”；不存在则直接完成；
//! - `on_error` 丢弃末值并向全体订阅者传播错误；终止对晚到订阅者重放。

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use crate::error::RillError;
use crate::hook;
use crate::protocol::{Handle, HandleRef, SinkRef};
use crate::scalar::DeferredScalar;
use crate::stream::{Stream, StreamSource};

struct Slot<T> {
    scalar: DeferredScalar<T>,
    subject: Weak<AsyncSubject<T>>,
}

impl<T: Clone + Send + 'static> Handle for Slot<T> {
    fn request(&self, n: u64) {
        self.scalar.request(n);
    }

    fn cancel(&self) {
        self.scalar.cancel();
        if let Some(subject) = self.subject.upgrade() {
            subject.remove(self);
        }
    }
}

enum State<T> {
    Live(Option<T>),
    Completed(Option<T>),
    Failed(RillError),
}

pub struct AsyncSubject<T> {
    state: Mutex<State<T>>,
    slots: ArcSwap<Vec<Arc<Slot<T>>>>,
    this: Weak<Self>,
}

impl<T: Clone + Send + 'static> AsyncSubject<T> {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            state: Mutex::new(State::Live(None)),
            slots: ArcSwap::from_pointee(Vec::new()),
            this: this.clone(),
        })
    }

    pub fn stream(&self) -> Stream<T> {
        let this = self.this.upgrade().expect("主体存活期内 Weak 必然可升级");
        Stream::from_source(this)
    }

    pub fn on_next(&self, value: T) {
        let mut state = self.state.lock();
        if let State::Live(latest) = &mut *state {
            *latest = Some(value);
        }
    }

    pub fn on_error(&self, error: RillError) {
        let slots = {
            let mut state = self.state.lock();
            if !matches!(*state, State::Live(_)) {
                drop(state);
                hook::on_error(error);
                return;
            }
            *state = State::Failed(error.clone());
            self.slots.swap(Arc::new(Vec::new()))
        };
        for slot in slots.iter() {
            slot.scalar.error(error.clone());
        }
    }

    pub fn on_complete(&self) {
        let (slots, latest) = {
            let mut state = self.state.lock();
            let latest = match &mut *state {
                State::Live(latest) => latest.take(),
                _ => return,
            };
            *state = State::Completed(latest.clone());
            (self.slots.swap(Arc::new(Vec::new())), latest)
        };
        for slot in slots.iter() {
            match latest.clone() {
                Some(value) => slot.scalar.complete_with(value),
                None => slot.scalar.complete_empty(),
            }
        }
    }

    fn remove(&self, target: &Slot<T>) {
        let _guard = self.state.lock();
        let current = self.slots.load_full();
        let next: Vec<Arc<Slot<T>>> = current
            .iter()
            .filter(|slot| !std::ptr::eq(Arc::as_ref(slot), target))
            .cloned()
            .collect();
        self.slots.store(Arc::new(next));
    }
}

impl<T: Clone + Send + 'static> StreamSource<T> for AsyncSubject<T> {
    fn subscribe(&self, sink: SinkRef<T>) {
        let slot = Arc::new(Slot {
            scalar: DeferredScalar::new(Arc::clone(&sink)),
            subject: self.this.clone(),
        });
        sink.on_subscribe(Arc::clone(&slot) as HandleRef);

        let replay = {
            let mut state = self.state.lock();
            match &mut *state {
                State::Live(_) => {
                    let current = self.slots.load_full();
                    let mut next = Vec::with_capacity(current.len() + 1);
                    next.extend(current.iter().cloned());
                    next.push(Arc::clone(&slot));
                    self.slots.store(Arc::new(next));
                    None
                }
                State::Completed(latest) => Some(Ok(latest.clone())),
                State::Failed(error) => Some(Err(error.clone())),
            }
        };
        match replay {
            None => {}
            Some(Ok(Some(value))) => slot.scalar.complete_with(value),
            Some(Ok(None)) => slot.scalar.complete_empty(),
            Some(Err(error)) => slot.scalar.error(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;
    use crate::testkit::TestSink;

    /// 只有最后一个值在完成时发射。
    #[test]
    fn emits_last_value_on_complete() {
        let subject = AsyncSubject::new();
        let sink = TestSink::unbounded();
        subject.stream().subscribe(sink.clone());
        subject.on_next(1);
        subject.on_next(2);
        subject.on_next(3);
        sink.assert_no_values();
        subject.on_complete();
        sink.assert_values(&[3]);
        sink.assert_completed();
    }

    /// 无值完成直接完成；晚到订阅者同样重放。
    #[test]
    fn empty_completion_and_late_replay() {
        let subject = AsyncSubject::<i32>::new();
        subject.on_complete();
        let late = TestSink::unbounded();
        subject.stream().subscribe(late.clone());
        late.assert_no_values();
        late.assert_completed();
    }

    /// 末值发射尊重需求：请求到达才发射。
    #[test]
    fn last_value_waits_for_demand() {
        let subject = AsyncSubject::new();
        let sink = TestSink::with_request(0);
        subject.stream().subscribe(sink.clone());
        subject.on_next(9);
        subject.on_complete();
        sink.assert_no_values();
        sink.request(1);
        sink.assert_values(&[9]);
        sink.assert_completed();
    }

    /// 错误丢弃末值并传播给所有订阅者与晚到者。
    #[test]
    fn error_discards_latest() {
        let subject = AsyncSubject::new();
        let sink = TestSink::unbounded();
        subject.stream().subscribe(sink.clone());
        subject.on_next(5);
        subject.on_error(RillError::new(codes::UPSTREAM_FAILURE, "boom"));
        sink.assert_no_values();
        sink.assert_error_code(codes::UPSTREAM_FAILURE);

        let late = TestSink::unbounded();
        subject.stream().subscribe(late.clone());
        late.assert_error_code(codes::UPSTREAM_FAILURE);
    }
}
