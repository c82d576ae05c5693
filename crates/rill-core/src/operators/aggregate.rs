//! 聚合族：`all` / `single` / `to_list` / `take_last`。
//!
//! 前三者在上游终止时才产出唯一结果，发射经由延迟标量状态机与下游需求会合；
//! `take_last` 维护一个滑动尾窗，上游完成后按下游需求排空。

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::arbiter::SingleAssignmentArbiter;
use crate::demand::{Demand, UNBOUNDED};
use crate::drain::DrainGate;
use crate::error::{RillError, codes};
use crate::protocol::{Handle, HandleRef, Sink, SinkRef, validate_request};
use crate::scalar::DeferredScalar;
use crate::stream::{Stream, StreamSource};

type Predicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

// ---- all ----

pub(crate) fn all<T: Send + 'static>(upstream: Stream<T>, predicate: Predicate<T>) -> Stream<bool> {
    Stream::new(AllSource {
        upstream,
        predicate,
    })
}

struct AllSource<T> {
    upstream: Stream<T>,
    predicate: Predicate<T>,
}

impl<T: Send + 'static> StreamSource<bool> for AllSource<T> {
    fn subscribe(&self, sink: SinkRef<bool>) {
        let all = Arc::new(AllSink {
            scalar: DeferredScalar::new(Arc::clone(&sink)),
            predicate: Arc::clone(&self.predicate),
            upstream: SingleAssignmentArbiter::new(),
            done: AtomicBool::new(false),
        });
        sink.on_subscribe(Arc::clone(&all) as HandleRef);
        self.upstream.subscribe(all as SinkRef<T>);
    }
}

struct AllSink<T> {
    scalar: DeferredScalar<bool>,
    predicate: Predicate<T>,
    upstream: SingleAssignmentArbiter,
    done: AtomicBool,
}

impl<T: Send + 'static> Sink<T> for AllSink<T> {
    fn on_subscribe(&self, handle: HandleRef) {
        if self.upstream.set(handle) {
            self.upstream.request(UNBOUNDED);
        }
    }

    fn on_next(&self, value: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        if !(self.predicate)(&value) && !self.done.swap(true, Ordering::AcqRel) {
            self.upstream.cancel();
            self.scalar.complete_with(false);
        }
    }

    fn on_error(&self, error: RillError) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.scalar.error(error);
        }
    }

    fn on_complete(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.scalar.complete_with(true);
        }
    }
}

impl<T: Send + 'static> Handle for AllSink<T> {
    fn request(&self, n: u64) {
        self.scalar.request(n);
    }

    fn cancel(&self) {
        self.scalar.cancel();
        self.upstream.cancel();
    }
}

// ---- single ----

pub(crate) fn single<T: Send + 'static>(upstream: Stream<T>) -> Stream<T> {
    Stream::new(SingleSource { upstream })
}

struct SingleSource<T> {
    upstream: Stream<T>,
}

impl<T: Send + 'static> StreamSource<T> for SingleSource<T> {
    fn subscribe(&self, sink: SinkRef<T>) {
        let single = Arc::new(SingleSink {
            scalar: DeferredScalar::new(Arc::clone(&sink)),
            seen: Mutex::new(None),
            upstream: SingleAssignmentArbiter::new(),
            done: AtomicBool::new(false),
        });
        sink.on_subscribe(Arc::clone(&single) as HandleRef);
        self.upstream.subscribe(single as SinkRef<T>);
    }
}

struct SingleSink<T> {
    scalar: DeferredScalar<T>,
    seen: Mutex<Option<T>>,
    upstream: SingleAssignmentArbiter,
    done: AtomicBool,
}

impl<T: Send + 'static> Sink<T> for SingleSink<T> {
    fn on_subscribe(&self, handle: HandleRef) {
        if self.upstream.set(handle) {
            self.upstream.request(UNBOUNDED);
        }
    }

    fn on_next(&self, value: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let mut seen = self.seen.lock();
        if seen.is_some() {
            drop(seen);
            if !self.done.swap(true, Ordering::AcqRel) {
                self.upstream.cancel();
                self.scalar.error(RillError::operator(
                    codes::SEQUENCE_TOO_MANY,
                    "single expects exactly one element",
                ));
            }
        } else {
            *seen = Some(value);
        }
    }

    fn on_error(&self, error: RillError) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.scalar.error(error);
        }
    }

    fn on_complete(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        match self.seen.lock().take() {
            Some(value) => self.scalar.complete_with(value),
            None => self.scalar.error(RillError::operator(
                codes::SEQUENCE_NO_ELEMENT,
                "single on an empty sequence",
            )),
        }
    }
}

impl<T: Send + 'static> Handle for SingleSink<T> {
    fn request(&self, n: u64) {
        self.scalar.request(n);
    }

    fn cancel(&self) {
        self.scalar.cancel();
        self.upstream.cancel();
    }
}

// ---- to_list ----

pub(crate) fn to_list<T: Send + 'static>(upstream: Stream<T>) -> Stream<Vec<T>> {
    Stream::new(ToListSource { upstream })
}

struct ToListSource<T> {
    upstream: Stream<T>,
}

impl<T: Send + 'static> StreamSource<Vec<T>> for ToListSource<T> {
    fn subscribe(&self, sink: SinkRef<Vec<T>>) {
        let collect = Arc::new(ToListSink {
            scalar: DeferredScalar::new(Arc::clone(&sink)),
            buffer: Mutex::new(Some(Vec::new())),
            upstream: SingleAssignmentArbiter::new(),
            done: AtomicBool::new(false),
        });
        sink.on_subscribe(Arc::clone(&collect) as HandleRef);
        self.upstream.subscribe(collect as SinkRef<T>);
    }
}

struct ToListSink<T> {
    scalar: DeferredScalar<Vec<T>>,
    buffer: Mutex<Option<Vec<T>>>,
    upstream: SingleAssignmentArbiter,
    done: AtomicBool,
}

impl<T: Send + 'static> Sink<T> for ToListSink<T> {
    fn on_subscribe(&self, handle: HandleRef) {
        if self.upstream.set(handle) {
            self.upstream.request(UNBOUNDED);
        }
    }

    fn on_next(&self, value: T) {
        if let Some(buffer) = self.buffer.lock().as_mut() {
            buffer.push(value);
        }
    }

    fn on_error(&self, error: RillError) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.buffer.lock().take();
            self.scalar.error(error);
        }
    }

    fn on_complete(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(list) = self.buffer.lock().take() {
            self.scalar.complete_with(list);
        }
    }
}

impl<T: Send + 'static> Handle for ToListSink<T> {
    fn request(&self, n: u64) {
        self.scalar.request(n);
    }

    fn cancel(&self) {
        self.scalar.cancel();
        self.upstream.cancel();
        self.buffer.lock().take();
    }
}

// ---- take_last ----

pub(crate) fn take_last<T: Send + 'static>(upstream: Stream<T>, count: usize) -> Stream<T> {
    Stream::new(TakeLastSource { upstream, count })
}

struct TakeLastSource<T> {
    upstream: Stream<T>,
    count: usize,
}

impl<T: Send + 'static> StreamSource<T> for TakeLastSource<T> {
    fn subscribe(&self, sink: SinkRef<T>) {
        let last = Arc::new(TakeLastSink {
            downstream: Arc::clone(&sink),
            count: self.count,
            window: Mutex::new(VecDeque::new()),
            requested: Demand::new(),
            gate: DrainGate::new(),
            upstream: SingleAssignmentArbiter::new(),
            done: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        });
        sink.on_subscribe(Arc::clone(&last) as HandleRef);
        self.upstream.subscribe(last as SinkRef<T>);
    }
}

struct TakeLastSink<T> {
    downstream: SinkRef<T>,
    count: usize,
    window: Mutex<VecDeque<T>>,
    requested: Demand,
    gate: DrainGate,
    upstream: SingleAssignmentArbiter,
    done: AtomicBool,
    cancelled: AtomicBool,
    terminated: AtomicBool,
}

impl<T: Send + 'static> TakeLastSink<T> {
    fn drain(&self) {
        if !self.gate.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            if self.done.load(Ordering::Acquire) && !self.cancelled.load(Ordering::Acquire) {
                let requested = self.requested.current();
                let mut emitted = 0u64;
                while emitted < requested {
                    if self.cancelled.load(Ordering::Acquire) {
                        break;
                    }
                    match self.window.lock().pop_front() {
                        Some(value) => {
                            self.downstream.on_next(value);
                            emitted += 1;
                        }
                        None => break,
                    }
                }
                if emitted > 0 {
                    self.requested.produced(emitted);
                }
                if self.window.lock().is_empty()
                    && !self.cancelled.load(Ordering::Acquire)
                    && !self.terminated.swap(true, Ordering::AcqRel)
                {
                    self.downstream.on_complete();
                }
            }
            missed = self.gate.leave(missed);
            if missed == 0 {
                return;
            }
        }
    }
}

impl<T: Send + 'static> Sink<T> for TakeLastSink<T> {
    fn on_subscribe(&self, handle: HandleRef) {
        if self.upstream.set(handle) {
            self.upstream.request(UNBOUNDED);
        }
    }

    fn on_next(&self, value: T) {
        if self.count == 0 {
            return;
        }
        let mut window = self.window.lock();
        if window.len() == self.count {
            window.pop_front();
        }
        window.push_back(value);
    }

    fn on_error(&self, error: RillError) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            self.window.lock().clear();
            self.downstream.on_error(error);
        }
    }

    fn on_complete(&self) {
        self.done.store(true, Ordering::Release);
        self.drain();
    }
}

impl<T: Send + 'static> Handle for TakeLastSink<T> {
    fn request(&self, n: u64) {
        if !validate_request(n) {
            return;
        }
        self.requested.add(n);
        self.drain();
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.upstream.cancel();
        self.window.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::TestSink;

    /// 空流的 all 产出 true。
    #[test]
    fn all_on_empty_is_true() {
        let sink = TestSink::unbounded();
        Stream::<i64>::empty().all(|_| false).subscribe(sink.clone());
        sink.assert_values(&[true]);
        sink.assert_completed();
    }

    /// 谓词全真产出 true，遇假短路为 false 并取消上游。
    #[test]
    fn all_evaluates_predicate() {
        let pass = TestSink::unbounded();
        Stream::from_iter(vec![1, 2, 3]).all(|v| *v < 5).subscribe(pass.clone());
        pass.assert_values(&[true]);
        pass.assert_completed();

        let fail = TestSink::unbounded();
        Stream::from_iter(vec![1, 2, 3]).all(|v| *v < 3).subscribe(fail.clone());
        fail.assert_values(&[false]);
        fail.assert_completed();
    }

    /// single：空流报 no_element，多元素报 too_many，单元素产出该值。
    #[test]
    fn single_enforces_cardinality() {
        let empty = TestSink::<i64>::unbounded();
        Stream::<i64>::empty().single().subscribe(empty.clone());
        empty.assert_error_code(codes::SEQUENCE_NO_ELEMENT);

        let many = TestSink::unbounded();
        Stream::from_iter(vec![1, 2]).single().subscribe(many.clone());
        many.assert_error_code(codes::SEQUENCE_TOO_MANY);

        let one = TestSink::unbounded();
        Stream::from_iter(vec![7]).single().subscribe(one.clone());
        one.assert_values(&[7]);
        one.assert_completed();
    }

    /// to_list 聚合全部值；结果发射等待下游需求。
    #[test]
    fn to_list_collects_everything() {
        let sink = TestSink::with_request(0);
        Stream::range(1, 4).to_list().subscribe(sink.clone());
        sink.assert_no_values();
        sink.request(1);
        sink.assert_values(&[vec![1, 2, 3, 4]]);
        sink.assert_completed();
    }

    /// 空流的 take_last 直接完成；非空流保留尾部并按需求排空。
    #[test]
    fn take_last_keeps_tail() {
        let empty = TestSink::<i64>::unbounded();
        Stream::<i64>::empty().take_last(1).subscribe(empty.clone());
        empty.assert_no_values();
        empty.assert_completed();

        let sink = TestSink::with_request(1);
        Stream::range(1, 6).take_last(3).subscribe(sink.clone());
        sink.assert_values(&[4]);
        sink.request(10);
        sink.assert_values(&[4, 5, 6]);
        sink.assert_completed();
    }
}
