//! 顺序接续：流的流上的 `concat`。
//!
//! 外层预取 `prefetch` 条内层流缓存在有界队列中，同一时刻只订阅一条；
//! 内层完成后向外层补一个需求并接续下一条。内层句柄经串行仲裁器切换，
//! 未消费的下游需求随切换转移。外层错误立即终止。

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::arbiter::{SerialArbiter, SingleAssignmentArbiter};
use crate::drain::{DrainGate, SerializedSink};
use crate::error::RillError;
use crate::protocol::{Handle, HandleRef, Sink, SinkRef, validate_request};
use crate::queue::SpscArrayQueue;
use crate::stream::{Stream, StreamSource};

pub(crate) fn concat<T: Send + 'static>(
    upstream: Stream<Stream<T>>,
    prefetch: usize,
) -> Stream<T> {
    Stream::new(ConcatSource {
        upstream,
        prefetch: prefetch.max(1),
    })
}

struct ConcatSource<T> {
    upstream: Stream<Stream<T>>,
    prefetch: usize,
}

impl<T: Send + 'static> StreamSource<T> for ConcatSource<T> {
    fn subscribe(&self, sink: SinkRef<T>) {
        let serialized = Arc::new(SerializedSink::new(sink));
        let concat = Arc::new_cyclic(|this: &Weak<ConcatSink<T>>| ConcatSink {
            downstream: serialized,
            queue: SpscArrayQueue::new(self.prefetch),
            gate: DrainGate::new(),
            inner: SerialArbiter::new(),
            upstream: SingleAssignmentArbiter::new(),
            active: AtomicBool::new(false),
            done: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            error: Mutex::new(None),
            prefetch: self.prefetch,
            this: this.clone(),
        });
        concat
            .downstream
            .downstream()
            .on_subscribe(Arc::clone(&concat) as HandleRef);
        self.upstream.subscribe(concat as SinkRef<Stream<T>>);
    }
}

struct ConcatSink<T> {
    downstream: Arc<SerializedSink<T>>,
    queue: SpscArrayQueue<Stream<T>>,
    gate: DrainGate,
    inner: SerialArbiter,
    upstream: SingleAssignmentArbiter,
    active: AtomicBool,
    done: AtomicBool,
    cancelled: AtomicBool,
    terminated: AtomicBool,
    error: Mutex<Option<RillError>>,
    prefetch: usize,
    this: Weak<Self>,
}

impl<T: Send + 'static> ConcatSink<T> {
    /// 接续协调：同一时刻至多一个活跃内层。
    fn advance(&self) {
        if !self.gate.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                self.queue.clear();
            } else if let Some(error) = self.error.lock().take() {
                self.queue.clear();
                self.inner.cancel();
                if !self.terminated.swap(true, Ordering::AcqRel) {
                    self.downstream.on_error(error);
                }
            } else if !self.active.load(Ordering::Acquire) {
                match self.queue.poll() {
                    Some(next) => {
                        self.active.store(true, Ordering::Release);
                        let inner = Arc::new(ConcatInnerSink {
                            parent: self.this.clone(),
                        });
                        next.subscribe(inner as SinkRef<T>);
                    }
                    None => {
                        if self.done.load(Ordering::Acquire)
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

    fn inner_complete(&self) {
        self.active.store(false, Ordering::Release);
        // 消费掉一条内层流，向外层补一个需求。
        self.upstream.request(1);
        self.advance();
    }
}

impl<T: Send + 'static> Sink<Stream<T>> for ConcatSink<T> {
    fn on_subscribe(&self, handle: HandleRef) {
        if self.upstream.set(handle) {
            self.upstream.request(self.prefetch as u64);
        }
    }

    fn on_next(&self, stream: Stream<T>) {
        if self.done.load(Ordering::Acquire) || self.cancelled.load(Ordering::Acquire) {
            return;
        }
        if !self.queue.offer(stream) {
            self.upstream.cancel();
            *self.error.lock() = Some(RillError::missing_backpressure(
                "concat prefetch overflow",
            ));
        }
        self.advance();
    }

    fn on_error(&self, error: RillError) {
        if self.done.swap(true, Ordering::AcqRel) {
            crate::hook::on_error(error);
            return;
        }
        *self.error.lock() = Some(error);
        self.advance();
    }

    fn on_complete(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.advance();
        }
    }
}

impl<T: Send + 'static> Handle for ConcatSink<T> {
    fn request(&self, n: u64) {
        if !validate_request(n) {
            return;
        }
        self.inner.request(n);
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.upstream.cancel();
            self.inner.cancel();
            self.advance();
        }
    }
}

struct ConcatInnerSink<T> {
    parent: Weak<ConcatSink<T>>,
}

impl<T: Send + 'static> Sink<T> for ConcatInnerSink<T> {
    fn on_subscribe(&self, handle: HandleRef) {
        if let Some(parent) = self.parent.upgrade() {
            parent.inner.set(handle);
        }
    }

    fn on_next(&self, value: T) {
        if let Some(parent) = self.parent.upgrade() {
            parent.inner.produced(1);
            parent.downstream.on_next(value);
        }
    }

    fn on_error(&self, error: RillError) {
        if let Some(parent) = self.parent.upgrade() {
            parent.upstream.cancel();
            if !parent.terminated.swap(true, Ordering::AcqRel) {
                parent.downstream.on_error(error);
            }
        }
    }

    fn on_complete(&self) {
        if let Some(parent) = self.parent.upgrade() {
            parent.inner_complete();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::TestSink;

    /// 内层流严格按顺序接续，值不交错。
    #[test]
    fn concatenates_in_order() {
        let sink = TestSink::unbounded();
        Stream::from_iter(vec![
            Stream::range(1, 3),
            Stream::range(10, 2),
            Stream::range(100, 1),
        ])
        .concat()
        .subscribe(sink.clone());
        sink.assert_values(&[1, 2, 3, 10, 11, 100]);
        sink.assert_completed();
        sink.assert_protocol_clean();
    }

    /// 下游需求跨内层边界转移。
    #[test]
    fn demand_carries_across_inners() {
        let sink = TestSink::with_request(4);
        Stream::from_iter(vec![Stream::range(1, 2), Stream::range(10, 3)])
            .concat()
            .subscribe(sink.clone());
        sink.assert_values(&[1, 2, 10, 11]);
        sink.request(10);
        sink.assert_values(&[1, 2, 10, 11, 12]);
        sink.assert_completed();
    }

    /// 内层错误立即终止整体。
    #[test]
    fn inner_error_terminates() {
        let sink = TestSink::unbounded();
        Stream::from_iter(vec![
            Stream::range(1, 2),
            Stream::error(RillError::new(crate::error::codes::UPSTREAM_FAILURE, "boom")),
            Stream::range(10, 2),
        ])
        .concat()
        .subscribe(sink.clone());
        sink.assert_values(&[1, 2]);
        sink.assert_error_code(crate::error::codes::UPSTREAM_FAILURE);
    }

    /// 空的外层流直接完成。
    #[test]
    fn empty_outer_completes() {
        let sink = TestSink::<i64>::unbounded();
        Stream::<Stream<i64>>::from_iter(Vec::<Stream<i64>>::new())
            .concat()
            .subscribe(sink.clone());
        sink.assert_no_values();
        sink.assert_completed();
    }
}
