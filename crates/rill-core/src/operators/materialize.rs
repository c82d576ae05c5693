//! 信号具象化与还原：`materialize` / `dematerialize`。
//!
//! 具象化把终止信号也变成一个值，因此终止通知要占用一个下游需求；
//! 该“最后一发”经由小型挂起槽与需求会合。还原方向上，终止通知
//! 之后的信号属于畸形序列，上报全局钩子。

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::arbiter::SingleAssignmentArbiter;
use crate::demand::Demand;
use crate::error::{RillError, codes};
use crate::hook;
use crate::protocol::{Handle, HandleRef, Notification, Sink, SinkRef, validate_request};
use crate::stream::{Stream, StreamSource};

pub(crate) fn materialize<T: Send + 'static>(upstream: Stream<T>) -> Stream<Notification<T>> {
    Stream::new(MaterializeSource { upstream })
}

struct MaterializeSource<T> {
    upstream: Stream<T>,
}

impl<T: Send + 'static> StreamSource<Notification<T>> for MaterializeSource<T> {
    fn subscribe(&self, sink: SinkRef<Notification<T>>) {
        let sink_m = Arc::new(MaterializeSink {
            downstream: Arc::clone(&sink),
            upstream: SingleAssignmentArbiter::new(),
            requested: Demand::new(),
            pending: Mutex::new(None),
            terminated: AtomicBool::new(false),
        });
        sink.on_subscribe(Arc::clone(&sink_m) as HandleRef);
        self.upstream.subscribe(sink_m as SinkRef<T>);
    }
}

struct MaterializeSink<T> {
    downstream: SinkRef<Notification<T>>,
    upstream: SingleAssignmentArbiter,
    requested: Demand,
    /// 待发射的终止通知；等待下游需求。
    pending: Mutex<Option<Notification<T>>>,
    terminated: AtomicBool,
}

impl<T: Send + 'static> MaterializeSink<T> {
    fn try_emit_pending(&self) {
        let notification = {
            let mut pending = self.pending.lock();
            if pending.is_some() && self.requested.current() > 0 {
                pending.take()
            } else {
                None
            }
        };
        if let Some(notification) = notification {
            self.requested.produced(1);
            if !self.terminated.swap(true, Ordering::AcqRel) {
                self.downstream.on_next(notification);
                self.downstream.on_complete();
            }
        }
    }
}

impl<T: Send + 'static> Sink<T> for MaterializeSink<T> {
    fn on_subscribe(&self, handle: HandleRef) {
        self.upstream.set(handle);
    }

    fn on_next(&self, value: T) {
        if self.terminated.load(Ordering::Acquire) {
            return;
        }
        self.requested.produced(1);
        self.downstream.on_next(Notification::Next(value));
    }

    fn on_error(&self, error: RillError) {
        *self.pending.lock() = Some(Notification::Error(error));
        self.try_emit_pending();
    }

    fn on_complete(&self) {
        *self.pending.lock() = Some(Notification::Complete);
        self.try_emit_pending();
    }
}

impl<T: Send + 'static> Handle for MaterializeSink<T> {
    fn request(&self, n: u64) {
        if !validate_request(n) {
            return;
        }
        self.requested.add(n);
        self.upstream.request(n);
        self.try_emit_pending();
    }

    fn cancel(&self) {
        self.terminated.store(true, Ordering::Release);
        self.upstream.cancel();
        self.pending.lock().take();
    }
}

pub(crate) fn dematerialize<T: Send + 'static>(upstream: Stream<Notification<T>>) -> Stream<T> {
    Stream::new(DematerializeSource { upstream })
}

struct DematerializeSource<T> {
    upstream: Stream<Notification<T>>,
}

impl<T: Send + 'static> StreamSource<T> for DematerializeSource<T> {
    fn subscribe(&self, sink: SinkRef<T>) {
        self.upstream.subscribe(Arc::new(DematerializeSink {
            downstream: sink,
            upstream: SingleAssignmentArbiter::new(),
            done: AtomicBool::new(false),
        }));
    }
}

struct DematerializeSink<T> {
    downstream: SinkRef<T>,
    upstream: SingleAssignmentArbiter,
    done: AtomicBool,
}

impl<T: Send + 'static> Sink<Notification<T>> for DematerializeSink<T> {
    fn on_subscribe(&self, handle: HandleRef) {
        if self.upstream.set(Arc::clone(&handle)) {
            self.downstream.on_subscribe(handle);
        }
    }

    fn on_next(&self, notification: Notification<T>) {
        if self.done.load(Ordering::Acquire) {
            if let Notification::Error(error) = notification {
                hook::on_error(error);
            } else {
                hook::on_error(RillError::protocol(
                    codes::SEQUENCE_MALFORMED,
                    "signal after a terminal notification",
                ));
            }
            return;
        }
        match notification {
            Notification::Next(value) => self.downstream.on_next(value),
            Notification::Error(error) => {
                if !self.done.swap(true, Ordering::AcqRel) {
                    self.upstream.cancel();
                    self.downstream.on_error(error);
                }
            }
            Notification::Complete => {
                if !self.done.swap(true, Ordering::AcqRel) {
                    self.upstream.cancel();
                    self.downstream.on_complete();
                }
            }
        }
    }

    fn on_error(&self, error: RillError) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.downstream.on_error(error);
        }
    }

    fn on_complete(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.downstream.on_complete();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::TestSink;

    /// 具象化把完成变成一个值，再跟一个真正的完成。
    #[test]
    fn materialize_wraps_terminal() {
        let sink = TestSink::unbounded();
        Stream::range(1, 2).materialize().subscribe(sink.clone());
        sink.assert_values(&[
            Notification::Next(1),
            Notification::Next(2),
            Notification::Complete,
        ]);
        sink.assert_completed();
    }

    /// 终止通知要等待下游需求。
    #[test]
    fn terminal_notification_waits_for_demand() {
        let sink = TestSink::with_request(1);
        Stream::from_iter(vec![5]).materialize().subscribe(sink.clone());
        sink.assert_values(&[Notification::Next(5)]);
        sink.assert_not_terminated();
        sink.request(1);
        sink.assert_values(&[Notification::Next(5), Notification::Complete]);
        sink.assert_completed();
    }

    /// 往返等价：materialize 后 dematerialize 还原原序列。
    #[test]
    fn round_trip_is_identity() {
        let sink = TestSink::unbounded();
        Stream::range(1, 5)
            .materialize()
            .dematerialize()
            .subscribe(sink.clone());
        sink.assert_values(&[1, 2, 3, 4, 5]);
        sink.assert_completed();
        sink.assert_protocol_clean();
    }

    /// 错误同样经得起往返。
    #[test]
    fn round_trip_preserves_error() {
        let sink = TestSink::<i32>::unbounded();
        Stream::<i32>::error(RillError::new(codes::UPSTREAM_FAILURE, "boom"))
            .materialize()
            .dematerialize()
            .subscribe(sink.clone());
        sink.assert_error_code(codes::UPSTREAM_FAILURE);
    }
}
