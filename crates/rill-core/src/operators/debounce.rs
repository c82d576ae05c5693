//! 去抖：`debounce(duration)` 与 `debounce(selector)`。
//!
//! 每个值带上单调递增的序号挂起，并取消上一个计时（或内层订阅）；
//! 计时到点时仅当序号仍是最新才发射。上游完成会冲刷挂起值后终止，
//! 上游错误丢弃挂起值立即传播。发射瞬间无下游需求是 `backpressure.missing`。

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::arbiter::SingleAssignmentArbiter;
use crate::demand::{Demand, UNBOUNDED};
use crate::disposable::SerialDisposable;
use crate::error::RillError;
use crate::protocol::{Disposable, Handle, HandleRef, Sink, SinkRef, validate_request};
use crate::scheduler::{Scheduler, SchedulerRef, Worker};
use crate::stream::{Stream, StreamSource};

pub(crate) fn debounce_timed<T: Send + 'static>(
    upstream: Stream<T>,
    duration: Duration,
    scheduler: SchedulerRef,
) -> Stream<T> {
    Stream::new(DebounceTimedSource {
        upstream,
        duration,
        scheduler,
    })
}

struct DebounceTimedSource<T> {
    upstream: Stream<T>,
    duration: Duration,
    scheduler: SchedulerRef,
}

impl<T: Send + 'static> StreamSource<T> for DebounceTimedSource<T> {
    fn subscribe(&self, sink: SinkRef<T>) {
        let debounce = Arc::new_cyclic(|this: &Weak<DebounceTimedSink<T>>| DebounceTimedSink {
            downstream: Arc::clone(&sink),
            duration: self.duration,
            worker: self.scheduler.create_worker(),
            upstream: SingleAssignmentArbiter::new(),
            requested: Demand::new(),
            index: AtomicU64::new(0),
            pending: Mutex::new(None),
            timer: SerialDisposable::new(),
            done: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            this: this.clone(),
        });
        sink.on_subscribe(Arc::clone(&debounce) as HandleRef);
        self.upstream.subscribe(debounce as SinkRef<T>);
    }
}

struct DebounceTimedSink<T> {
    downstream: SinkRef<T>,
    duration: Duration,
    worker: Arc<dyn Worker>,
    upstream: SingleAssignmentArbiter,
    requested: Demand,
    index: AtomicU64,
    pending: Mutex<Option<(u64, T)>>,
    timer: SerialDisposable,
    done: AtomicBool,
    terminated: AtomicBool,
    this: Weak<Self>,
}

impl<T: Send + 'static> DebounceTimedSink<T> {
    /// 计时到点：序号仍是最新才发射。
    fn emit(&self, index: u64) {
        let value = {
            let mut pending = self.pending.lock();
            match &*pending {
                Some((current, _)) if *current == index => pending.take().map(|(_, v)| v),
                _ => None,
            }
        };
        if let Some(value) = value {
            self.emit_value(value);
        }
    }

    fn emit_value(&self, value: T) {
        if self.terminated.load(Ordering::Acquire) {
            return;
        }
        if self.requested.current() > 0 {
            self.downstream.on_next(value);
            self.requested.produced(1);
        } else if !self.terminated.swap(true, Ordering::AcqRel) {
            self.upstream.cancel();
            self.timer.dispose();
            self.worker.dispose();
            self.downstream.on_error(RillError::missing_backpressure(
                "debounce emission without downstream demand",
            ));
        }
    }
}

impl<T: Send + 'static> Sink<T> for DebounceTimedSink<T> {
    fn on_subscribe(&self, handle: HandleRef) {
        if self.upstream.set(handle) {
            self.upstream.request(UNBOUNDED);
        }
    }

    fn on_next(&self, value: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let index = self.index.fetch_add(1, Ordering::AcqRel) + 1;
        *self.pending.lock() = Some((index, value));
        let parent = self.this.clone();
        self.timer.set(self.worker.schedule_delayed(
            Box::new(move || {
                if let Some(main) = parent.upgrade() {
                    main.emit(index);
                }
            }),
            self.duration,
        ));
    }

    fn on_error(&self, error: RillError) {
        if self.done.swap(true, Ordering::AcqRel) {
            crate::hook::on_error(error);
            return;
        }
        self.pending.lock().take();
        self.timer.dispose();
        self.worker.dispose();
        if !self.terminated.swap(true, Ordering::AcqRel) {
            self.downstream.on_error(error);
        }
    }

    fn on_complete(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        self.timer.dispose();
        // 挂起值在完成前冲刷。
        let flush = self.pending.lock().take().map(|(_, value)| value);
        if let Some(value) = flush {
            self.emit_value(value);
        }
        self.worker.dispose();
        if !self.terminated.swap(true, Ordering::AcqRel) {
            self.downstream.on_complete();
        }
    }
}

impl<T: Send + 'static> Handle for DebounceTimedSink<T> {
    fn request(&self, n: u64) {
        if !validate_request(n) {
            return;
        }
        self.requested.add(n);
    }

    fn cancel(&self) {
        self.terminated.store(true, Ordering::Release);
        self.upstream.cancel();
        self.timer.dispose();
        self.worker.dispose();
        self.pending.lock().take();
    }
}

// ---- 选择器变体 ----

type Selector<T, U> = Arc<dyn Fn(&T) -> Stream<U> + Send + Sync>;

pub(crate) fn debounce_selector<T, U>(
    upstream: Stream<T>,
    selector: Selector<T, U>,
) -> Stream<T>
where
    T: Send + 'static,
    U: Send + 'static,
{
    Stream::new(DebounceSelectorSource { upstream, selector })
}

struct DebounceSelectorSource<T, U> {
    upstream: Stream<T>,
    selector: Selector<T, U>,
}

impl<T, U> StreamSource<T> for DebounceSelectorSource<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    fn subscribe(&self, sink: SinkRef<T>) {
        let debounce =
            Arc::new_cyclic(|this: &Weak<DebounceSelectorSink<T, U>>| DebounceSelectorSink {
                downstream: Arc::clone(&sink),
                selector: Arc::clone(&self.selector),
                upstream: SingleAssignmentArbiter::new(),
                requested: Demand::new(),
                index: AtomicU64::new(0),
                pending: Mutex::new(None),
                inner: SerialDisposable::new(),
                done: AtomicBool::new(false),
                terminated: AtomicBool::new(false),
                this: this.clone(),
            });
        sink.on_subscribe(Arc::clone(&debounce) as HandleRef);
        self.upstream.subscribe(debounce as SinkRef<T>);
    }
}

struct DebounceSelectorSink<T, U> {
    downstream: SinkRef<T>,
    selector: Selector<T, U>,
    upstream: SingleAssignmentArbiter,
    requested: Demand,
    index: AtomicU64,
    pending: Mutex<Option<(u64, T)>>,
    inner: SerialDisposable,
    done: AtomicBool,
    terminated: AtomicBool,
    this: Weak<Self>,
}

impl<T, U> DebounceSelectorSink<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    fn fire(&self, index: u64) {
        let value = {
            let mut pending = self.pending.lock();
            match &*pending {
                Some((current, _)) if *current == index => pending.take().map(|(_, v)| v),
                _ => None,
            }
        };
        if let Some(value) = value {
            if self.terminated.load(Ordering::Acquire) {
                return;
            }
            if self.requested.current() > 0 {
                self.downstream.on_next(value);
                self.requested.produced(1);
            } else if !self.terminated.swap(true, Ordering::AcqRel) {
                self.upstream.cancel();
                self.inner.dispose();
                self.downstream.on_error(RillError::missing_backpressure(
                    "debounce emission without downstream demand",
                ));
            }
        }
    }
}

impl<T, U> Sink<T> for DebounceSelectorSink<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    fn on_subscribe(&self, handle: HandleRef) {
        if self.upstream.set(handle) {
            self.upstream.request(UNBOUNDED);
        }
    }

    fn on_next(&self, value: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let selector_stream = (self.selector)(&value);
        let index = self.index.fetch_add(1, Ordering::AcqRel) + 1;
        *self.pending.lock() = Some((index, value));

        let gate = Arc::new(SelectorGate {
            parent: self.this.clone(),
            index,
            fired: AtomicBool::new(false),
            handle: SingleAssignmentArbiter::new(),
        });
        self.inner
            .set(crate::disposable::FnDisposable::shared({
                let gate = Arc::clone(&gate);
                move || gate.handle.cancel()
            }));
        selector_stream.subscribe(gate as SinkRef<U>);
    }

    fn on_error(&self, error: RillError) {
        if self.done.swap(true, Ordering::AcqRel) {
            crate::hook::on_error(error);
            return;
        }
        self.pending.lock().take();
        self.inner.dispose();
        if !self.terminated.swap(true, Ordering::AcqRel) {
            self.downstream.on_error(error);
        }
    }

    fn on_complete(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.dispose();
        let flush = self.pending.lock().take().map(|(_, value)| value);
        if let Some(value) = flush {
            if !self.terminated.load(Ordering::Acquire) && self.requested.current() > 0 {
                self.downstream.on_next(value);
                self.requested.produced(1);
            }
        }
        if !self.terminated.swap(true, Ordering::AcqRel) {
            self.downstream.on_complete();
        }
    }
}

impl<T, U> Handle for DebounceSelectorSink<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    fn request(&self, n: u64) {
        if !validate_request(n) {
            return;
        }
        self.requested.add(n);
    }

    fn cancel(&self) {
        self.terminated.store(true, Ordering::Release);
        self.upstream.cancel();
        self.inner.dispose();
        self.pending.lock().take();
    }
}

/// 选择器流的首个信号触发发射。
struct SelectorGate<T, U> {
    parent: Weak<DebounceSelectorSink<T, U>>,
    index: u64,
    fired: AtomicBool,
    handle: SingleAssignmentArbiter,
}

impl<T, U> Sink<U> for SelectorGate<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    fn on_subscribe(&self, handle: HandleRef) {
        if self.handle.set(handle) {
            self.handle.request(1);
        }
    }

    fn on_next(&self, _value: U) {
        if !self.fired.swap(true, Ordering::AcqRel) {
            self.handle.cancel();
            if let Some(parent) = self.parent.upgrade() {
                parent.fire(self.index);
            }
        }
    }

    fn on_error(&self, error: RillError) {
        if !self.fired.swap(true, Ordering::AcqRel) {
            if let Some(parent) = self.parent.upgrade() {
                parent.on_error(error);
            }
        }
    }

    fn on_complete(&self) {
        if !self.fired.swap(true, Ordering::AcqRel) {
            if let Some(parent) = self.parent.upgrade() {
                parent.fire(self.index);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::TestScheduler;
    use crate::subject::PublishSubject;
    use crate::testkit::TestSink;

    /// 静默期满才发射最近值；更快的后继值取代前值。
    #[test]
    fn emits_after_quiet_period() {
        let clock = TestScheduler::new();
        let scheduler: SchedulerRef = Arc::new(clock.clone());
        let source = PublishSubject::new();
        let sink = TestSink::unbounded();
        source
            .stream()
            .debounce(Duration::from_millis(100), scheduler)
            .subscribe(sink.clone());

        source.on_next(1);
        clock.advance_time_by(Duration::from_millis(50));
        source.on_next(2);
        sink.assert_no_values();
        clock.advance_time_by(Duration::from_millis(100));
        sink.assert_values(&[2]);
        source.on_next(3);
        clock.advance_time_by(Duration::from_millis(100));
        sink.assert_values(&[2, 3]);
        source.on_complete();
        sink.assert_completed();
    }

    /// 完成冲刷挂起值；错误丢弃挂起值。
    #[test]
    fn complete_flushes_pending_error_drops_it() {
        let clock = TestScheduler::new();
        let scheduler: SchedulerRef = Arc::new(clock.clone());
        let source = PublishSubject::new();
        let sink = TestSink::unbounded();
        source
            .stream()
            .debounce(Duration::from_millis(100), scheduler)
            .subscribe(sink.clone());
        source.on_next(4);
        source.on_complete();
        sink.assert_values(&[4]);
        sink.assert_completed();

        let clock2 = TestScheduler::new();
        let scheduler2: SchedulerRef = Arc::new(clock2.clone());
        let source2 = PublishSubject::new();
        let err_sink = TestSink::unbounded();
        source2
            .stream()
            .debounce(Duration::from_millis(100), scheduler2)
            .subscribe(err_sink.clone());
        source2.on_next(9);
        source2.on_error(RillError::new(crate::error::codes::UPSTREAM_FAILURE, "boom"));
        err_sink.assert_no_values();
        err_sink.assert_error_code(crate::error::codes::UPSTREAM_FAILURE);
    }

    /// 选择器变体：内层流先发射者胜出。
    #[test]
    fn selector_variant_debounces() {
        let source = PublishSubject::new();
        let gates: Arc<Mutex<Vec<Arc<PublishSubject<()>>>>> = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::clone(&gates);
        let sink = TestSink::unbounded();
        source
            .stream()
            .debounce_selector(move |_v: &i32| {
                let gate = PublishSubject::<()>::new();
                registry.lock().push(Arc::clone(&gate));
                gate.stream()
            })
            .subscribe(sink.clone());

        source.on_next(1);
        source.on_next(2);
        // 第一个门闩此刻已过时，触发也不该发射。
        gates.lock()[0].on_next(());
        sink.assert_no_values();
        gates.lock()[1].on_next(());
        sink.assert_values(&[2]);
        source.on_complete();
        sink.assert_completed();
    }
}
