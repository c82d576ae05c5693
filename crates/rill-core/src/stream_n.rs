//! 非背压风味的流值类型。
//!
//! ## 契约说明（What）
//! - 源按自身节奏发射，下游只能吸收或丢弃；控制句柄仅有 `dispose`；
//! - 终止语义与单次 `on_subscribe` 规则与背压风味完全一致；
//! - 风味间的转换适配器不在本层提供。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::disposable::BooleanDisposable;
use crate::error::RillError;
use crate::protocol::{Disposable, DisposableRef, NoopDisposable, SinkN, SinkNRef};

/// 非背压源契约。
pub trait StreamNSource<T>: Send + Sync {
    fn subscribe(&self, sink: SinkNRef<T>);
}

/// 非背压风味的流；克隆即共享同一源。
pub struct StreamN<T> {
    source: Arc<dyn StreamNSource<T>>,
}

impl<T> Clone for StreamN<T> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
        }
    }
}

impl<T: Send + 'static> StreamN<T> {
    pub fn new(source: impl StreamNSource<T> + 'static) -> Self {
        Self {
            source: Arc::new(source),
        }
    }

    pub fn subscribe(&self, sink: SinkNRef<T>) {
        self.source.subscribe(sink);
    }

    /// 空流：订阅即完成。
    pub fn empty() -> Self {
        Self::new(EmptyNSource)
    }

    /// 订阅即出错的流。
    pub fn error(error: RillError) -> Self {
        Self::new(ErrorNSource { error })
    }

    /// 单值流。
    pub fn just(value: T) -> Self
    where
        T: Clone + Sync,
    {
        Self::from_iter(std::iter::once(value))
    }

    /// 由可重复迭代的集合构造；每次订阅独立迭代、即时推送全部值。
    pub fn from_iter<I>(iterable: I) -> Self
    where
        I: IntoIterator<Item = T> + Clone + Send + Sync + 'static,
        I::IntoIter: Send,
    {
        Self::new(IterNSource { iterable })
    }

    pub fn map<R: Send + 'static>(
        &self,
        f: impl Fn(T) -> R + Send + Sync + 'static,
    ) -> StreamN<R> {
        let upstream = self.clone();
        let f = Arc::new(f);
        StreamN::new(MapNSource { upstream, f })
    }

    pub fn filter(&self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> StreamN<T> {
        let upstream = self.clone();
        let predicate = Arc::new(predicate);
        StreamN::new(FilterNSource {
            upstream,
            predicate,
        })
    }

    /// 取前 `count` 个值后释放上游并完成。
    pub fn take(&self, count: u64) -> StreamN<T> {
        StreamN::new(TakeNSource {
            upstream: self.clone(),
            count,
        })
    }
}

struct EmptyNSource;

impl<T: Send + 'static> StreamNSource<T> for EmptyNSource {
    fn subscribe(&self, sink: SinkNRef<T>) {
        sink.on_subscribe(NoopDisposable::shared());
        sink.on_complete();
    }
}

struct ErrorNSource {
    error: RillError,
}

impl<T: Send + 'static> StreamNSource<T> for ErrorNSource {
    fn subscribe(&self, sink: SinkNRef<T>) {
        sink.on_subscribe(NoopDisposable::shared());
        sink.on_error(self.error.clone());
    }
}

struct IterNSource<I> {
    iterable: I,
}

impl<T, I> StreamNSource<T> for IterNSource<I>
where
    T: Send + 'static,
    I: IntoIterator<Item = T> + Clone + Send + Sync + 'static,
    I::IntoIter: Send,
{
    fn subscribe(&self, sink: SinkNRef<T>) {
        let handle = BooleanDisposable::shared();
        sink.on_subscribe(Arc::clone(&handle) as DisposableRef);
        for value in self.iterable.clone() {
            if handle.is_disposed() {
                return;
            }
            sink.on_next(value);
        }
        if !handle.is_disposed() {
            sink.on_complete();
        }
    }
}

struct MapNSource<T, R> {
    upstream: StreamN<T>,
    f: Arc<dyn Fn(T) -> R + Send + Sync>,
}

impl<T: Send + 'static, R: Send + 'static> StreamNSource<R> for MapNSource<T, R> {
    fn subscribe(&self, sink: SinkNRef<R>) {
        let f = Arc::clone(&self.f);
        self.upstream.subscribe(Arc::new(ForwardN {
            downstream: sink,
            transform: move |value, downstream: &SinkNRef<R>| downstream.on_next(f(value)),
            _marker: std::marker::PhantomData,
        }));
    }
}

struct FilterNSource<T> {
    upstream: StreamN<T>,
    predicate: Arc<dyn Fn(&T) -> bool + Send + Sync>,
}

impl<T: Send + 'static> StreamNSource<T> for FilterNSource<T> {
    fn subscribe(&self, sink: SinkNRef<T>) {
        let predicate = Arc::clone(&self.predicate);
        self.upstream.subscribe(Arc::new(ForwardN {
            downstream: sink,
            transform: move |value, downstream: &SinkNRef<T>| {
                if predicate(&value) {
                    downstream.on_next(value);
                }
            },
            _marker: std::marker::PhantomData,
        }));
    }
}

/// 值变换转发器：终止信号透传，值交由闭包处理。
struct ForwardN<T, R, F> {
    downstream: SinkNRef<R>,
    transform: F,
    _marker: std::marker::PhantomData<fn(T)>,
}

impl<T, R, F> SinkN<T> for ForwardN<T, R, F>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T, &SinkNRef<R>) + Send + Sync,
{
    fn on_subscribe(&self, handle: DisposableRef) {
        self.downstream.on_subscribe(handle);
    }

    fn on_next(&self, value: T) {
        (self.transform)(value, &self.downstream);
    }

    fn on_error(&self, error: RillError) {
        self.downstream.on_error(error);
    }

    fn on_complete(&self) {
        self.downstream.on_complete();
    }
}

struct TakeNSource<T> {
    upstream: StreamN<T>,
    count: u64,
}

impl<T: Send + 'static> StreamNSource<T> for TakeNSource<T> {
    fn subscribe(&self, sink: SinkNRef<T>) {
        self.upstream.subscribe(Arc::new(TakeNSink {
            downstream: sink,
            remaining: AtomicU64::new(self.count),
            upstream: parking_lot::Mutex::new(None),
            done: AtomicBool::new(self.count == 0),
        }));
    }
}

struct TakeNSink<T> {
    downstream: SinkNRef<T>,
    remaining: AtomicU64,
    upstream: parking_lot::Mutex<Option<DisposableRef>>,
    done: AtomicBool,
}

impl<T: Send + 'static> SinkN<T> for TakeNSink<T> {
    fn on_subscribe(&self, handle: DisposableRef) {
        *self.upstream.lock() = Some(Arc::clone(&handle));
        self.downstream.on_subscribe(handle);
        if self.done.load(Ordering::Acquire) {
            // take(0)：订阅即完成并释放上游。
            if let Some(upstream) = self.upstream.lock().take() {
                upstream.dispose();
            }
            self.downstream.on_complete();
        }
    }

    fn on_next(&self, value: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let remaining = self.remaining.fetch_sub(1, Ordering::AcqRel);
        if remaining > 1 {
            self.downstream.on_next(value);
        } else if remaining == 1 {
            self.downstream.on_next(value);
            if !self.done.swap(true, Ordering::AcqRel) {
                if let Some(upstream) = self.upstream.lock().take() {
                    upstream.dispose();
                }
                self.downstream.on_complete();
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
    use crate::testkit::TestSinkN;

    /// 火管式发射：全部值即时抵达。
    #[test]
    fn fire_hose_delivery() {
        let sink = TestSinkN::new();
        StreamN::from_iter(vec![1, 2, 3])
            .map(|v| v * 2)
            .filter(|v| *v != 4)
            .subscribe(sink.clone());
        sink.assert_values(&[2, 6]);
        sink.assert_completed();
    }

    /// take 截断后释放上游并完成。
    #[test]
    fn take_truncates_and_disposes() {
        let sink = TestSinkN::new();
        StreamN::from_iter(0..100).take(3).subscribe(sink.clone());
        sink.assert_values(&[0, 1, 2]);
        sink.assert_completed();
    }

    /// dispose 停止发射。
    #[test]
    fn dispose_stops_emission() {
        struct EagerDisposer;
        impl SinkN<i32> for EagerDisposer {
            fn on_subscribe(&self, handle: DisposableRef) {
                handle.dispose();
            }
            fn on_next(&self, _value: i32) {
                panic!("dispose 之后不得发射");
            }
            fn on_error(&self, _error: RillError) {}
            fn on_complete(&self) {
                panic!("dispose 之后不得完成");
            }
        }
        StreamN::from_iter(vec![1, 2, 3]).subscribe(Arc::new(EagerDisposer));
    }

    /// 错误流订阅即出错。
    #[test]
    fn error_factory_terminates() {
        let sink = TestSinkN::<i32>::new();
        StreamN::<i32>::error(RillError::new(
            crate::error::codes::UPSTREAM_FAILURE,
            "boom",
        ))
        .subscribe(sink.clone());
        sink.assert_error_code(crate::error::codes::UPSTREAM_FAILURE);
    }
}
