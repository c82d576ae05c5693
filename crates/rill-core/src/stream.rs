//! 背压风味的流值类型与组合子入口。
//!
//! ## 设计目标（Why）
//! - [`Stream<T>`] 是对外的主要值类型：一个可多次订阅的冷源加一组组合方法；
//!   每个组合方法只负责把参数封进对应操作符的源结构，状态机本体在
//!   `operators` 模块内。
//!
//! ## 契约说明（What）
//! - [`StreamSource::subscribe`] 必须在任何其他信号之前（同步或异步）恰好
//!   投递一次 `on_subscribe`；
//! - 工厂源（`just`/`from_iter`/`range`）内建请求记账：`on_next` 总量不超过
//!   累计需求，需求达到 [`UNBOUNDED`](crate::demand::UNBOUNDED) 后走免记账快路径。

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::arbiter::SingleAssignmentArbiter;
use crate::config;
use crate::demand::Demand;
use crate::disposable::FnDisposable;
use crate::drain::DrainGate;
use crate::error::RillError;
use crate::operators;
use crate::operators::connectable::ConnectableStream;
use crate::operators::group_by::GroupedStream;
use crate::protocol::{
    DisposableRef, Handle, HandleRef, Notification, NoopHandle, Sink, SinkRef, validate_request,
};
use crate::scheduler::SchedulerRef;

/// 可订阅源：`Stream` 的内核契约。
pub trait StreamSource<T>: Send + Sync {
    fn subscribe(&self, sink: SinkRef<T>);
}

/// 背压风味的流值类型；克隆即共享同一源。
pub struct Stream<T> {
    source: Arc<dyn StreamSource<T>>,
}

impl<T> Clone for Stream<T> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
        }
    }
}

impl<T: Send + 'static> Stream<T> {
    /// 由已共享的源构造流。
    pub fn from_source(source: Arc<dyn StreamSource<T>>) -> Self {
        Self { source }
    }

    /// 由具体源类型构造流。
    pub fn new(source: impl StreamSource<T> + 'static) -> Self {
        Self {
            source: Arc::new(source),
        }
    }

    /// 订阅；源保证先投递 `on_subscribe`。
    pub fn subscribe(&self, sink: SinkRef<T>) {
        self.source.subscribe(sink);
    }

    /// 以闭包订阅，需求无界；返回的句柄可取消订阅。
    pub fn subscribe_with(
        &self,
        on_next: impl Fn(T) + Send + Sync + 'static,
        on_error: impl Fn(RillError) + Send + Sync + 'static,
        on_complete: impl Fn() + Send + Sync + 'static,
    ) -> DisposableRef {
        let sink = Arc::new(LambdaSink {
            on_next: Box::new(on_next),
            on_error: Box::new(on_error),
            on_complete: Box::new(on_complete),
            upstream: SingleAssignmentArbiter::new(),
            done: AtomicBool::new(false),
        });
        self.subscribe(sink.clone() as SinkRef<T>);
        FnDisposable::shared(move || sink.upstream.cancel())
    }

    // ---- 工厂 ----

    /// 空流：订阅即完成。
    pub fn empty() -> Self {
        Self::new(EmptySource)
    }

    /// 永不发射也永不终止的流。
    pub fn never() -> Self {
        Self::new(NeverSource)
    }

    /// 订阅即以给定错误终止的流。
    pub fn error(error: RillError) -> Self {
        Self::new(ErrorSource { error })
    }

    /// 单值流。
    pub fn just(value: T) -> Self
    where
        T: Clone + Sync,
    {
        Self::from_iter_factory(Arc::new(move || {
            Box::new(std::iter::once(value.clone())) as Box<dyn Iterator<Item = T> + Send>
        }))
    }

    /// 由可重复迭代的集合构造流；每次订阅独立迭代。
    pub fn from_iter<I>(iterable: I) -> Self
    where
        I: IntoIterator<Item = T> + Clone + Send + Sync + 'static,
        I::IntoIter: Send,
    {
        Self::from_iter_factory(Arc::new(move || {
            Box::new(iterable.clone().into_iter()) as Box<dyn Iterator<Item = T> + Send>
        }))
    }

    fn from_iter_factory(make: IterFactory<T>) -> Self {
        Self::new(IterSource { make })
    }

    // ---- 基础操作符 ----

    pub fn map<R: Send + 'static>(
        &self,
        f: impl Fn(T) -> R + Send + Sync + 'static,
    ) -> Stream<R> {
        operators::basic::map(self.clone(), Arc::new(f))
    }

    pub fn filter(&self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Stream<T> {
        operators::basic::filter(self.clone(), Arc::new(predicate))
    }

    pub fn take(&self, count: u64) -> Stream<T> {
        operators::basic::take(self.clone(), count)
    }

    pub fn skip(&self, count: u64) -> Stream<T> {
        operators::basic::skip(self.clone(), count)
    }

    pub fn take_last(&self, count: usize) -> Stream<T> {
        operators::aggregate::take_last(self.clone(), count)
    }

    /// `other` 发射或完成时终止本流。
    pub fn take_until<U: Send + 'static>(&self, other: Stream<U>) -> Stream<T> {
        operators::take_until::take_until(self.clone(), other)
    }

    /// 判断是否所有元素满足谓词；空流产出 `true`。
    pub fn all(&self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Stream<bool> {
        operators::aggregate::all(self.clone(), Arc::new(predicate))
    }

    /// 要求恰好一个元素：空流报 `sequence.no_element`，多元素报 `sequence.too_many`。
    pub fn single(&self) -> Stream<T> {
        operators::aggregate::single(self.clone())
    }

    /// 聚合全部元素为一个列表。
    pub fn to_list(&self) -> Stream<Vec<T>> {
        operators::aggregate::to_list(self.clone())
    }

    /// 把信号具象化为 [`Notification`] 值。
    pub fn materialize(&self) -> Stream<Notification<T>> {
        operators::materialize::materialize(self.clone())
    }

    /// 切换下游信号的执行线程；缓冲容量取进程配置。
    pub fn observe_on(&self, scheduler: SchedulerRef) -> Stream<T> {
        self.observe_on_with(scheduler, config::buffer_size())
    }

    pub fn observe_on_with(&self, scheduler: SchedulerRef, buffer_size: usize) -> Stream<T> {
        operators::observe_on::observe_on(self.clone(), scheduler, buffer_size)
    }

    // ---- 在范围内的核心操作符 ----

    /// 按键拆分为分组流；值原样进组。
    pub fn group_by<K>(
        &self,
        key_of: impl Fn(&T) -> K + Send + Sync + 'static,
    ) -> Stream<GroupedStream<K, T>>
    where
        K: Eq + std::hash::Hash + Clone + Send + Sync + 'static,
    {
        operators::group_by::group_by(
            self.clone(),
            Arc::new(key_of),
            Arc::new(|value| value),
            config::buffer_size(),
            false,
        )
    }

    /// 完整参数版 `group_by`。
    pub fn group_by_with<K, V>(
        &self,
        key_of: impl Fn(&T) -> K + Send + Sync + 'static,
        value_of: impl Fn(T) -> V + Send + Sync + 'static,
        buffer_size: usize,
        delay_error: bool,
    ) -> Stream<GroupedStream<K, V>>
    where
        K: Eq + std::hash::Hash + Clone + Send + Sync + 'static,
        V: Send + 'static,
    {
        operators::group_by::group_by(
            self.clone(),
            Arc::new(key_of),
            Arc::new(value_of),
            buffer_size,
            delay_error,
        )
    }

    /// 以另一条流的发射为界切分窗口。
    pub fn window<B: Send + 'static>(&self, boundary: Stream<B>) -> Stream<Stream<T>> {
        operators::window_boundary::window_boundary(self.clone(), boundary)
    }

    /// 定时窗口：每 `timespan` 关闭当前窗口并开启新窗口。
    pub fn window_timed(&self, timespan: Duration, scheduler: SchedulerRef) -> Stream<Stream<T>> {
        operators::window_timed::window_exact_unbounded(self.clone(), timespan, scheduler)
    }

    /// 带容量上限的定时窗口；满 `max_size` 提前关窗，可选重置计时。
    pub fn window_timed_bounded(
        &self,
        timespan: Duration,
        scheduler: SchedulerRef,
        max_size: usize,
        restart_timer_on_max_size: bool,
    ) -> Stream<Stream<T>> {
        operators::window_timed::window_exact_bounded(
            self.clone(),
            timespan,
            scheduler,
            max_size,
            restart_timer_on_max_size,
        )
    }

    /// 跨度与步长不等的定时窗口（重叠或带空隙）。
    pub fn window_timed_skip(
        &self,
        timespan: Duration,
        timeskip: Duration,
        scheduler: SchedulerRef,
    ) -> Stream<Stream<T>>
    where
        T: Clone,
    {
        operators::window_timed::window_skip(self.clone(), timespan, timeskip, scheduler)
    }

    /// 主流每个值与另一条流的最新值合成；另一侧尚无值时丢弃。
    pub fn with_latest_from<U, R>(
        &self,
        other: Stream<U>,
        combiner: impl Fn(T, &U) -> R + Send + Sync + 'static,
    ) -> Stream<R>
    where
        U: Send + Sync + 'static,
        R: Send + 'static,
    {
        operators::with_latest_from::with_latest_from(self.clone(), other, Arc::new(combiner))
    }

    /// 静默 `duration` 后才发射最近值。
    pub fn debounce(&self, duration: Duration, scheduler: SchedulerRef) -> Stream<T> {
        operators::debounce::debounce_timed(self.clone(), duration, scheduler)
    }

    /// 以选择器流的首个信号为静默界。
    pub fn debounce_selector<U: Send + 'static>(
        &self,
        selector: impl Fn(&T) -> Stream<U> + Send + Sync + 'static,
    ) -> Stream<T> {
        operators::debounce::debounce_selector(self.clone(), Arc::new(selector))
    }

    /// 转为可连接流：`connect` 触发对上游的唯一订阅。
    pub fn publish(&self) -> ConnectableStream<T>
    where
        T: Clone + Sync,
    {
        operators::connectable::publish(self.clone(), config::buffer_size())
    }

    /// 上游出错时重订阅至多 `times` 次。
    pub fn retry(&self, times: u64) -> Stream<T> {
        operators::resume::retry(self.clone(), times)
    }

    /// 上游出错时切换到回退流。
    pub fn on_error_resume_next(
        &self,
        resume: impl Fn(&RillError) -> Stream<T> + Send + Sync + 'static,
    ) -> Stream<T> {
        operators::resume::on_error_resume_next(self.clone(), Arc::new(resume))
    }

    /// 作用域资源：订阅时获取，任何退出路径保证释放。
    pub fn using<R: Send + Sync + 'static>(
        resource_factory: impl Fn() -> R + Send + Sync + 'static,
        source_factory: impl Fn(&R) -> Stream<T> + Send + Sync + 'static,
        disposer: impl Fn(R) + Send + Sync + 'static,
        eager: bool,
    ) -> Stream<T> {
        operators::using::using(
            Arc::new(resource_factory),
            Arc::new(source_factory),
            Arc::new(disposer),
            eager,
        )
    }

    /// 组合多条同型流的最新值。
    pub fn combine_latest<R>(
        sources: Vec<Stream<T>>,
        combiner: impl Fn(&[T]) -> R + Send + Sync + 'static,
    ) -> Stream<R>
    where
        T: Clone + Sync,
        R: Send + 'static,
    {
        Self::combine_latest_with(sources, combiner, config::buffer_size(), false)
    }

    /// 完整参数版 `combine_latest`。
    pub fn combine_latest_with<R>(
        sources: Vec<Stream<T>>,
        combiner: impl Fn(&[T]) -> R + Send + Sync + 'static,
        buffer_size: usize,
        delay_error: bool,
    ) -> Stream<R>
    where
        T: Clone + Sync,
        R: Send + 'static,
    {
        operators::combine_latest::combine_latest(
            sources,
            Arc::new(combiner),
            buffer_size,
            delay_error,
        )
    }
}

impl Stream<i64> {
    /// 发射 `start..start + count` 的整数序列。
    pub fn range(start: i64, count: u64) -> Stream<i64> {
        Stream::from_iter_factory(Arc::new(move || {
            Box::new((0..count).map(move |i| start + i as i64))
                as Box<dyn Iterator<Item = i64> + Send>
        }))
    }
}

impl<T: Send + 'static> Stream<Stream<T>> {
    /// 顺序接续内层流；预取容量取进程配置。
    pub fn concat(&self) -> Stream<T> {
        self.concat_with_prefetch(config::buffer_size())
    }

    pub fn concat_with_prefetch(&self, prefetch: usize) -> Stream<T> {
        operators::concat::concat(self.clone(), prefetch)
    }

    /// 并发合并内层流；`max_concurrency` 限制同时活跃的内层订阅数。
    pub fn merge(&self, max_concurrency: usize) -> Stream<T> {
        operators::merge::merge(self.clone(), max_concurrency, config::buffer_size())
    }
}

impl<T: Send + 'static> Stream<Notification<T>> {
    /// 把具象化信号还原为裸信号。
    pub fn dematerialize(&self) -> Stream<T> {
        operators::materialize::dematerialize(self.clone())
    }
}

// ---- 工厂源实现 ----

type IterFactory<T> =
    Arc<dyn Fn() -> Box<dyn Iterator<Item = T> + Send> + Send + Sync>;

struct EmptySource;

impl<T: Send + 'static> StreamSource<T> for EmptySource {
    fn subscribe(&self, sink: SinkRef<T>) {
        sink.on_subscribe(NoopHandle::shared());
        sink.on_complete();
    }
}

struct NeverSource;

impl<T: Send + 'static> StreamSource<T> for NeverSource {
    fn subscribe(&self, sink: SinkRef<T>) {
        sink.on_subscribe(NoopHandle::shared());
    }
}

struct ErrorSource {
    error: RillError,
}

impl<T: Send + 'static> StreamSource<T> for ErrorSource {
    fn subscribe(&self, sink: SinkRef<T>) {
        sink.on_subscribe(NoopHandle::shared());
        sink.on_error(self.error.clone());
    }
}

struct IterSource<T> {
    make: IterFactory<T>,
}

impl<T: Send + 'static> StreamSource<T> for IterSource<T> {
    fn subscribe(&self, sink: SinkRef<T>) {
        let mut iter = (self.make)().peekable();
        if iter.peek().is_none() {
            // 空迭代器无需等待请求即可完成。
            sink.on_subscribe(NoopHandle::shared());
            sink.on_complete();
            return;
        }
        let handle = Arc::new(IterHandle {
            iter: Mutex::new(iter),
            downstream: Arc::clone(&sink),
            requested: Demand::new(),
            gate: DrainGate::new(),
            cancelled: AtomicBool::new(false),
            done: AtomicBool::new(false),
        });
        sink.on_subscribe(handle as HandleRef);
    }
}

/// 迭代器源的请求记账状态机；需求驱动的拉式发射。
struct IterHandle<T> {
    iter: Mutex<std::iter::Peekable<Box<dyn Iterator<Item = T> + Send>>>,
    downstream: SinkRef<T>,
    requested: Demand,
    gate: DrainGate,
    cancelled: AtomicBool,
    done: AtomicBool,
}

impl<T: Send + 'static> IterHandle<T> {
    fn drain(&self) {
        let mut missed = 1;
        loop {
            let requested = self.requested.current();
            let mut emitted = 0u64;
            while emitted < requested {
                if self.cancelled.load(Ordering::Acquire) || self.done.load(Ordering::Acquire) {
                    break;
                }
                let next = self.iter.lock().next();
                match next {
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
            // 需求边界上的穷尽检查：发完最后一个值即补发完成。
            if !self.cancelled.load(Ordering::Acquire)
                && !self.done.load(Ordering::Acquire)
                && self.iter.lock().peek().is_none()
                && !self.done.swap(true, Ordering::AcqRel)
            {
                self.downstream.on_complete();
            }
            missed = self.gate.leave(missed);
            if missed == 0 {
                return;
            }
        }
    }
}

impl<T: Send + 'static> Handle for IterHandle<T> {
    fn request(&self, n: u64) {
        if !validate_request(n) {
            return;
        }
        self.requested.add(n);
        if self.gate.enter() {
            self.drain();
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

struct LambdaSink<T> {
    on_next: Box<dyn Fn(T) + Send + Sync>,
    on_error: Box<dyn Fn(RillError) + Send + Sync>,
    on_complete: Box<dyn Fn() + Send + Sync>,
    upstream: SingleAssignmentArbiter,
    done: AtomicBool,
}

impl<T: Send + 'static> Sink<T> for LambdaSink<T> {
    fn on_subscribe(&self, handle: HandleRef) {
        if self.upstream.set(handle) {
            self.upstream.request(crate::demand::UNBOUNDED);
        }
    }

    fn on_next(&self, value: T) {
        if !self.done.load(Ordering::Acquire) {
            (self.on_next)(value);
        }
    }

    fn on_error(&self, error: RillError) {
        if !self.done.swap(true, Ordering::AcqRel) {
            (self.on_error)(error);
        }
    }

    fn on_complete(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            (self.on_complete)();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::TestSink;

    /// 工厂源遵守请求记账：按需分批发射。
    #[test]
    fn range_honors_requests() {
        let sink = TestSink::with_request(3);
        Stream::range(1, 10).subscribe(sink.clone());
        sink.assert_values(&[1, 2, 3]);
        sink.request(5);
        sink.assert_values(&[1, 2, 3, 4, 5, 6, 7, 8]);
        sink.request(100);
        sink.assert_values(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        sink.assert_completed();
    }

    /// 空流订阅即完成；错误流订阅即出错。
    #[test]
    fn empty_and_error_factories() {
        let sink = TestSink::<i32>::unbounded();
        Stream::<i32>::empty().subscribe(sink.clone());
        sink.assert_no_values();
        sink.assert_completed();

        let err_sink = TestSink::<i32>::unbounded();
        Stream::<i32>::error(RillError::new("upstream.failure", "boom"))
            .subscribe(err_sink.clone());
        err_sink.assert_error_code("upstream.failure");
    }

    /// 每次订阅独立迭代，互不干扰。
    #[test]
    fn from_iter_restarts_per_subscription() {
        let stream = Stream::from_iter(vec![7, 8, 9]);
        let first = TestSink::unbounded();
        let second = TestSink::unbounded();
        stream.subscribe(first.clone());
        stream.subscribe(second.clone());
        first.assert_values(&[7, 8, 9]);
        second.assert_values(&[7, 8, 9]);
        first.assert_completed();
        second.assert_completed();
    }

    /// 取消后迭代器源停止发射。
    #[test]
    fn cancel_stops_iterator_source() {
        let sink = TestSink::with_request(2);
        Stream::range(0, 1_000).subscribe(sink.clone());
        sink.assert_values(&[0, 1]);
        sink.cancel();
        sink.request(10);
        sink.assert_values(&[0, 1]);
    }

    /// 闭包订阅默认无界需求并可经句柄取消。
    #[test]
    fn subscribe_with_collects_all() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let completed = Arc::new(AtomicBool::new(false));
        let values = Arc::clone(&seen);
        let flag = Arc::clone(&completed);
        Stream::range(1, 4).subscribe_with(
            move |v| values.lock().push(v),
            |_| {},
            move || flag.store(true, Ordering::Release),
        );
        assert_eq!(seen.lock().clone(), vec![1, 2, 3, 4]);
        assert!(completed.load(Ordering::Acquire));
    }
}
