//! 逐值变换族：`map` / `filter` / `take` / `skip`。
//!
//! 这一族不持有内部缓冲：`map` 透传上游句柄；`filter` 对每个被丢弃的值向
//! 上游补一个需求；`take` 对下游需求设上限并在满额时主动取消上游；
//! `skip` 在订阅时向上游预支跳过量。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::arbiter::SingleAssignmentArbiter;
use crate::error::RillError;
use crate::protocol::{Handle, HandleRef, Sink, SinkRef, validate_request};
use crate::stream::{Stream, StreamSource};

type MapFn<T, R> = Arc<dyn Fn(T) -> R + Send + Sync>;
type Predicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

pub(crate) fn map<T: Send + 'static, R: Send + 'static>(
    upstream: Stream<T>,
    f: MapFn<T, R>,
) -> Stream<R> {
    Stream::new(MapSource { upstream, f })
}

struct MapSource<T, R> {
    upstream: Stream<T>,
    f: MapFn<T, R>,
}

impl<T: Send + 'static, R: Send + 'static> StreamSource<R> for MapSource<T, R> {
    fn subscribe(&self, sink: SinkRef<R>) {
        self.upstream.subscribe(Arc::new(MapSink {
            downstream: sink,
            f: Arc::clone(&self.f),
            done: AtomicBool::new(false),
        }));
    }
}

struct MapSink<T, R> {
    downstream: SinkRef<R>,
    f: MapFn<T, R>,
    done: AtomicBool,
}

impl<T: Send + 'static, R: Send + 'static> Sink<T> for MapSink<T, R> {
    fn on_subscribe(&self, handle: HandleRef) {
        self.downstream.on_subscribe(handle);
    }

    fn on_next(&self, value: T) {
        if !self.done.load(Ordering::Acquire) {
            self.downstream.on_next((self.f)(value));
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

pub(crate) fn filter<T: Send + 'static>(upstream: Stream<T>, predicate: Predicate<T>) -> Stream<T> {
    Stream::new(FilterSource {
        upstream,
        predicate,
    })
}

struct FilterSource<T> {
    upstream: Stream<T>,
    predicate: Predicate<T>,
}

impl<T: Send + 'static> StreamSource<T> for FilterSource<T> {
    fn subscribe(&self, sink: SinkRef<T>) {
        self.upstream.subscribe(Arc::new(FilterSink {
            downstream: sink,
            predicate: Arc::clone(&self.predicate),
            upstream: SingleAssignmentArbiter::new(),
            done: AtomicBool::new(false),
        }));
    }
}

struct FilterSink<T> {
    downstream: SinkRef<T>,
    predicate: Predicate<T>,
    upstream: SingleAssignmentArbiter,
    done: AtomicBool,
}

impl<T: Send + 'static> Sink<T> for FilterSink<T> {
    fn on_subscribe(&self, handle: HandleRef) {
        if self.upstream.set(Arc::clone(&handle)) {
            // 过滤只是旁路：下游需求原样穿透，丢弃由 on_next 补偿。
            self.downstream.on_subscribe(handle);
        }
    }

    fn on_next(&self, value: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        if (self.predicate)(&value) {
            self.downstream.on_next(value);
        } else {
            self.upstream.request(1);
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

pub(crate) fn take<T: Send + 'static>(upstream: Stream<T>, count: u64) -> Stream<T> {
    Stream::new(TakeSource { upstream, count })
}

struct TakeSource<T> {
    upstream: Stream<T>,
    count: u64,
}

impl<T: Send + 'static> StreamSource<T> for TakeSource<T> {
    fn subscribe(&self, sink: SinkRef<T>) {
        if self.count == 0 {
            sink.on_subscribe(crate::protocol::NoopHandle::shared());
            sink.on_complete();
            return;
        }
        let take = Arc::new(TakeSink {
            downstream: Arc::clone(&sink),
            limit: self.count,
            emitted: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            upstream: SingleAssignmentArbiter::new(),
            done: AtomicBool::new(false),
        });
        sink.on_subscribe(Arc::clone(&take) as HandleRef);
        self.upstream.subscribe(take as SinkRef<T>);
    }
}

struct TakeSink<T> {
    downstream: SinkRef<T>,
    limit: u64,
    emitted: AtomicU64,
    /// 已向上游转发的需求总量；封顶于 `limit`。
    forwarded: AtomicU64,
    upstream: SingleAssignmentArbiter,
    done: AtomicBool,
}

impl<T: Send + 'static> Sink<T> for TakeSink<T> {
    fn on_subscribe(&self, handle: HandleRef) {
        self.upstream.set(handle);
    }

    fn on_next(&self, value: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let seen = self.emitted.fetch_add(1, Ordering::AcqRel) + 1;
        if seen < self.limit {
            self.downstream.on_next(value);
        } else if seen == self.limit {
            self.downstream.on_next(value);
            if !self.done.swap(true, Ordering::AcqRel) {
                self.upstream.cancel();
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

impl<T: Send + 'static> Handle for TakeSink<T> {
    fn request(&self, n: u64) {
        if !validate_request(n) {
            return;
        }
        // 转发量封顶于 limit：上游最多被要求产出 limit 个。
        let mut current = self.forwarded.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(n).min(self.limit);
            let delta = next - current;
            if delta == 0 {
                return;
            }
            match self.forwarded.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.upstream.request(delta);
                    return;
                }
                Err(observed) => current = observed,
            }
        }
    }

    fn cancel(&self) {
        self.done.store(true, Ordering::Release);
        self.upstream.cancel();
    }
}

pub(crate) fn skip<T: Send + 'static>(upstream: Stream<T>, count: u64) -> Stream<T> {
    Stream::new(SkipSource { upstream, count })
}

struct SkipSource<T> {
    upstream: Stream<T>,
    count: u64,
}

impl<T: Send + 'static> StreamSource<T> for SkipSource<T> {
    fn subscribe(&self, sink: SinkRef<T>) {
        self.upstream.subscribe(Arc::new(SkipSink {
            downstream: sink,
            remaining: AtomicU64::new(self.count),
            skip: self.count,
            done: AtomicBool::new(false),
        }));
    }
}

struct SkipSink<T> {
    downstream: SinkRef<T>,
    remaining: AtomicU64,
    skip: u64,
    done: AtomicBool,
}

impl<T: Send + 'static> Sink<T> for SkipSink<T> {
    fn on_subscribe(&self, handle: HandleRef) {
        self.downstream.on_subscribe(Arc::clone(&handle));
        // 预支被跳过的量，下游需求原样穿透。
        if self.skip > 0 {
            handle.request(self.skip);
        }
    }

    fn on_next(&self, value: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let mut current = self.remaining.load(Ordering::Acquire);
        while current > 0 {
            match self.remaining.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
        self.downstream.on_next(value);
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

    /// map 逐值变换并保序。
    #[test]
    fn map_transforms_in_order() {
        let sink = TestSink::unbounded();
        Stream::range(1, 4).map(|v| v * 10).subscribe(sink.clone());
        sink.assert_values(&[10, 20, 30, 40]);
        sink.assert_completed();
        sink.assert_protocol_clean();
    }

    /// filter 丢弃值时向上游补偿需求，有限需求下仍能推进。
    #[test]
    fn filter_replenishes_dropped_demand() {
        let sink = TestSink::with_request(2);
        Stream::range(1, 10).filter(|v| v % 2 == 0).subscribe(sink.clone());
        sink.assert_values(&[2, 4]);
        sink.request(2);
        sink.assert_values(&[2, 4, 6, 8]);
    }

    /// take 在满额时补发完成并取消上游。
    #[test]
    fn take_completes_at_limit() {
        let sink = TestSink::unbounded();
        Stream::range(1, 10).take(5).subscribe(sink.clone());
        sink.assert_values(&[1, 2, 3, 4, 5]);
        sink.assert_completed();
        sink.assert_protocol_clean();
    }

    /// take 的需求转发封顶于 limit。
    #[test]
    fn take_caps_forwarded_demand() {
        let sink = TestSink::with_request(3);
        Stream::range(1, 100).take(5).subscribe(sink.clone());
        sink.assert_values(&[1, 2, 3]);
        sink.request(100);
        sink.assert_values(&[1, 2, 3, 4, 5]);
        sink.assert_completed();
    }

    /// take(0) 不订阅即完成。
    #[test]
    fn take_zero_completes_immediately() {
        let sink = TestSink::unbounded();
        Stream::range(1, 10).take(0).subscribe(sink.clone());
        sink.assert_no_values();
        sink.assert_completed();
    }

    /// skip 跳过前缀后按序转发。
    #[test]
    fn skip_drops_prefix() {
        let sink = TestSink::unbounded();
        Stream::range(1, 6).skip(4).subscribe(sink.clone());
        sink.assert_values(&[5, 6]);
        sink.assert_completed();
    }
}
