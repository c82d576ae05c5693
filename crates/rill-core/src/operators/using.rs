//! 作用域资源：`using`。
//!
//! 资源在订阅时获取，在终止、取消或派生源失败的每一条退出路径上保证释放；
//! `eager` 模式在投递终止信号之前释放，非 `eager` 在之后。

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::arbiter::SingleAssignmentArbiter;
use crate::error::RillError;
use crate::protocol::{Handle, HandleRef, Sink, SinkRef, validate_request};
use crate::stream::{Stream, StreamSource};

type ResourceFactory<R> = Arc<dyn Fn() -> R + Send + Sync>;
type SourceFactory<T, R> = Arc<dyn Fn(&R) -> Stream<T> + Send + Sync>;
type Disposer<R> = Arc<dyn Fn(R) + Send + Sync>;

pub(crate) fn using<T, R>(
    resource_factory: ResourceFactory<R>,
    source_factory: SourceFactory<T, R>,
    disposer: Disposer<R>,
    eager: bool,
) -> Stream<T>
where
    T: Send + 'static,
    R: Send + Sync + 'static,
{
    Stream::new(UsingSource {
        resource_factory,
        source_factory,
        disposer,
        eager,
    })
}

struct UsingSource<T, R> {
    resource_factory: ResourceFactory<R>,
    source_factory: SourceFactory<T, R>,
    disposer: Disposer<R>,
    eager: bool,
}

impl<T, R> StreamSource<T> for UsingSource<T, R>
where
    T: Send + 'static,
    R: Send + Sync + 'static,
{
    fn subscribe(&self, sink: SinkRef<T>) {
        let resource = (self.resource_factory)();
        let stream = (self.source_factory)(&resource);
        let guard = Arc::new(ResourceGuard {
            resource: Mutex::new(Some(resource)),
            disposer: Arc::clone(&self.disposer),
        });
        let using = Arc::new(UsingSink {
            downstream: Arc::clone(&sink),
            guard,
            eager: self.eager,
            upstream: SingleAssignmentArbiter::new(),
            done: AtomicBool::new(false),
        });
        sink.on_subscribe(Arc::clone(&using) as HandleRef);
        stream.subscribe(using as SinkRef<T>);
    }
}

struct ResourceGuard<R> {
    resource: Mutex<Option<R>>,
    disposer: Disposer<R>,
}

impl<R> ResourceGuard<R> {
    /// 恰好释放一次；并发调用只有一个赢家。
    fn release(&self) {
        if let Some(resource) = self.resource.lock().take() {
            (self.disposer)(resource);
        }
    }
}

struct UsingSink<T, R> {
    downstream: SinkRef<T>,
    guard: Arc<ResourceGuard<R>>,
    eager: bool,
    upstream: SingleAssignmentArbiter,
    done: AtomicBool,
}

impl<T, R> Sink<T> for UsingSink<T, R>
where
    T: Send + 'static,
    R: Send + Sync + 'static,
{
    fn on_subscribe(&self, handle: HandleRef) {
        self.upstream.set(handle);
    }

    fn on_next(&self, value: T) {
        if !self.done.load(Ordering::Acquire) {
            self.downstream.on_next(value);
        }
    }

    fn on_error(&self, error: RillError) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.eager {
            self.guard.release();
            self.downstream.on_error(error);
        } else {
            self.downstream.on_error(error);
            self.guard.release();
        }
    }

    fn on_complete(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.eager {
            self.guard.release();
            self.downstream.on_complete();
        } else {
            self.downstream.on_complete();
            self.guard.release();
        }
    }
}

impl<T, R> Handle for UsingSink<T, R>
where
    T: Send + 'static,
    R: Send + Sync + 'static,
{
    fn request(&self, n: u64) {
        if !validate_request(n) {
            return;
        }
        self.upstream.request(n);
    }

    fn cancel(&self) {
        self.done.store(true, Ordering::Release);
        self.upstream.cancel();
        self.guard.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::TestSink;
    use std::sync::atomic::AtomicUsize;

    fn tracked_stream(
        order: Arc<Mutex<Vec<&'static str>>>,
        eager: bool,
    ) -> Stream<i32> {
        let acquire_log = Arc::clone(&order);
        let dispose_log = Arc::clone(&order);
        Stream::using(
            move || {
                acquire_log.lock().push("acquire");
                AtomicUsize::new(0)
            },
            |_resource| Stream::from_iter(vec![1, 2]),
            move |_resource| dispose_log.lock().push("dispose"),
            eager,
        )
    }

    /// 非 eager：终止信号之后才释放资源。
    #[test]
    fn lazy_disposal_follows_terminal() {
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let completion_log = Arc::clone(&order);
        tracked_stream(Arc::clone(&order), false).subscribe_with(
            |_| {},
            |_| {},
            move || completion_log.lock().push("complete"),
        );
        assert_eq!(
            order.lock().clone(),
            vec!["acquire", "complete", "dispose"],
            "非 eager 模式在终止投递之后释放"
        );
    }

    /// eager：终止信号之前释放资源。
    #[test]
    fn eager_disposal_precedes_terminal() {
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let completion_log = Arc::clone(&order);
        let stream = tracked_stream(Arc::clone(&order), true);
        stream.subscribe_with(
            |_| {},
            |_| {},
            move || completion_log.lock().push("complete"),
        );
        assert_eq!(
            order.lock().clone(),
            vec!["acquire", "dispose", "complete"],
            "eager 模式先释放后投递终止"
        );
    }

    /// 取消路径同样保证释放。
    #[test]
    fn cancellation_releases_resource() {
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = TestSink::with_request(1);
        tracked_stream(Arc::clone(&order), false).subscribe(sink.clone());
        sink.cancel();
        assert!(
            order.lock().contains(&"dispose"),
            "取消必须释放资源"
        );
    }
}
