//! 外部终止：`take_until(other)`。
//!
//! 另一条流的首个信号（值或完成）终止主流。两侧订阅的释放经由固定
//! 双槽位容器成对管理；两侧的终止可能并发，下游经串行化包装投递。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::arbiter::SingleAssignmentArbiter;
use crate::disposable::{ArrayCompositeDisposable, FnDisposable};
use crate::drain::SerializedSink;
use crate::error::RillError;
use crate::protocol::{Disposable, Handle, HandleRef, Sink, SinkRef, validate_request};
use crate::stream::{Stream, StreamSource};

pub(crate) fn take_until<T, U>(main: Stream<T>, other: Stream<U>) -> Stream<T>
where
    T: Send + 'static,
    U: Send + 'static,
{
    Stream::new(TakeUntilSource { main, other })
}

struct TakeUntilSource<T, U> {
    main: Stream<T>,
    other: Stream<U>,
}

impl<T, U> StreamSource<T> for TakeUntilSource<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    fn subscribe(&self, sink: SinkRef<T>) {
        let serialized = Arc::new(SerializedSink::new(sink));
        let main_sink = Arc::new(TakeUntilSink {
            downstream: serialized,
            main_handle: SingleAssignmentArbiter::new(),
            other_handle: SingleAssignmentArbiter::new(),
            resources: ArrayCompositeDisposable::new(2),
            done: AtomicBool::new(false),
        });
        main_sink
            .downstream
            .downstream()
            .on_subscribe(Arc::clone(&main_sink) as HandleRef);

        let other_sink = Arc::new(UntilSink {
            main: Arc::clone(&main_sink),
        });
        self.other.subscribe(other_sink as SinkRef<U>);
        self.main.subscribe(main_sink as SinkRef<T>);
    }
}

struct TakeUntilSink<T> {
    downstream: Arc<SerializedSink<T>>,
    main_handle: SingleAssignmentArbiter,
    other_handle: SingleAssignmentArbiter,
    /// 槽位 0 = 主流，槽位 1 = 另一侧；整组成对释放。
    resources: ArrayCompositeDisposable,
    done: AtomicBool,
}

impl<T: Send + 'static> TakeUntilSink<T> {
    fn finish(&self, terminal: Option<RillError>) {
        if self.done.swap(true, Ordering::AcqRel) {
            if let Some(error) = terminal {
                crate::hook::on_error(error);
            }
            return;
        }
        self.resources.dispose();
        match terminal {
            Some(error) => self.downstream.on_error(error),
            None => self.downstream.on_complete(),
        }
    }
}

impl<T: Send + 'static> Sink<T> for TakeUntilSink<T> {
    fn on_subscribe(&self, handle: HandleRef) {
        if self.main_handle.set(Arc::clone(&handle)) {
            let arbiter_ref: HandleRef = handle;
            self.resources.set(
                0,
                FnDisposable::shared(move || arbiter_ref.cancel()),
            );
        }
    }

    fn on_next(&self, value: T) {
        if !self.done.load(Ordering::Acquire) {
            self.downstream.on_next(value);
        }
    }

    fn on_error(&self, error: RillError) {
        self.finish(Some(error));
    }

    fn on_complete(&self) {
        self.finish(None);
    }
}

impl<T: Send + 'static> Handle for TakeUntilSink<T> {
    fn request(&self, n: u64) {
        if !validate_request(n) {
            return;
        }
        self.main_handle.request(n);
    }

    fn cancel(&self) {
        self.done.store(true, Ordering::Release);
        self.main_handle.cancel();
        self.other_handle.cancel();
        self.resources.dispose();
    }
}

struct UntilSink<T> {
    main: Arc<TakeUntilSink<T>>,
}

impl<T, U> Sink<U> for UntilSink<T>
where
    T: Send + 'static,
    U: Send + 'static,
{
    fn on_subscribe(&self, handle: HandleRef) {
        if self.main.other_handle.set(Arc::clone(&handle)) {
            let handle_ref: HandleRef = handle;
            self.main.resources.set(
                1,
                FnDisposable::shared(move || handle_ref.cancel()),
            );
            self.main.other_handle.request(1);
        }
    }

    fn on_next(&self, _value: U) {
        self.main.finish(None);
    }

    fn on_error(&self, error: RillError) {
        self.main.finish(Some(error));
    }

    fn on_complete(&self) {
        self.main.finish(None);
    }
}
