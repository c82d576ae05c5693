//! 采样组合：`with_latest_from`。
//!
//! 主流驱动节奏：另一侧只是一个被原子引用保存的最新值。另一侧尚无值时
//! 主流的值被丢弃并向主上游补一个需求。两侧的终止信号可能并发到达，
//! 下游经串行化包装投递。

use arc_swap::ArcSwapOption;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::arbiter::SingleAssignmentArbiter;
use crate::demand::UNBOUNDED;
use crate::drain::SerializedSink;
use crate::error::RillError;
use crate::protocol::{Handle, HandleRef, Sink, SinkRef, validate_request};
use crate::stream::{Stream, StreamSource};

type Combiner<T, U, R> = Arc<dyn Fn(T, &U) -> R + Send + Sync>;

pub(crate) fn with_latest_from<T, U, R>(
    main: Stream<T>,
    other: Stream<U>,
    combiner: Combiner<T, U, R>,
) -> Stream<R>
where
    T: Send + 'static,
    U: Send + Sync + 'static,
    R: Send + 'static,
{
    Stream::new(WithLatestFromSource {
        main,
        other,
        combiner,
    })
}

struct WithLatestFromSource<T, U, R> {
    main: Stream<T>,
    other: Stream<U>,
    combiner: Combiner<T, U, R>,
}

impl<T, U, R> StreamSource<R> for WithLatestFromSource<T, U, R>
where
    T: Send + 'static,
    U: Send + Sync + 'static,
    R: Send + 'static,
{
    fn subscribe(&self, sink: SinkRef<R>) {
        let serialized = Arc::new(SerializedSink::new(sink));
        let main_sink = Arc::new(MainSink {
            downstream: Arc::clone(&serialized),
            combiner: Arc::clone(&self.combiner),
            latest: ArcSwapOption::const_empty(),
            main_handle: SingleAssignmentArbiter::new(),
            other_handle: SingleAssignmentArbiter::new(),
            done: AtomicBool::new(false),
        });
        serialized.downstream().on_subscribe(Arc::clone(&main_sink) as HandleRef);

        let other_sink = Arc::new(OtherSink {
            main: Arc::clone(&main_sink),
        });
        self.other.subscribe(other_sink as SinkRef<U>);
        self.main.subscribe(main_sink as SinkRef<T>);
    }
}

struct MainSink<T, U, R> {
    downstream: Arc<SerializedSink<R>>,
    combiner: Combiner<T, U, R>,
    latest: ArcSwapOption<U>,
    main_handle: SingleAssignmentArbiter,
    other_handle: SingleAssignmentArbiter,
    done: AtomicBool,
}

impl<T, U, R> Sink<T> for MainSink<T, U, R>
where
    T: Send + 'static,
    U: Send + Sync + 'static,
    R: Send + 'static,
{
    fn on_subscribe(&self, handle: HandleRef) {
        self.main_handle.set(handle);
    }

    fn on_next(&self, value: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        match self.latest.load_full() {
            Some(latest) => {
                self.downstream.on_next((self.combiner)(value, &latest));
            }
            None => {
                // 另一侧尚无值：丢弃并补偿需求。
                self.main_handle.request(1);
            }
        }
    }

    fn on_error(&self, error: RillError) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.other_handle.cancel();
            self.downstream.on_error(error);
        }
    }

    fn on_complete(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.other_handle.cancel();
            self.downstream.on_complete();
        }
    }
}

impl<T, U, R> Handle for MainSink<T, U, R>
where
    T: Send + 'static,
    U: Send + Sync + 'static,
    R: Send + 'static,
{
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
    }
}

struct OtherSink<T, U, R> {
    main: Arc<MainSink<T, U, R>>,
}

impl<T, U, R> Sink<U> for OtherSink<T, U, R>
where
    T: Send + 'static,
    U: Send + Sync + 'static,
    R: Send + 'static,
{
    fn on_subscribe(&self, handle: HandleRef) {
        if self.main.other_handle.set(handle) {
            self.main.other_handle.request(UNBOUNDED);
        }
    }

    fn on_next(&self, value: U) {
        self.main.latest.store(Some(Arc::new(value)));
    }

    fn on_error(&self, error: RillError) {
        // 另一侧失败对整体致命：取消主流并传播。
        if !self.main.done.swap(true, Ordering::AcqRel) {
            self.main.main_handle.cancel();
            self.main.downstream.on_error(error);
        }
    }

    fn on_complete(&self) {
        // 另一侧完成后最新值冻结，主流继续采样既有值。
    }
}
