//! 边界窗口：`window(boundary)`。
//!
//! ## 状态机概要（How）
//! - 值与边界事件先物化进同一条 MPSC 队列，由排空循环串行消化，
//!   保证“关旧窗、开新窗”相对值的顺序确定；
//! - 当前窗口是一个单播主体；边界事件令其完成并开启新窗口；
//!   开窗瞬间外层无需求即为 `backpressure.missing` 级联终止；
//! - 引用计数：外层占 1，每个开启的窗口占 1；归零时取消上游与边界。

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::arbiter::SingleAssignmentArbiter;
use crate::demand::{Demand, UNBOUNDED};
use crate::drain::DrainGate;
use crate::error::RillError;
use crate::protocol::{Handle, HandleRef, Sink, SinkRef, validate_request};
use crate::queue::MpscLinkedQueue;
use crate::stream::{Stream, StreamSource};
use crate::subject::UnicastSubject;

pub(crate) fn window_boundary<T: Send + 'static, B: Send + 'static>(
    upstream: Stream<T>,
    boundary: Stream<B>,
) -> Stream<Stream<T>> {
    Stream::new(WindowBoundarySource { upstream, boundary })
}

struct WindowBoundarySource<T, B> {
    upstream: Stream<T>,
    boundary: Stream<B>,
}

impl<T: Send + 'static, B: Send + 'static> StreamSource<Stream<T>>
    for WindowBoundarySource<T, B>
{
    fn subscribe(&self, sink: SinkRef<Stream<T>>) {
        let main = Arc::new_cyclic(|this: &Weak<WindowBoundarySink<T>>| WindowBoundarySink {
            downstream: Arc::clone(&sink),
            queue: MpscLinkedQueue::new(),
            gate: DrainGate::new(),
            requested: Demand::new(),
            upstream: SingleAssignmentArbiter::new(),
            boundary: SingleAssignmentArbiter::new(),
            window: Mutex::new(None),
            window_count: AtomicUsize::new(1),
            cancelled: AtomicBool::new(false),
            done: AtomicBool::new(false),
            error: Mutex::new(None),
            terminated: AtomicBool::new(false),
            this: this.clone(),
        });
        sink.on_subscribe(Arc::clone(&main) as HandleRef);
        // 首窗经队列开启，与值、边界共用一条串行化通道。
        main.queue.offer(WindowEvent::Open);
        main.drain();

        let boundary_sink = Arc::new(BoundarySink {
            main: Arc::clone(&main),
        });
        self.boundary.subscribe(boundary_sink as SinkRef<B>);
        self.upstream.subscribe(main as SinkRef<T>);
    }
}

enum WindowEvent<T> {
    Value(T),
    Open,
    Boundary,
}

struct WindowBoundarySink<T> {
    downstream: SinkRef<Stream<T>>,
    queue: MpscLinkedQueue<WindowEvent<T>>,
    gate: DrainGate,
    requested: Demand,
    upstream: SingleAssignmentArbiter,
    boundary: SingleAssignmentArbiter,
    window: Mutex<Option<Arc<UnicastSubject<T>>>>,
    window_count: AtomicUsize,
    cancelled: AtomicBool,
    done: AtomicBool,
    error: Mutex<Option<RillError>>,
    terminated: AtomicBool,
    this: Weak<Self>,
}

impl<T: Send + 'static> WindowBoundarySink<T> {
    fn drain(&self) {
        if !self.gate.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            while let Some(event) = self.queue.poll() {
                match event {
                    WindowEvent::Value(value) => {
                        if let Some(window) = self.window.lock().clone() {
                            window.on_next(value);
                        }
                    }
                    WindowEvent::Open => self.open_window(),
                    WindowEvent::Boundary => {
                        self.close_window();
                        if !self.cancelled.load(Ordering::Acquire)
                            && !self.done.load(Ordering::Acquire)
                        {
                            self.open_window();
                        }
                    }
                }
            }
            if self.done.load(Ordering::Acquire) && !self.terminated.swap(true, Ordering::AcqRel) {
                self.close_window();
                self.boundary.cancel();
                match self.error.lock().take() {
                    Some(error) => self.downstream.on_error(error),
                    None => self.downstream.on_complete(),
                }
            }
            missed = self.gate.leave(missed);
            if missed == 0 {
                return;
            }
        }
    }

    fn open_window(&self) {
        if self.cancelled.load(Ordering::Acquire) || self.terminated.load(Ordering::Acquire) {
            return;
        }
        if self.requested.current() == 0 {
            // 开窗需要外层需求；缺失即为背压违规，整体终止。
            self.abort(RillError::missing_backpressure(
                "window emission without outer demand",
            ));
            return;
        }
        let parent = self.this.clone();
        let window = UnicastSubject::with_on_terminate(move || {
            if let Some(main) = parent.upgrade() {
                main.window_terminated();
            }
        });
        self.window_count.fetch_add(1, Ordering::AcqRel);
        *self.window.lock() = Some(Arc::clone(&window));
        self.downstream.on_next(window.stream());
        self.requested.produced(1);
    }

    fn close_window(&self) {
        if let Some(window) = self.window.lock().take() {
            window.on_complete();
        }
    }

    fn abort(&self, error: RillError) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.upstream.cancel();
        self.boundary.cancel();
        if let Some(window) = self.window.lock().take() {
            window.on_error(error.clone());
        }
        self.downstream.on_error(error);
    }

    fn window_terminated(&self) {
        if self.window_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.upstream.cancel();
            self.boundary.cancel();
        }
    }
}

impl<T: Send + 'static> Sink<T> for WindowBoundarySink<T> {
    fn on_subscribe(&self, handle: HandleRef) {
        if self.upstream.set(handle) {
            self.upstream.request(UNBOUNDED);
        }
    }

    fn on_next(&self, value: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        self.queue.offer(WindowEvent::Value(value));
        self.drain();
    }

    fn on_error(&self, error: RillError) {
        if self.done.swap(true, Ordering::AcqRel) {
            crate::hook::on_error(error);
            return;
        }
        *self.error.lock() = Some(error);
        self.drain();
    }

    fn on_complete(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.drain();
        }
    }
}

impl<T: Send + 'static> Handle for WindowBoundarySink<T> {
    fn request(&self, n: u64) {
        if !validate_request(n) {
            return;
        }
        self.requested.add(n);
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.window_terminated();
        }
    }
}

struct BoundarySink<T> {
    main: Arc<WindowBoundarySink<T>>,
}

impl<T: Send + 'static, B: Send + 'static> Sink<B> for BoundarySink<T> {
    fn on_subscribe(&self, handle: HandleRef) {
        if self.main.boundary.set(handle) {
            self.main.boundary.request(UNBOUNDED);
        }
    }

    fn on_next(&self, _boundary: B) {
        if !self.main.done.load(Ordering::Acquire) {
            self.main.queue.offer(WindowEvent::Boundary);
            self.main.drain();
        }
    }

    fn on_error(&self, error: RillError) {
        self.main.upstream.cancel();
        self.main.on_error(error);
    }

    fn on_complete(&self) {
        self.main.upstream.cancel();
        self.main.on_complete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subject::PublishSubject;
    use crate::testkit::TestSink;
    use parking_lot::Mutex as PlMutex;

    fn attach_collector(
        outer: &Arc<crate::testkit::TestSink<Stream<i32>>>,
        from: usize,
        collectors: &Arc<PlMutex<Vec<Arc<crate::testkit::TestSink<i32>>>>>,
    ) {
        for window in outer.values().into_iter().skip(from) {
            let sink = TestSink::unbounded();
            window.subscribe(sink.clone());
            collectors.lock().push(sink);
        }
    }

    /// 边界事件切分窗口：值落入开启时的当前窗口。
    #[test]
    fn boundary_rotates_windows() {
        let source = PublishSubject::new();
        let boundary = PublishSubject::<()>::new();
        let outer = TestSink::unbounded();
        source
            .stream()
            .window(boundary.stream())
            .subscribe(outer.clone());

        let collectors = Arc::new(PlMutex::new(Vec::new()));
        attach_collector(&outer, 0, &collectors);

        source.on_next(1);
        source.on_next(2);
        boundary.on_next(());
        attach_collector(&outer, 1, &collectors);
        source.on_next(3);
        source.on_complete();

        let collectors = collectors.lock();
        assert_eq!(collectors.len(), 2, "一次边界产生两个窗口");
        collectors[0].assert_values(&[1, 2]);
        collectors[0].assert_completed();
        collectors[1].assert_values(&[3]);
        collectors[1].assert_completed();
        outer.assert_completed();
    }

    /// 边界流完成会终止整个窗口流。
    #[test]
    fn boundary_completion_terminates_main() {
        let source = PublishSubject::<i32>::new();
        let boundary = PublishSubject::<()>::new();
        let outer = TestSink::unbounded();
        source
            .stream()
            .window(boundary.stream())
            .subscribe(outer.clone());
        boundary.on_complete();
        outer.assert_completed();
    }

    /// 外层无需求时开窗触发 backpressure.missing。
    #[test]
    fn missing_outer_demand_aborts() {
        let source = PublishSubject::<i32>::new();
        let boundary = PublishSubject::<()>::new();
        let outer = TestSink::with_request(0);
        source
            .stream()
            .window(boundary.stream())
            .subscribe(outer.clone());
        outer.assert_error_code(crate::error::codes::BACKPRESSURE_MISSING);
    }
}
