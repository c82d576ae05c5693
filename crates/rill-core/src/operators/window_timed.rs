//! 定时窗口：`window(timed)` 的三个子形态。
//!
//! ## 子形态（What）
//! - **精确无界**：每 `timespan` 轮换一次窗口，窗口容量无上限；
//! - **精确有界**：在无界形态上叠加 `max_size`，满额提前关窗，
//!   可选在满额关窗时重置计时节拍；
//! - **跨步**：`timespan ≠ timeskip`，窗口可能重叠（值进入所有开启的窗口）
//!   或留有空隙（间隙内的值被丢弃）。
//!
//! ## 状态机概要（How）
//! - 与边界窗口同构：值与计时事件物化进同一条 MPSC 队列，由排空循环串行
//!   消化；计时事件携带代号，节拍重置后旧代号的事件被忽略；
//! - 开窗需要外层需求，缺失即 `backpressure.missing` 级联终止；
//! - 引用计数与上游取消策略与边界窗口一致。

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::arbiter::SingleAssignmentArbiter;
use crate::demand::{Demand, UNBOUNDED};
use crate::disposable::SerialDisposable;
use crate::drain::DrainGate;
use crate::error::RillError;
use crate::protocol::{Disposable, Handle, HandleRef, Sink, SinkRef, validate_request};
use crate::queue::MpscLinkedQueue;
use crate::scheduler::{Scheduler, SchedulerRef, Worker};
use crate::stream::{Stream, StreamSource};
use crate::subject::UnicastSubject;

pub(crate) fn window_exact_unbounded<T: Send + 'static>(
    upstream: Stream<T>,
    timespan: Duration,
    scheduler: SchedulerRef,
) -> Stream<Stream<T>> {
    window_exact_bounded(upstream, timespan, scheduler, usize::MAX, false)
}

pub(crate) fn window_exact_bounded<T: Send + 'static>(
    upstream: Stream<T>,
    timespan: Duration,
    scheduler: SchedulerRef,
    max_size: usize,
    restart_timer_on_max_size: bool,
) -> Stream<Stream<T>> {
    Stream::new(WindowExactSource {
        upstream,
        timespan,
        scheduler,
        max_size: max_size.max(1),
        restart_timer_on_max_size,
    })
}

struct WindowExactSource<T> {
    upstream: Stream<T>,
    timespan: Duration,
    scheduler: SchedulerRef,
    max_size: usize,
    restart_timer_on_max_size: bool,
}

enum TimedEvent<T> {
    Value(T),
    Open,
    Tick(usize),
    CloseOldest,
}

impl<T: Send + 'static> StreamSource<Stream<T>> for WindowExactSource<T> {
    fn subscribe(&self, sink: SinkRef<Stream<T>>) {
        let main = Arc::new_cyclic(|this: &Weak<WindowExactSink<T>>| WindowExactSink {
            downstream: Arc::clone(&sink),
            timespan: self.timespan,
            max_size: self.max_size,
            restart_timer_on_max_size: self.restart_timer_on_max_size,
            worker: self.scheduler.create_worker(),
            queue: MpscLinkedQueue::new(),
            gate: DrainGate::new(),
            requested: Demand::new(),
            upstream: SingleAssignmentArbiter::new(),
            timer: SerialDisposable::new(),
            timer_generation: AtomicUsize::new(0),
            window: Mutex::new(None),
            fill: AtomicUsize::new(0),
            window_count: AtomicUsize::new(1),
            cancelled: AtomicBool::new(false),
            done: AtomicBool::new(false),
            error: Mutex::new(None),
            terminated: AtomicBool::new(false),
            this: this.clone(),
        });
        sink.on_subscribe(Arc::clone(&main) as HandleRef);
        main.queue.offer(TimedEvent::Open);
        main.drain();
        main.start_timer();
        self.upstream.subscribe(main as SinkRef<T>);
    }
}

struct WindowExactSink<T> {
    downstream: SinkRef<Stream<T>>,
    timespan: Duration,
    max_size: usize,
    restart_timer_on_max_size: bool,
    worker: Arc<dyn Worker>,
    queue: MpscLinkedQueue<TimedEvent<T>>,
    gate: DrainGate,
    requested: Demand,
    upstream: SingleAssignmentArbiter,
    timer: SerialDisposable,
    timer_generation: AtomicUsize,
    window: Mutex<Option<Arc<UnicastSubject<T>>>>,
    /// 当前窗口的已填充数量；仅排空者修改。
    fill: AtomicUsize,
    window_count: AtomicUsize,
    cancelled: AtomicBool,
    done: AtomicBool,
    error: Mutex<Option<RillError>>,
    terminated: AtomicBool,
    this: Weak<Self>,
}

impl<T: Send + 'static> WindowExactSink<T> {
    fn start_timer(&self) {
        let generation = self.timer_generation.load(Ordering::Acquire);
        let parent = self.this.clone();
        self.timer.set(self.worker.schedule_periodically(
            Arc::new(move || {
                if let Some(main) = parent.upgrade() {
                    main.queue.offer(TimedEvent::Tick(generation));
                    main.drain();
                }
            }),
            self.timespan,
            self.timespan,
        ));
    }

    fn restart_timer(&self) {
        self.timer_generation.fetch_add(1, Ordering::AcqRel);
        self.start_timer();
    }

    fn drain(&self) {
        if !self.gate.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            while let Some(event) = self.queue.poll() {
                match event {
                    TimedEvent::Value(value) => {
                        let window = self.window.lock().clone();
                        if let Some(window) = window {
                            window.on_next(value);
                            let fill = self.fill.fetch_add(1, Ordering::AcqRel) + 1;
                            if fill >= self.max_size {
                                self.rotate();
                                if self.restart_timer_on_max_size {
                                    self.restart_timer();
                                }
                            }
                        }
                    }
                    TimedEvent::Open => self.open_window(),
                    TimedEvent::Tick(generation) => {
                        if generation == self.timer_generation.load(Ordering::Acquire) {
                            self.rotate();
                        }
                    }
                    TimedEvent::CloseOldest => {}
                }
            }
            if self.done.load(Ordering::Acquire) && !self.terminated.swap(true, Ordering::AcqRel) {
                self.close_window();
                self.timer.dispose();
                self.worker.dispose();
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

    fn rotate(&self) {
        self.close_window();
        if !self.cancelled.load(Ordering::Acquire) && !self.done.load(Ordering::Acquire) {
            self.open_window();
        }
    }

    fn open_window(&self) {
        if self.cancelled.load(Ordering::Acquire) || self.terminated.load(Ordering::Acquire) {
            return;
        }
        if self.requested.current() == 0 {
            self.abort(RillError::missing_backpressure(
                "timed window emission without outer demand",
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
        self.fill.store(0, Ordering::Release);
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
        self.timer.dispose();
        self.worker.dispose();
        if let Some(window) = self.window.lock().take() {
            window.on_error(error.clone());
        }
        self.downstream.on_error(error);
    }

    fn window_terminated(&self) {
        if self.window_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.upstream.cancel();
            self.timer.dispose();
            self.worker.dispose();
        }
    }
}

impl<T: Send + 'static> Sink<T> for WindowExactSink<T> {
    fn on_subscribe(&self, handle: HandleRef) {
        if self.upstream.set(handle) {
            self.upstream.request(UNBOUNDED);
        }
    }

    fn on_next(&self, value: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        self.queue.offer(TimedEvent::Value(value));
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

impl<T: Send + 'static> Handle for WindowExactSink<T> {
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

// ---- 跨步窗口 ----

pub(crate) fn window_skip<T: Clone + Send + 'static>(
    upstream: Stream<T>,
    timespan: Duration,
    timeskip: Duration,
    scheduler: SchedulerRef,
) -> Stream<Stream<T>> {
    Stream::new(WindowSkipSource {
        upstream,
        timespan,
        timeskip,
        scheduler,
    })
}

struct WindowSkipSource<T> {
    upstream: Stream<T>,
    timespan: Duration,
    timeskip: Duration,
    scheduler: SchedulerRef,
}

impl<T: Clone + Send + 'static> StreamSource<Stream<T>> for WindowSkipSource<T> {
    fn subscribe(&self, sink: SinkRef<Stream<T>>) {
        let main = Arc::new_cyclic(|this: &Weak<WindowSkipSink<T>>| WindowSkipSink {
            downstream: Arc::clone(&sink),
            timespan: self.timespan,
            worker: self.scheduler.create_worker(),
            queue: MpscLinkedQueue::new(),
            gate: DrainGate::new(),
            requested: Demand::new(),
            upstream: SingleAssignmentArbiter::new(),
            windows: Mutex::new(VecDeque::new()),
            window_count: AtomicUsize::new(1),
            cancelled: AtomicBool::new(false),
            done: AtomicBool::new(false),
            error: Mutex::new(None),
            terminated: AtomicBool::new(false),
            this: this.clone(),
        });
        sink.on_subscribe(Arc::clone(&main) as HandleRef);
        main.queue.offer(TimedEvent::Open);
        main.drain();

        // 后续开窗按 timeskip 周期到来。
        let opener = main.this.clone();
        main.worker.schedule_periodically(
            Arc::new(move || {
                if let Some(main) = opener.upgrade() {
                    main.queue.offer(TimedEvent::Open);
                    main.drain();
                }
            }),
            self.timeskip,
            self.timeskip,
        );
        self.upstream.subscribe(main as SinkRef<T>);
    }
}

struct WindowSkipSink<T> {
    downstream: SinkRef<Stream<T>>,
    timespan: Duration,
    worker: Arc<dyn Worker>,
    queue: MpscLinkedQueue<TimedEvent<T>>,
    gate: DrainGate,
    requested: Demand,
    upstream: SingleAssignmentArbiter,
    /// 开启中的窗口按开启顺序排列；关窗总是关最老的。
    windows: Mutex<VecDeque<Arc<UnicastSubject<T>>>>,
    window_count: AtomicUsize,
    cancelled: AtomicBool,
    done: AtomicBool,
    error: Mutex<Option<RillError>>,
    terminated: AtomicBool,
    this: Weak<Self>,
}

impl<T: Clone + Send + 'static> WindowSkipSink<T> {
    fn drain(&self) {
        if !self.gate.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            while let Some(event) = self.queue.poll() {
                match event {
                    TimedEvent::Value(value) => {
                        // 重叠窗口：值进入所有开启中的窗口；间隙期（列表为空）丢弃。
                        let windows: Vec<_> =
                            self.windows.lock().iter().cloned().collect();
                        if let Some((last, rest)) = windows.split_last() {
                            for window in rest {
                                window.on_next(value.clone());
                            }
                            last.on_next(value);
                        }
                    }
                    TimedEvent::Open => self.open_window(),
                    TimedEvent::CloseOldest => {
                        let closed = self.windows.lock().pop_front();
                        if let Some(window) = closed {
                            window.on_complete();
                        }
                    }
                    TimedEvent::Tick(_) => {}
                }
            }
            if self.done.load(Ordering::Acquire) && !self.terminated.swap(true, Ordering::AcqRel) {
                let windows = std::mem::take(&mut *self.windows.lock());
                let error = self.error.lock().take();
                for window in &windows {
                    match &error {
                        Some(err) => window.on_error(err.clone()),
                        None => window.on_complete(),
                    }
                }
                self.worker.dispose();
                match error {
                    Some(err) => self.downstream.on_error(err),
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
        if self.cancelled.load(Ordering::Acquire)
            || self.terminated.load(Ordering::Acquire)
            || self.done.load(Ordering::Acquire)
        {
            return;
        }
        if self.requested.current() == 0 {
            self.abort(RillError::missing_backpressure(
                "skip window emission without outer demand",
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
        self.windows.lock().push_back(Arc::clone(&window));
        self.downstream.on_next(window.stream());
        self.requested.produced(1);

        // 本窗口在 timespan 后关闭；关闭事件与值共用串行化队列。
        let closer = self.this.clone();
        self.worker.schedule_delayed(
            Box::new(move || {
                if let Some(main) = closer.upgrade() {
                    main.queue.offer(TimedEvent::CloseOldest);
                    main.drain();
                }
            }),
            self.timespan,
        );
    }

    fn abort(&self, error: RillError) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.upstream.cancel();
        self.worker.dispose();
        let windows = std::mem::take(&mut *self.windows.lock());
        for window in windows {
            window.on_error(error.clone());
        }
        self.downstream.on_error(error);
    }

    fn window_terminated(&self) {
        if self.window_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.upstream.cancel();
            self.worker.dispose();
        }
    }
}

impl<T: Clone + Send + 'static> Sink<T> for WindowSkipSink<T> {
    fn on_subscribe(&self, handle: HandleRef) {
        if self.upstream.set(handle) {
            self.upstream.request(UNBOUNDED);
        }
    }

    fn on_next(&self, value: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        self.queue.offer(TimedEvent::Value(value));
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

impl<T: Clone + Send + 'static> Handle for WindowSkipSink<T> {
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
