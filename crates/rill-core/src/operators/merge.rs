//! 并发合并：流的流上的 `merge`。
//!
//! 外层按 `max_concurrency` 预取内层流；每条内层自带有界预取队列，
//! 值经快速路径（无争用且有需求时直发）或排空循环（轮询各内层队列）
//! 串行抵达下游。内层完成腾出一个并发槽位并向外层补一个需求。
//! 任一错误立即终止整体。

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::arbiter::SingleAssignmentArbiter;
use crate::demand::{Demand, UNBOUNDED};
use crate::drain::{DrainGate, SerializedSink};
use crate::error::RillError;
use crate::protocol::{Handle, HandleRef, Sink, SinkRef, validate_request};
use crate::queue::SpscArrayQueue;
use crate::stream::{Stream, StreamSource};

pub(crate) fn merge<T: Send + 'static>(
    upstream: Stream<Stream<T>>,
    max_concurrency: usize,
    buffer_size: usize,
) -> Stream<T> {
    Stream::new(MergeSource {
        upstream,
        max_concurrency: max_concurrency.max(1),
        buffer_size: buffer_size.max(1),
    })
}

struct MergeSource<T> {
    upstream: Stream<Stream<T>>,
    max_concurrency: usize,
    buffer_size: usize,
}

impl<T: Send + 'static> StreamSource<T> for MergeSource<T> {
    fn subscribe(&self, sink: SinkRef<T>) {
        let serialized = Arc::new(SerializedSink::new(sink));
        let merge = Arc::new_cyclic(|this: &Weak<MergeSink<T>>| MergeSink {
            downstream: serialized,
            max_concurrency: self.max_concurrency,
            buffer_size: self.buffer_size,
            upstream: SingleAssignmentArbiter::new(),
            inners: Mutex::new(Vec::new()),
            requested: Demand::new(),
            gate: DrainGate::new(),
            done: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            error: Mutex::new(None),
            this: this.clone(),
        });
        merge
            .downstream
            .downstream()
            .on_subscribe(Arc::clone(&merge) as HandleRef);
        self.upstream.subscribe(merge as SinkRef<Stream<T>>);
    }
}

struct MergeSink<T> {
    downstream: Arc<SerializedSink<T>>,
    max_concurrency: usize,
    buffer_size: usize,
    upstream: SingleAssignmentArbiter,
    inners: Mutex<Vec<Arc<MergeInner<T>>>>,
    requested: Demand,
    gate: DrainGate,
    done: AtomicBool,
    cancelled: AtomicBool,
    terminated: AtomicBool,
    error: Mutex<Option<RillError>>,
    this: Weak<Self>,
}

impl<T: Send + 'static> MergeSink<T> {
    /// 内层值到达：无争用且有需求时直发，否则入该内层的队列。
    fn inner_value(&self, inner: &MergeInner<T>, value: T) {
        if self.terminated.load(Ordering::Acquire) || self.cancelled.load(Ordering::Acquire) {
            return;
        }
        if self.gate.try_fast_path() {
            if self.requested.current() > 0 {
                self.downstream.on_next(value);
                self.requested.produced(1);
                inner.handle.request(1);
            } else {
                inner.queue.offer(value);
            }
            if self.gate.leave(1) == 0 {
                return;
            }
        } else {
            inner.queue.offer(value);
            if !self.gate.enter() {
                return;
            }
        }
        self.drain_loop();
    }

    fn drain(&self) {
        if self.gate.enter() {
            self.drain_loop();
        }
    }

    fn drain_loop(&self) {
        let mut missed = 1;
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                self.clear_all();
            } else if let Some(error) = self.error.lock().take() {
                self.clear_all();
                self.cancel_inners();
                self.upstream.cancel();
                if !self.terminated.swap(true, Ordering::AcqRel) {
                    self.downstream.on_error(error);
                }
            } else {
                // 轮询各内层队列，按下游需求搬运。
                let inners = self.inners.lock().clone();
                let mut progressed = true;
                while progressed && self.requested.current() > 0 {
                    progressed = false;
                    for inner in &inners {
                        if self.requested.current() == 0
                            || self.cancelled.load(Ordering::Acquire)
                        {
                            break;
                        }
                        if let Some(value) = inner.queue.poll() {
                            self.downstream.on_next(value);
                            self.requested.produced(1);
                            inner.handle.request(1);
                            progressed = true;
                        }
                    }
                }
                // 收割已完成且排空的内层，腾出并发槽位。
                let mut finished = Vec::new();
                {
                    let mut inners = self.inners.lock();
                    inners.retain(|inner| {
                        let dead =
                            inner.done.load(Ordering::Acquire) && inner.queue.is_empty();
                        if dead {
                            finished.push(Arc::clone(inner));
                        }
                        !dead
                    });
                }
                for _ in &finished {
                    self.upstream.request(1);
                }
                if self.done.load(Ordering::Acquire)
                    && self.inners.lock().is_empty()
                    && !self.cancelled.load(Ordering::Acquire)
                    && !self.terminated.swap(true, Ordering::AcqRel)
                {
                    self.downstream.on_complete();
                }
            }
            missed = self.gate.leave(missed);
            if missed == 0 {
                return;
            }
        }
    }

    fn clear_all(&self) {
        for inner in self.inners.lock().iter() {
            inner.queue.clear();
        }
    }

    fn cancel_inners(&self) {
        let inners = std::mem::take(&mut *self.inners.lock());
        for inner in inners {
            inner.handle.cancel();
        }
    }
}

impl<T: Send + 'static> Sink<Stream<T>> for MergeSink<T> {
    fn on_subscribe(&self, handle: HandleRef) {
        if self.upstream.set(handle) {
            let initial = if self.max_concurrency == usize::MAX {
                UNBOUNDED
            } else {
                self.max_concurrency as u64
            };
            self.upstream.request(initial);
        }
    }

    fn on_next(&self, stream: Stream<T>) {
        if self.done.load(Ordering::Acquire) || self.cancelled.load(Ordering::Acquire) {
            return;
        }
        let inner = Arc::new(MergeInner {
            parent: self.this.clone(),
            handle: SingleAssignmentArbiter::new(),
            queue: SpscArrayQueue::new(self.buffer_size),
            prefetch: self.buffer_size,
            done: AtomicBool::new(false),
        });
        self.inners.lock().push(Arc::clone(&inner));
        stream.subscribe(inner as SinkRef<T>);
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

impl<T: Send + 'static> Handle for MergeSink<T> {
    fn request(&self, n: u64) {
        if !validate_request(n) {
            return;
        }
        self.requested.add(n);
        self.drain();
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.upstream.cancel();
            self.cancel_inners();
            self.drain();
        }
    }
}

struct MergeInner<T> {
    parent: Weak<MergeSink<T>>,
    handle: SingleAssignmentArbiter,
    queue: SpscArrayQueue<T>,
    prefetch: usize,
    done: AtomicBool,
}

impl<T: Send + 'static> Sink<T> for MergeInner<T> {
    fn on_subscribe(&self, handle: HandleRef) {
        if self.handle.set(handle) {
            self.handle.request(self.prefetch as u64);
        }
    }

    fn on_next(&self, value: T) {
        if let Some(parent) = self.parent.upgrade() {
            parent.inner_value(self, value);
        }
    }

    fn on_error(&self, error: RillError) {
        if let Some(parent) = self.parent.upgrade() {
            *parent.error.lock() = Some(error);
            parent.drain();
        }
    }

    fn on_complete(&self) {
        self.done.store(true, Ordering::Release);
        if let Some(parent) = self.parent.upgrade() {
            parent.drain();
        }
    }
}
