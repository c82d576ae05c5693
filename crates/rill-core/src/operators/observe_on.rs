//! 线程切换：`observe_on`。
//!
//! 上游信号进入有界环形队列，Worker 上的排空循环按下游需求重放；
//! 预取量为缓冲容量，消费达到四分之三后成批向上游补充需求。
//! 队列溢出说明上游超发或时间型上游无法被拖慢，以 `backpressure.missing` 终止。

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::arbiter::SingleAssignmentArbiter;
use crate::demand::Demand;
use crate::drain::DrainGate;
use crate::error::RillError;
use crate::protocol::{Handle, HandleRef, Sink, SinkRef, validate_request};
use crate::queue::SpscArrayQueue;
use crate::scheduler::{Scheduler, SchedulerRef, Worker};
use crate::stream::{Stream, StreamSource};

pub(crate) fn observe_on<T: Send + 'static>(
    upstream: Stream<T>,
    scheduler: SchedulerRef,
    buffer_size: usize,
) -> Stream<T> {
    Stream::new(ObserveOnSource {
        upstream,
        scheduler,
        buffer_size: buffer_size.max(1),
    })
}

struct ObserveOnSource<T> {
    upstream: Stream<T>,
    scheduler: SchedulerRef,
    buffer_size: usize,
}

impl<T: Send + 'static> StreamSource<T> for ObserveOnSource<T> {
    fn subscribe(&self, sink: SinkRef<T>) {
        let prefetch = self.buffer_size;
        let observe = Arc::new_cyclic(|this: &Weak<ObserveOnSink<T>>| ObserveOnSink {
            downstream: Arc::clone(&sink),
            worker: self.scheduler.create_worker(),
            queue: SpscArrayQueue::new(prefetch),
            gate: DrainGate::new(),
            requested: Demand::new(),
            upstream: SingleAssignmentArbiter::new(),
            prefetch,
            limit: prefetch - (prefetch >> 2),
            consumed: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
            done: AtomicBool::new(false),
            error: Mutex::new(None),
            terminated: AtomicBool::new(false),
            this: this.clone(),
        });
        sink.on_subscribe(Arc::clone(&observe) as HandleRef);
        self.upstream.subscribe(observe as SinkRef<T>);
    }
}

struct ObserveOnSink<T> {
    downstream: SinkRef<T>,
    worker: Arc<dyn Worker>,
    queue: SpscArrayQueue<T>,
    gate: DrainGate,
    requested: Demand,
    upstream: SingleAssignmentArbiter,
    prefetch: usize,
    /// 补充阈值：消费到该数量即向上游追加同量需求。
    limit: usize,
    consumed: AtomicUsize,
    cancelled: AtomicBool,
    done: AtomicBool,
    error: Mutex<Option<RillError>>,
    terminated: AtomicBool,
    this: Weak<Self>,
}

impl<T: Send + 'static> ObserveOnSink<T> {
    fn schedule_drain(&self) {
        if self.gate.enter() {
            if let Some(this) = self.this.upgrade() {
                self.worker.schedule(Box::new(move || this.drain()));
            }
        }
    }

    fn drain(&self) {
        let mut missed = 1;
        loop {
            let requested = self.requested.current();
            let mut emitted = 0u64;
            while emitted < requested {
                if self.cancelled.load(Ordering::Acquire) {
                    self.queue.clear();
                    break;
                }
                let done = self.done.load(Ordering::Acquire);
                match self.queue.poll() {
                    Some(value) => {
                        self.downstream.on_next(value);
                        emitted += 1;
                        let consumed = self.consumed.fetch_add(1, Ordering::AcqRel) + 1;
                        if consumed >= self.limit {
                            self.consumed.store(0, Ordering::Release);
                            self.upstream.request(consumed as u64);
                        }
                    }
                    None => {
                        if done {
                            self.terminate();
                        }
                        break;
                    }
                }
            }
            if emitted > 0 {
                self.requested.produced(emitted);
            }
            if self.done.load(Ordering::Acquire)
                && self.queue.is_empty()
                && !self.cancelled.load(Ordering::Acquire)
            {
                self.terminate();
            }
            missed = self.gate.leave(missed);
            if missed == 0 {
                return;
            }
        }
    }

    fn terminate(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        match self.error.lock().take() {
            Some(error) => self.downstream.on_error(error),
            None => self.downstream.on_complete(),
        }
        self.worker.dispose();
    }
}

impl<T: Send + 'static> Sink<T> for ObserveOnSink<T> {
    fn on_subscribe(&self, handle: HandleRef) {
        if self.upstream.set(handle) {
            self.upstream.request(self.prefetch as u64);
        }
    }

    fn on_next(&self, value: T) {
        if self.done.load(Ordering::Acquire) || self.cancelled.load(Ordering::Acquire) {
            return;
        }
        if !self.queue.offer(value) {
            self.upstream.cancel();
            self.on_error(RillError::missing_backpressure(
                "observe_on buffer overflow",
            ));
            return;
        }
        self.schedule_drain();
    }

    fn on_error(&self, error: RillError) {
        if self.done.swap(true, Ordering::AcqRel) {
            crate::hook::on_error(error);
            return;
        }
        *self.error.lock() = Some(error);
        self.schedule_drain();
    }

    fn on_complete(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.schedule_drain();
        }
    }
}

impl<T: Send + 'static> Handle for ObserveOnSink<T> {
    fn request(&self, n: u64) {
        if !validate_request(n) {
            return;
        }
        self.requested.add(n);
        self.schedule_drain();
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.upstream.cancel();
            self.worker.dispose();
            self.schedule_drain();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::computation;
    use crate::testkit::TestSink;
    use std::time::Duration;

    /// 全量值换线程后保序到达并完成。
    #[test]
    fn delivers_in_order_on_worker_thread() {
        let sink = TestSink::unbounded();
        Stream::range(1, 100)
            .observe_on(computation())
            .subscribe(sink.clone());
        assert!(sink.await_terminal(Duration::from_secs(5)), "必须在限期内完成");
        sink.assert_values(&(1..=100).collect::<Vec<i64>>());
        sink.assert_completed();
        sink.assert_protocol_clean();
    }

    /// 有限需求下只发射请求量，余量在补充需求后继续。
    #[test]
    fn honors_downstream_demand_across_threads() {
        let sink = TestSink::with_request(10);
        Stream::range(1, 50)
            .observe_on(computation())
            .subscribe(sink.clone());
        assert!(sink.await_count(10, Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(sink.value_count(), 10, "未请求的值不得发射");
        sink.request(crate::demand::UNBOUNDED);
        assert!(sink.await_terminal(Duration::from_secs(5)));
        sink.assert_values(&(1..=50).collect::<Vec<i64>>());
    }

    /// 小缓冲跨越多轮补充仍不丢值。
    #[test]
    fn small_buffer_replenishes() {
        let sink = TestSink::unbounded();
        Stream::range(1, 1_000)
            .observe_on_with(computation(), 8)
            .subscribe(sink.clone());
        assert!(sink.await_terminal(Duration::from_secs(10)));
        sink.assert_values(&(1..=1_000).collect::<Vec<i64>>());
        sink.assert_completed();
    }
}
