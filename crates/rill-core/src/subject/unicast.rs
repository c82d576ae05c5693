//! 单订阅者缓冲主体。
//!
//! ## 设计背景（Why）
//! - `window` 与 `group_by` 需要一个“先缓冲、后交接”的内部流：值可能在
//!   订阅者出现之前到达，订阅者出现后按其需求排空积压。
//!
//! ## 契约说明（What）
//! - 恰好接受一个订阅者；第二个订阅者收到 `subject.already_subscribed` 错误；
//! - 终止回调（`on_terminate`）在终止信号或订阅者取消时恰好触发一次，
//!   父操作符以此维护引用计数；
//! - 信号端要求串行投递；订阅、请求与取消可从任意线程发起。

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::demand::Demand;
use crate::drain::DrainGate;
use crate::error::{RillError, codes};
use crate::hook;
use crate::protocol::{Handle, HandleRef, NoopHandle, SinkRef, validate_request};
use crate::queue::MpscLinkedQueue;
use crate::stream::{Stream, StreamSource};

/// 终止回调。
type TerminateHook = Box<dyn FnOnce() + Send>;

pub struct UnicastSubject<T> {
    queue: MpscLinkedQueue<T>,
    gate: DrainGate,
    requested: Demand,
    downstream: Mutex<Option<SinkRef<T>>>,
    once: AtomicBool,
    cancelled: AtomicBool,
    done: AtomicBool,
    error: Mutex<Option<RillError>>,
    terminated_out: AtomicBool,
    on_terminate: Mutex<Option<TerminateHook>>,
    this: Weak<Self>,
}

impl<T: Send + 'static> UnicastSubject<T> {
    pub fn new() -> Arc<Self> {
        Self::build(None)
    }

    /// 附带终止回调的构造；回调在终止或取消时恰好执行一次。
    pub fn with_on_terminate(hook: impl FnOnce() + Send + 'static) -> Arc<Self> {
        Self::build(Some(Box::new(hook)))
    }

    fn build(hook: Option<TerminateHook>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            queue: MpscLinkedQueue::new(),
            gate: DrainGate::new(),
            requested: Demand::new(),
            downstream: Mutex::new(None),
            once: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            done: AtomicBool::new(false),
            error: Mutex::new(None),
            terminated_out: AtomicBool::new(false),
            on_terminate: Mutex::new(hook),
            this: this.clone(),
        })
    }

    /// 以流视图暴露本主体。
    pub fn stream(&self) -> Stream<T> {
        let this = self.this.upgrade().expect("主体存活期内 Weak 必然可升级");
        Stream::from_source(this)
    }

    pub fn on_next(&self, value: T) {
        if self.done.load(Ordering::Acquire) || self.cancelled.load(Ordering::Acquire) {
            return;
        }
        self.queue.offer(value);
        self.drain();
    }

    pub fn on_error(&self, error: RillError) {
        if self.done.swap(true, Ordering::AcqRel) || self.cancelled.load(Ordering::Acquire) {
            hook::on_error(error);
            return;
        }
        *self.error.lock() = Some(error);
        self.fire_terminate();
        self.drain();
    }

    pub fn on_complete(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        self.fire_terminate();
        self.drain();
    }

    /// 是否已被订阅者取消。
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn fire_terminate(&self) {
        if let Some(hook) = self.on_terminate.lock().take() {
            hook();
        }
    }

    fn cancel_by_subscriber(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.downstream.lock().take();
        self.fire_terminate();
        // 由当前（或下一个）排空者清理积压。
        if self.gate.enter() {
            self.drain_loop();
        }
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
                self.queue.clear();
            } else if let Some(downstream) = self.downstream.lock().clone() {
                let requested = self.requested.current();
                let mut emitted = 0u64;
                while emitted < requested {
                    if self.cancelled.load(Ordering::Acquire) {
                        break;
                    }
                    match self.queue.poll() {
                        Some(value) => {
                            downstream.on_next(value);
                            emitted += 1;
                        }
                        None => break,
                    }
                }
                if emitted > 0 {
                    self.requested.produced(emitted);
                }
                if self.done.load(Ordering::Acquire)
                    && self.queue.is_empty()
                    && !self.cancelled.load(Ordering::Acquire)
                    && !self.terminated_out.swap(true, Ordering::AcqRel)
                {
                    match self.error.lock().take() {
                        Some(error) => downstream.on_error(error),
                        None => downstream.on_complete(),
                    }
                }
            }
            missed = self.gate.leave(missed);
            if missed == 0 {
                return;
            }
        }
    }
}

impl<T: Send + 'static> StreamSource<T> for UnicastSubject<T> {
    fn subscribe(&self, sink: SinkRef<T>) {
        if self.once.swap(true, Ordering::AcqRel) {
            sink.on_subscribe(NoopHandle::shared());
            sink.on_error(RillError::operator(
                codes::SUBJECT_ALREADY_SUBSCRIBED,
                "unicast subject accepts exactly one subscriber",
            ));
            return;
        }
        *self.downstream.lock() = Some(Arc::clone(&sink));
        let this = self.this.upgrade().expect("主体存活期内 Weak 必然可升级");
        sink.on_subscribe(Arc::new(UnicastHandle { subject: this }) as HandleRef);
        self.drain();
    }
}

struct UnicastHandle<T> {
    subject: Arc<UnicastSubject<T>>,
}

impl<T: Send + 'static> Handle for UnicastHandle<T> {
    fn request(&self, n: u64) {
        if !validate_request(n) {
            return;
        }
        self.subject.requested.add(n);
        self.subject.drain();
    }

    fn cancel(&self) {
        self.subject.cancel_by_subscriber();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::TestSink;
    use std::sync::atomic::AtomicUsize;

    /// 订阅前的积压在订阅后按需求排空。
    #[test]
    fn buffers_until_subscriber_arrives() {
        let subject = UnicastSubject::new();
        subject.on_next(1);
        subject.on_next(2);
        subject.on_complete();

        let sink = TestSink::with_request(1);
        subject.stream().subscribe(sink.clone());
        sink.assert_values(&[1]);
        sink.request(10);
        sink.assert_values(&[1, 2]);
        sink.assert_completed();
    }

    /// 第二个订阅者必须收到 already_subscribed 错误。
    #[test]
    fn second_subscriber_is_rejected() {
        let subject = UnicastSubject::<i32>::new();
        let first = TestSink::unbounded();
        let second = TestSink::unbounded();
        subject.stream().subscribe(first.clone());
        subject.stream().subscribe(second.clone());
        second.assert_error_code(codes::SUBJECT_ALREADY_SUBSCRIBED);
        subject.on_next(5);
        subject.on_complete();
        first.assert_values(&[5]);
        first.assert_completed();
    }

    /// 终止回调在完成或取消路径上均恰好触发一次。
    #[test]
    fn terminate_hook_fires_exactly_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let subject = UnicastSubject::<i32>::with_on_terminate(move || {
            counter.fetch_add(1, Ordering::AcqRel);
        });
        subject.on_complete();
        subject.on_complete();
        assert_eq!(hits.load(Ordering::Acquire), 1, "完成路径只触发一次");

        let hits2 = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits2);
        let subject2 = UnicastSubject::<i32>::with_on_terminate(move || {
            counter.fetch_add(1, Ordering::AcqRel);
        });
        let sink = TestSink::unbounded();
        subject2.stream().subscribe(sink.clone());
        sink.cancel();
        assert_eq!(hits2.load(Ordering::Acquire), 1, "取消路径只触发一次");
        assert!(subject2.is_cancelled());
    }
}
