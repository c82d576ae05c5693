//! 错误恢复：`retry(n)` 与 `on_error_resume_next`。
//!
//! 两者都经串行仲裁器切换上游：重订阅时前任句柄被取消，下游尚未消费的
//! 需求转移到新任。重订阅环以 WIP 计数抑制同步源引发的递归。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::arbiter::SerialArbiter;
use crate::drain::DrainGate;
use crate::error::RillError;
use crate::protocol::{Handle, HandleRef, Sink, SinkRef};
use crate::stream::{Stream, StreamSource};

pub(crate) fn retry<T: Send + 'static>(upstream: Stream<T>, times: u64) -> Stream<T> {
    Stream::new(RetrySource { upstream, times })
}

struct RetrySource<T> {
    upstream: Stream<T>,
    times: u64,
}

impl<T: Send + 'static> StreamSource<T> for RetrySource<T> {
    fn subscribe(&self, sink: SinkRef<T>) {
        let retry = Arc::new_cyclic(|this: &std::sync::Weak<RetrySink<T>>| RetrySink {
            downstream: Arc::clone(&sink),
            source: self.upstream.clone(),
            arbiter: SerialArbiter::new(),
            remaining: AtomicU64::new(self.times),
            resubscribe: DrainGate::new(),
            done: AtomicBool::new(false),
            this: this.clone(),
        });
        let handle = Arc::new(RetryHandle {
            sink: Arc::clone(&retry),
        });
        sink.on_subscribe(handle as HandleRef);
        retry.subscribe_next();
    }
}

struct RetrySink<T> {
    downstream: SinkRef<T>,
    source: Stream<T>,
    arbiter: SerialArbiter,
    remaining: AtomicU64,
    /// 重订阅环的 WIP：同步失败的源在循环里重试而非递归。
    resubscribe: DrainGate,
    done: AtomicBool,
    this: std::sync::Weak<Self>,
}

impl<T: Send + 'static> RetrySink<T> {
    fn subscribe_next(&self) {
        if !self.resubscribe.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            if !self.arbiter.is_cancelled() && !self.done.load(Ordering::Acquire) {
                if let Some(this) = self.this.upgrade() {
                    self.source.subscribe(this as SinkRef<T>);
                }
            }
            missed = self.resubscribe.leave(missed);
            if missed == 0 {
                return;
            }
        }
    }
}

impl<T: Send + 'static> Sink<T> for RetrySink<T> {
    fn on_subscribe(&self, handle: HandleRef) {
        self.arbiter.set(handle);
    }

    fn on_next(&self, value: T) {
        if !self.done.load(Ordering::Acquire) {
            self.arbiter.produced(1);
            self.downstream.on_next(value);
        }
    }

    fn on_error(&self, error: RillError) {
        if self.done.load(Ordering::Acquire) {
            crate::hook::on_error(error);
            return;
        }
        if error.is_fatal() {
            self.done.store(true, Ordering::Release);
            self.downstream.on_error(error);
            return;
        }
        let mut remaining = self.remaining.load(Ordering::Acquire);
        loop {
            if remaining == 0 {
                if !self.done.swap(true, Ordering::AcqRel) {
                    self.downstream.on_error(error);
                }
                return;
            }
            match self.remaining.compare_exchange_weak(
                remaining,
                remaining - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => remaining = observed,
            }
        }
        self.subscribe_next();
    }

    fn on_complete(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.downstream.on_complete();
        }
    }
}

struct RetryHandle<T> {
    sink: Arc<RetrySink<T>>,
}

impl<T: Send + 'static> Handle for RetryHandle<T> {
    fn request(&self, n: u64) {
        self.sink.arbiter.request(n);
    }

    fn cancel(&self) {
        self.sink.done.store(true, Ordering::Release);
        self.sink.arbiter.cancel();
    }
}

// ---- on_error_resume_next ----

type ResumeFn<T> = Arc<dyn Fn(&RillError) -> Stream<T> + Send + Sync>;

pub(crate) fn on_error_resume_next<T: Send + 'static>(
    upstream: Stream<T>,
    resume: ResumeFn<T>,
) -> Stream<T> {
    Stream::new(ResumeNextSource { upstream, resume })
}

struct ResumeNextSource<T> {
    upstream: Stream<T>,
    resume: ResumeFn<T>,
}

impl<T: Send + 'static> StreamSource<T> for ResumeNextSource<T> {
    fn subscribe(&self, sink: SinkRef<T>) {
        let resume = Arc::new_cyclic(|this: &std::sync::Weak<ResumeNextSink<T>>| ResumeNextSink {
            downstream: Arc::clone(&sink),
            resume: Arc::clone(&self.resume),
            arbiter: SerialArbiter::new(),
            switched: AtomicBool::new(false),
            done: AtomicBool::new(false),
            this: this.clone(),
        });
        let handle = Arc::new(ResumeHandle {
            sink: Arc::clone(&resume),
        });
        sink.on_subscribe(handle as HandleRef);
        self.upstream.subscribe(resume as SinkRef<T>);
    }
}

struct ResumeNextSink<T> {
    downstream: SinkRef<T>,
    resume: ResumeFn<T>,
    arbiter: SerialArbiter,
    switched: AtomicBool,
    done: AtomicBool,
    this: std::sync::Weak<Self>,
}

impl<T: Send + 'static> Sink<T> for ResumeNextSink<T> {
    fn on_subscribe(&self, handle: HandleRef) {
        self.arbiter.set(handle);
    }

    fn on_next(&self, value: T) {
        if !self.done.load(Ordering::Acquire) {
            self.arbiter.produced(1);
            self.downstream.on_next(value);
        }
    }

    fn on_error(&self, error: RillError) {
        if self.done.load(Ordering::Acquire) {
            crate::hook::on_error(error);
            return;
        }
        if error.is_fatal() || self.switched.swap(true, Ordering::AcqRel) {
            // 回退流自身再失败：按原样传播。
            if !self.done.swap(true, Ordering::AcqRel) {
                self.downstream.on_error(error);
            }
            return;
        }
        let fallback = (self.resume)(&error);
        if let Some(this) = self.this.upgrade() {
            fallback.subscribe(this as SinkRef<T>);
        }
    }

    fn on_complete(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.downstream.on_complete();
        }
    }
}

struct ResumeHandle<T> {
    sink: Arc<ResumeNextSink<T>>,
}

impl<T: Send + 'static> Handle for ResumeHandle<T> {
    fn request(&self, n: u64) {
        self.sink.arbiter.request(n);
    }

    fn cancel(&self) {
        self.sink.done.store(true, Ordering::Release);
        self.sink.arbiter.cancel();
    }
}
