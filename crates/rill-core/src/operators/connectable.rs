//! 可连接流：`publish` / `ref_count` / `auto_connect`。
//!
//! ## 状态机概要（How）
//! - 枢纽持有“当前连接”；`connect` 对每代连接只触发一次上游订阅，
//!   连接句柄释放即废弃该代，下一次 `connect` 从头开始；
//! - 连接内部：有界预取队列 + 排空门闩；按最慢订阅者的需求对全体
//!   锁步多播，发射多少向上游补多少；
//! - 订阅走重试环：命中已终止/已废弃的连接就换新连接重试，
//!   订阅者绝不会挂在一个已关闭的枢纽上；
//! - `ref_count`：订阅数 0→1 触发连接，1→0 释放连接；
//!   `auto_connect(n)`：第 n 个订阅者到达时连接，此后不自动断开。

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::arbiter::SingleAssignmentArbiter;
use crate::demand::Demand;
use crate::disposable::FnDisposable;
use crate::drain::DrainGate;
use crate::error::RillError;
use crate::protocol::{
    Disposable, DisposableRef, Handle, HandleRef, Sink, SinkRef, validate_request,
};
use crate::queue::SpscArrayQueue;
use crate::stream::{Stream, StreamSource};

pub(crate) fn publish<T: Clone + Send + Sync + 'static>(
    upstream: Stream<T>,
    buffer_size: usize,
) -> ConnectableStream<T> {
    ConnectableStream {
        hub: PublishHub::new(upstream, buffer_size.max(1)),
    }
}

/// 可连接流：订阅与连接解耦的多播枢纽。
pub struct ConnectableStream<T> {
    hub: Arc<PublishHub<T>>,
}

impl<T: Clone + Send + Sync + 'static> ConnectableStream<T> {
    /// 触发（或复用）对上游的订阅；释放返回句柄则废弃本代连接。
    pub fn connect(&self) -> DisposableRef {
        self.hub.connect()
    }

    /// 不触发连接的订阅视图。
    pub fn stream(&self) -> Stream<T> {
        Stream::from_source(Arc::clone(&self.hub) as Arc<dyn StreamSource<T>>)
    }

    /// 订阅数 0→1 连接、1→0 断开的自动管理视图。
    pub fn ref_count(&self) -> Stream<T> {
        Stream::new(RefCountSource {
            hub: Arc::clone(&self.hub),
            state: Arc::new(Mutex::new(RefCountState {
                count: 0,
                connection: None,
            })),
        })
    }

    /// 第 `subscribers` 个订阅者到达时连接；此后不自动断开。
    pub fn auto_connect(&self, subscribers: usize) -> Stream<T> {
        Stream::new(AutoConnectSource {
            hub: Arc::clone(&self.hub),
            remaining: AtomicUsize::new(subscribers.max(1)),
        })
    }
}

struct PublishHub<T> {
    source: Stream<T>,
    buffer_size: usize,
    current: Mutex<Option<Arc<PublishConnection<T>>>>,
    this: Weak<Self>,
}

impl<T: Clone + Send + Sync + 'static> PublishHub<T> {
    fn new(source: Stream<T>, buffer_size: usize) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            source,
            buffer_size,
            current: Mutex::new(None),
            this: this.clone(),
        })
    }

    fn current_or_fresh(&self) -> Arc<PublishConnection<T>> {
        let mut current = self.current.lock();
        match &*current {
            Some(connection) if !connection.is_dead() => Arc::clone(connection),
            _ => {
                let fresh = PublishConnection::new(self.this.clone(), self.buffer_size);
                *current = Some(Arc::clone(&fresh));
                fresh
            }
        }
    }

    fn connect(&self) -> DisposableRef {
        let connection = self.current_or_fresh();
        if !connection.connected.swap(true, Ordering::AcqRel) {
            self.source
                .subscribe(Arc::clone(&connection) as SinkRef<T>);
        }
        let handle = Arc::clone(&connection);
        FnDisposable::shared(move || handle.shutdown())
    }

    fn drop_connection(&self, stale: &Arc<PublishConnection<T>>) {
        let mut current = self.current.lock();
        if let Some(existing) = &*current {
            if Arc::ptr_eq(existing, stale) {
                *current = None;
            }
        }
    }
}

impl<T: Clone + Send + Sync + 'static> StreamSource<T> for PublishHub<T> {
    fn subscribe(&self, sink: SinkRef<T>) {
        // 订阅重试环：绝不把订阅者留在已关闭的连接上。
        loop {
            let connection = self.current_or_fresh();
            let slot = Arc::new(PubSlot {
                downstream: Arc::clone(&sink),
                requested: Demand::new(),
                cancelled: AtomicBool::new(false),
                connection: Arc::downgrade(&connection),
            });
            match connection.try_add(&slot) {
                AddOutcome::Added => {
                    sink.on_subscribe(slot as HandleRef);
                    connection.drain();
                    return;
                }
                AddOutcome::Terminal(error) => {
                    sink.on_subscribe(slot as HandleRef);
                    match error {
                        Some(error) => sink.on_error(error),
                        None => sink.on_complete(),
                    }
                    return;
                }
                AddOutcome::Retry => {
                    self.drop_connection(&connection);
                }
            }
        }
    }
}

enum AddOutcome {
    Added,
    Terminal(Option<RillError>),
    Retry,
}

enum ConnState<T> {
    Open(Vec<Arc<PubSlot<T>>>),
    Terminated(Option<RillError>),
    /// 连接句柄被释放：既有订阅者已收尾，新订阅者必须换代重试。
    Abandoned,
}

struct PublishConnection<T> {
    hub: Weak<PublishHub<T>>,
    queue: SpscArrayQueue<T>,
    gate: DrainGate,
    upstream: SingleAssignmentArbiter,
    connected: AtomicBool,
    prefetch: usize,
    state: Mutex<ConnState<T>>,
    done: AtomicBool,
    error: Mutex<Option<RillError>>,
}

impl<T: Clone + Send + Sync + 'static> PublishConnection<T> {
    fn new(hub: Weak<PublishHub<T>>, buffer_size: usize) -> Arc<Self> {
        Arc::new(Self {
            hub,
            queue: SpscArrayQueue::new(buffer_size),
            gate: DrainGate::new(),
            upstream: SingleAssignmentArbiter::new(),
            connected: AtomicBool::new(false),
            prefetch: buffer_size,
            state: Mutex::new(ConnState::Open(Vec::new())),
            done: AtomicBool::new(false),
            error: Mutex::new(None),
        })
    }

    fn is_dead(&self) -> bool {
        matches!(*self.state.lock(), ConnState::Abandoned)
    }

    fn try_add(&self, slot: &Arc<PubSlot<T>>) -> AddOutcome {
        let mut state = self.state.lock();
        match &mut *state {
            ConnState::Open(slots) => {
                slots.push(Arc::clone(slot));
                AddOutcome::Added
            }
            ConnState::Terminated(error) => AddOutcome::Terminal(error.clone()),
            ConnState::Abandoned => AddOutcome::Retry,
        }
    }

    fn remove(&self, target: &PubSlot<T>) {
        let mut state = self.state.lock();
        if let ConnState::Open(slots) = &mut *state {
            slots.retain(|slot| !std::ptr::eq(Arc::as_ref(slot), target));
        }
    }

    fn snapshot(&self) -> Option<Vec<Arc<PubSlot<T>>>> {
        match &*self.state.lock() {
            ConnState::Open(slots) => Some(slots.clone()),
            _ => None,
        }
    }

    /// 连接句柄释放：废弃本代，既有订阅者收到完成。
    fn shutdown(&self) {
        self.upstream.cancel();
        let slots = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, ConnState::Abandoned) {
                ConnState::Open(slots) => slots,
                _ => Vec::new(),
            }
        };
        if let Some(hub) = self.hub.upgrade() {
            let mut current = hub.current.lock();
            if let Some(existing) = &*current {
                if std::ptr::eq(Arc::as_ref(existing), self) {
                    *current = None;
                }
            }
        }
        for slot in slots {
            if !slot.cancelled.swap(true, Ordering::AcqRel) {
                slot.downstream.on_complete();
            }
        }
        self.queue.clear();
    }

    fn drain(&self) {
        if !self.gate.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            if let Some(slots) = self.snapshot() {
                if !slots.is_empty() {
                    let quota = slots
                        .iter()
                        .map(|slot| slot.requested.current())
                        .min()
                        .unwrap_or(0);
                    let mut emitted = 0u64;
                    while emitted < quota {
                        match self.queue.poll() {
                            Some(value) => {
                                for slot in &slots {
                                    if !slot.cancelled.load(Ordering::Acquire) {
                                        slot.downstream.on_next(value.clone());
                                    }
                                }
                                emitted += 1;
                            }
                            None => break,
                        }
                    }
                    if emitted > 0 {
                        for slot in &slots {
                            slot.requested.produced(emitted);
                        }
                        self.upstream.request(emitted);
                    }
                }
                if self.done.load(Ordering::Acquire) && self.queue.is_empty() {
                    let error = self.error.lock().take();
                    let slots = {
                        let mut state = self.state.lock();
                        match std::mem::replace(
                            &mut *state,
                            ConnState::Terminated(error.clone()),
                        ) {
                            ConnState::Open(slots) => slots,
                            _ => Vec::new(),
                        }
                    };
                    if let Some(hub) = self.hub.upgrade() {
                        let mut current = hub.current.lock();
                        if let Some(existing) = &*current {
                            if std::ptr::eq(Arc::as_ref(existing), self) {
                                *current = None;
                            }
                        }
                    }
                    for slot in slots {
                        if !slot.cancelled.swap(true, Ordering::AcqRel) {
                            match &error {
                                Some(err) => slot.downstream.on_error(err.clone()),
                                None => slot.downstream.on_complete(),
                            }
                        }
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

impl<T: Clone + Send + Sync + 'static> Sink<T> for PublishConnection<T> {
    fn on_subscribe(&self, handle: HandleRef) {
        if self.upstream.set(handle) {
            self.upstream.request(self.prefetch as u64);
        }
    }

    fn on_next(&self, value: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        if !self.queue.offer(value) {
            self.upstream.cancel();
            self.on_error(RillError::missing_backpressure(
                "publish hub prefetch overflow",
            ));
            return;
        }
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

struct PubSlot<T> {
    downstream: SinkRef<T>,
    requested: Demand,
    cancelled: AtomicBool,
    connection: Weak<PublishConnection<T>>,
}

impl<T: Clone + Send + Sync + 'static> Handle for PubSlot<T> {
    fn request(&self, n: u64) {
        if !validate_request(n) {
            return;
        }
        self.requested.add(n);
        if let Some(connection) = self.connection.upgrade() {
            connection.drain();
        }
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            if let Some(connection) = self.connection.upgrade() {
                connection.remove(self);
                connection.drain();
            }
        }
    }
}

// ---- ref_count ----

struct RefCountState {
    count: usize,
    connection: Option<DisposableRef>,
}

struct RefCountSource<T> {
    hub: Arc<PublishHub<T>>,
    state: Arc<Mutex<RefCountState>>,
}

impl<T: Clone + Send + Sync + 'static> StreamSource<T> for RefCountSource<T> {
    fn subscribe(&self, sink: SinkRef<T>) {
        let wrapper = Arc::new_cyclic(|this: &Weak<RefCountSink<T>>| RefCountSink {
            downstream: sink,
            upstream: SingleAssignmentArbiter::new(),
            state: Arc::clone(&self.state),
            released: AtomicBool::new(false),
            this: this.clone(),
        });
        self.hub.subscribe(Arc::clone(&wrapper) as SinkRef<T>);

        let connect_now = {
            let mut state = self.state.lock();
            state.count += 1;
            state.count == 1
        };
        if connect_now {
            let connection = self.hub.connect();
            self.state.lock().connection = Some(connection);
        }
    }
}

struct RefCountSink<T> {
    downstream: SinkRef<T>,
    upstream: SingleAssignmentArbiter,
    state: Arc<Mutex<RefCountState>>,
    released: AtomicBool,
    this: Weak<Self>,
}

impl<T: Clone + Send + Sync + 'static> RefCountSink<T> {
    /// 订阅者退场（取消或终止）：计数 1→0 时释放连接。
    fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let disconnect = {
            let mut state = self.state.lock();
            state.count = state.count.saturating_sub(1);
            if state.count == 0 {
                state.connection.take()
            } else {
                None
            }
        };
        if let Some(connection) = disconnect {
            connection.dispose();
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Sink<T> for RefCountSink<T> {
    fn on_subscribe(&self, handle: HandleRef) {
        if self.upstream.set(handle) {
            self.downstream.on_subscribe(Arc::new(RefCountHandle {
                sink: self.this.clone(),
            }) as HandleRef);
        }
    }

    fn on_next(&self, value: T) {
        self.downstream.on_next(value);
    }

    fn on_error(&self, error: RillError) {
        self.downstream.on_error(error);
        self.release();
    }

    fn on_complete(&self) {
        self.downstream.on_complete();
        self.release();
    }
}

struct RefCountHandle<T> {
    sink: Weak<RefCountSink<T>>,
}

impl<T: Clone + Send + Sync + 'static> Handle for RefCountHandle<T> {
    fn request(&self, n: u64) {
        if let Some(sink) = self.sink.upgrade() {
            sink.upstream.request(n);
        }
    }

    fn cancel(&self) {
        if let Some(sink) = self.sink.upgrade() {
            sink.upstream.cancel();
            sink.release();
        }
    }
}

// ---- auto_connect ----

struct AutoConnectSource<T> {
    hub: Arc<PublishHub<T>>,
    remaining: AtomicUsize,
}

impl<T: Clone + Send + Sync + 'static> StreamSource<T> for AutoConnectSource<T> {
    fn subscribe(&self, sink: SinkRef<T>) {
        self.hub.subscribe(sink);
        let triggered = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map(|previous| previous == 1)
            .unwrap_or(false);
        if triggered {
            // 连接触发后不再自动断开；句柄由枢纽一代持有。
            let _ = self.hub.connect();
        }
    }
}
