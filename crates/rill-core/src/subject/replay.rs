//! 重放主体：带历史缓存的多播。
//!
//! ## 契约说明（What）
//! - 缓存策略三选一：无界 / 定量（保留最近 N 个）/ 定时（保留
//!   `max_age` 之内的值，时间取调度器时钟）；
//! - 晚到订阅者先按自身需求补课历史，再与实时发射汇合；终止信号
//!   在历史耗尽后送达；
//! - 每个订阅者独立排空（各自的 WIP 门闩），慢订阅者不阻塞快订阅者。

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::demand::Demand;
use crate::drain::DrainGate;
use crate::error::RillError;
use crate::hook;
use crate::protocol::{Handle, HandleRef, SinkRef, validate_request};
use crate::scheduler::{Scheduler, SchedulerRef};
use crate::stream::{Stream, StreamSource};

enum ReplayPolicy {
    Unbounded,
    Size(usize),
    Time { max_age: Duration, scheduler: SchedulerRef },
}

struct ReplayBuffer<T> {
    /// `items[0]` 的绝对序号；裁剪只前移序号，不改变既有值的编号。
    head_index: usize,
    items: VecDeque<(Duration, T)>,
    /// `Some(None)` 完成，`Some(Some(e))` 出错。
    terminal: Option<Option<RillError>>,
}

impl<T> ReplayBuffer<T> {
    fn end_index(&self) -> usize {
        self.head_index + self.items.len()
    }
}

struct Slot<T> {
    downstream: SinkRef<T>,
    requested: Demand,
    gate: DrainGate,
    index: AtomicUsize,
    cancelled: AtomicBool,
    terminated: AtomicBool,
    subject: Weak<ReplaySubject<T>>,
}

impl<T: Clone + Send + Sync + 'static> Handle for Slot<T> {
    fn request(&self, n: u64) {
        if !validate_request(n) {
            return;
        }
        self.requested.add(n);
        if let Some(subject) = self.subject.upgrade() {
            subject.drain_slot(self);
        }
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            if let Some(subject) = self.subject.upgrade() {
                subject.remove(self);
            }
        }
    }
}

pub struct ReplaySubject<T> {
    policy: ReplayPolicy,
    buffer: RwLock<ReplayBuffer<T>>,
    slots: ArcSwap<Vec<Arc<Slot<T>>>>,
    write_lock: Mutex<()>,
    this: Weak<Self>,
}

impl<T: Clone + Send + Sync + 'static> ReplaySubject<T> {
    /// 无界缓存。
    pub fn unbounded() -> Arc<Self> {
        Self::build(ReplayPolicy::Unbounded)
    }

    /// 只保留最近 `size` 个值。
    pub fn with_size(size: usize) -> Arc<Self> {
        Self::build(ReplayPolicy::Size(size.max(1)))
    }

    /// 只保留 `max_age` 之内的值；时间取 `scheduler` 的时钟。
    pub fn with_time(max_age: Duration, scheduler: SchedulerRef) -> Arc<Self> {
        Self::build(ReplayPolicy::Time { max_age, scheduler })
    }

    fn build(policy: ReplayPolicy) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            policy,
            buffer: RwLock::new(ReplayBuffer {
                head_index: 0,
                items: VecDeque::new(),
                terminal: None,
            }),
            slots: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
            this: this.clone(),
        })
    }

    pub fn stream(&self) -> Stream<T> {
        let this = self.this.upgrade().expect("主体存活期内 Weak 必然可升级");
        Stream::from_source(this)
    }

    fn now(&self) -> Duration {
        match &self.policy {
            ReplayPolicy::Time { scheduler, .. } => scheduler.now(),
            _ => Duration::ZERO,
        }
    }

    fn trim(buffer: &mut ReplayBuffer<T>, policy: &ReplayPolicy, now: Duration) {
        match policy {
            ReplayPolicy::Unbounded => {}
            ReplayPolicy::Size(size) => {
                while buffer.items.len() > *size {
                    buffer.items.pop_front();
                    buffer.head_index += 1;
                }
            }
            ReplayPolicy::Time { max_age, .. } => loop {
                match buffer.items.front() {
                    Some((stamp, _)) if *stamp + *max_age <= now => {
                        buffer.items.pop_front();
                        buffer.head_index += 1;
                    }
                    _ => break,
                }
            },
        }
    }

    pub fn on_next(&self, value: T) {
        let now = self.now();
        {
            let mut buffer = self.buffer.write();
            if buffer.terminal.is_some() {
                return;
            }
            buffer.items.push_back((now, value));
            Self::trim(&mut buffer, &self.policy, now);
        }
        for slot in self.slots.load_full().iter() {
            self.drain_slot(slot);
        }
    }

    pub fn on_error(&self, error: RillError) {
        {
            let mut buffer = self.buffer.write();
            if buffer.terminal.is_some() {
                drop(buffer);
                hook::on_error(error);
                return;
            }
            buffer.terminal = Some(Some(error));
        }
        for slot in self.slots.load_full().iter() {
            self.drain_slot(slot);
        }
    }

    pub fn on_complete(&self) {
        {
            let mut buffer = self.buffer.write();
            if buffer.terminal.is_some() {
                return;
            }
            buffer.terminal = Some(None);
        }
        for slot in self.slots.load_full().iter() {
            self.drain_slot(slot);
        }
    }

    fn drain_slot(&self, slot: &Slot<T>) {
        if !slot.gate.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            if !slot.cancelled.load(Ordering::Acquire) {
                let requested = slot.requested.current();
                let mut emitted = 0u64;
                loop {
                    if slot.cancelled.load(Ordering::Acquire) || emitted >= requested {
                        break;
                    }
                    let next = {
                        let buffer = self.buffer.read();
                        let index = slot.index.load(Ordering::Acquire).max(buffer.head_index);
                        if index < buffer.end_index() {
                            let value = buffer.items[index - buffer.head_index].1.clone();
                            Some((index, value))
                        } else {
                            None
                        }
                    };
                    match next {
                        Some((index, value)) => {
                            slot.downstream.on_next(value);
                            slot.index.store(index + 1, Ordering::Release);
                            emitted += 1;
                        }
                        None => break,
                    }
                }
                if emitted > 0 {
                    slot.requested.produced(emitted);
                }
                if !slot.cancelled.load(Ordering::Acquire) {
                    let terminal = {
                        let buffer = self.buffer.read();
                        if slot.index.load(Ordering::Acquire).max(buffer.head_index)
                            >= buffer.end_index()
                        {
                            buffer.terminal.clone()
                        } else {
                            None
                        }
                    };
                    if let Some(terminal) = terminal {
                        if !slot.terminated.swap(true, Ordering::AcqRel) {
                            slot.cancelled.store(true, Ordering::Release);
                            self.remove(slot);
                            match terminal {
                                Some(error) => slot.downstream.on_error(error),
                                None => slot.downstream.on_complete(),
                            }
                        }
                    }
                }
            }
            missed = slot.gate.leave(missed);
            if missed == 0 {
                return;
            }
        }
    }

    fn remove(&self, target: &Slot<T>) {
        let _guard = self.write_lock.lock();
        let current = self.slots.load_full();
        let next: Vec<Arc<Slot<T>>> = current
            .iter()
            .filter(|slot| !std::ptr::eq(Arc::as_ref(slot), target))
            .cloned()
            .collect();
        self.slots.store(Arc::new(next));
    }
}

impl<T: Clone + Send + Sync + 'static> StreamSource<T> for ReplaySubject<T> {
    fn subscribe(&self, sink: SinkRef<T>) {
        let start_index = {
            let now = self.now();
            let mut buffer = self.buffer.write();
            Self::trim(&mut buffer, &self.policy, now);
            buffer.head_index
        };
        let slot = Arc::new(Slot {
            downstream: Arc::clone(&sink),
            requested: Demand::new(),
            gate: DrainGate::new(),
            index: AtomicUsize::new(start_index),
            cancelled: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            subject: self.this.clone(),
        });
        {
            let _guard = self.write_lock.lock();
            let current = self.slots.load_full();
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(Arc::clone(&slot));
            self.slots.store(Arc::new(next));
        }
        sink.on_subscribe(Arc::clone(&slot) as HandleRef);
        self.drain_slot(&slot);
    }
}
