//! 按键拆分：`group_by`。
//!
//! ## 状态机概要（How）
//! - 主订阅者维护键到分组的登记表；键首次出现时惰性创建分组并经外层队列
//!   按外层需求发射 [`GroupedStream`]；
//! - 每个分组自带 SPSC 缓冲与排空门闩，投递串行；分组恰好接受一个订阅者；
//! - 信用流：订阅时向上游预取缓冲容量，外层请求直接透传上游，分组每消费
//!   一个槽位向上游归还一个信用；分组订阅者取消时，其积压中尚未消费的
//!   槽位（以及与取消竞争而被丢弃的在途值）同样逐个归还，共享预算不缩水；
//! - 引用计数从 1 起步（外层），每个分组加一；外层与全部分组都取消后
//!   才取消上游；
//! - `delay_error == false` 时上游错误立刻终止外层与全部分组；`true` 时
//!   各分组先排空积压再投递错误。

use dashmap::DashMap;
use parking_lot::Mutex;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::arbiter::SingleAssignmentArbiter;
use crate::demand::Demand;
use crate::drain::DrainGate;
use crate::error::{RillError, codes};
use crate::protocol::{Handle, HandleRef, NoopHandle, Sink, SinkRef, validate_request};
use crate::queue::SpscLinkedArrayQueue;
use crate::stream::{Stream, StreamSource};

type KeyFn<T, K> = Arc<dyn Fn(&T) -> K + Send + Sync>;
type ValueFn<T, V> = Arc<dyn Fn(T) -> V + Send + Sync>;

/// 分组流：键加上承载该键全部值的内层流。
pub struct GroupedStream<K, V> {
    key: K,
    state: Arc<GroupState<K, V>>,
}

impl<K: Clone, V> Clone for GroupedStream<K, V> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<K, V> GroupedStream<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + 'static,
{
    pub fn key(&self) -> &K {
        &self.key
    }

    /// 内层流视图；恰好接受一个订阅者。
    pub fn stream(&self) -> Stream<V> {
        Stream::from_source(Arc::clone(&self.state) as Arc<dyn StreamSource<V>>)
    }
}

pub(crate) fn group_by<T, K, V>(
    upstream: Stream<T>,
    key_of: KeyFn<T, K>,
    value_of: ValueFn<T, V>,
    buffer_size: usize,
    delay_error: bool,
) -> Stream<GroupedStream<K, V>>
where
    T: Send + 'static,
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + 'static,
{
    Stream::new(GroupBySource {
        upstream,
        key_of,
        value_of,
        buffer_size: buffer_size.max(1),
        delay_error,
    })
}

struct GroupBySource<T, K, V> {
    upstream: Stream<T>,
    key_of: KeyFn<T, K>,
    value_of: ValueFn<T, V>,
    buffer_size: usize,
    delay_error: bool,
}

impl<T, K, V> StreamSource<GroupedStream<K, V>> for GroupBySource<T, K, V>
where
    T: Send + 'static,
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + 'static,
{
    fn subscribe(&self, sink: SinkRef<GroupedStream<K, V>>) {
        let main = Arc::new_cyclic(|this: &Weak<GroupBySink<T, K, V>>| GroupBySink {
            downstream: Arc::clone(&sink),
            key_of: Arc::clone(&self.key_of),
            value_of: Arc::clone(&self.value_of),
            buffer_size: self.buffer_size,
            delay_error: self.delay_error,
            groups: DashMap::new(),
            queue: SpscLinkedArrayQueue::new(self.buffer_size),
            gate: DrainGate::new(),
            requested: Demand::new(),
            upstream: SingleAssignmentArbiter::new(),
            group_count: AtomicUsize::new(1),
            cancelled: AtomicBool::new(false),
            done: AtomicBool::new(false),
            error: Mutex::new(None),
            terminated: AtomicBool::new(false),
            this: this.clone(),
        });
        sink.on_subscribe(Arc::clone(&main) as HandleRef);
        self.upstream.subscribe(main as SinkRef<T>);
    }
}

/// 分组消费向主状态机回流信用与取消的通道。
trait GroupParent<K>: Send + Sync {
    fn credit(&self, n: u64);
    fn group_cancelled(&self, key: &K);
}

struct GroupBySink<T, K: Eq + Hash, V> {
    downstream: SinkRef<GroupedStream<K, V>>,
    key_of: KeyFn<T, K>,
    value_of: ValueFn<T, V>,
    buffer_size: usize,
    delay_error: bool,
    groups: DashMap<K, Arc<GroupState<K, V>>>,
    queue: SpscLinkedArrayQueue<GroupedStream<K, V>>,
    gate: DrainGate,
    requested: Demand,
    upstream: SingleAssignmentArbiter,
    group_count: AtomicUsize,
    cancelled: AtomicBool,
    done: AtomicBool,
    error: Mutex<Option<RillError>>,
    terminated: AtomicBool,
    this: Weak<Self>,
}

impl<T, K, V> GroupBySink<T, K, V>
where
    T: Send + 'static,
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + 'static,
{
    fn drain(&self) {
        if !self.gate.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                self.queue.clear();
            } else {
                let requested = self.requested.current();
                let mut emitted = 0u64;
                while emitted < requested {
                    if self.cancelled.load(Ordering::Acquire) {
                        break;
                    }
                    match self.queue.poll() {
                        Some(group) => {
                            self.downstream.on_next(group);
                            emitted += 1;
                        }
                        None => break,
                    }
                }
                if emitted > 0 {
                    self.requested.produced(emitted);
                }
                if self.done.load(Ordering::Acquire) && !self.cancelled.load(Ordering::Acquire) {
                    let error = self.error.lock().clone();
                    match error {
                        Some(err) if !self.delay_error => {
                            self.queue.clear();
                            if !self.terminated.swap(true, Ordering::AcqRel) {
                                self.downstream.on_error(err);
                            }
                        }
                        Some(err) => {
                            if self.queue.is_empty()
                                && !self.terminated.swap(true, Ordering::AcqRel)
                            {
                                self.downstream.on_error(err);
                            }
                        }
                        None => {
                            if self.queue.is_empty()
                                && !self.terminated.swap(true, Ordering::AcqRel)
                            {
                                self.downstream.on_complete();
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

    fn leave_group(&self) {
        if self.group_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.upstream.cancel();
        }
    }
}

impl<T, K, V> Sink<T> for GroupBySink<T, K, V>
where
    T: Send + 'static,
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + 'static,
{
    fn on_subscribe(&self, handle: HandleRef) {
        if self.upstream.set(handle) {
            self.upstream.request(self.buffer_size as u64);
        }
    }

    fn on_next(&self, value: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let key = (self.key_of)(&value);
        let existing = self.groups.get(&key).map(|entry| Arc::clone(entry.value()));
        match existing {
            Some(group) => group.push((self.value_of)(value)),
            None => {
                if self.cancelled.load(Ordering::Acquire) {
                    // 外层已取消：新键不再开组，值丢弃并归还信用。
                    self.upstream.request(1);
                    return;
                }
                self.group_count.fetch_add(1, Ordering::AcqRel);
                let parent: Weak<dyn GroupParent<K>> = self.this.clone();
                let state = GroupState::new(
                    key.clone(),
                    self.buffer_size,
                    self.delay_error,
                    parent,
                );
                self.groups.insert(key.clone(), Arc::clone(&state));
                state.push((self.value_of)(value));
                self.queue.offer(GroupedStream { key, state });
                self.drain();
            }
        }
    }

    fn on_error(&self, error: RillError) {
        if self.done.swap(true, Ordering::AcqRel) {
            crate::hook::on_error(error);
            return;
        }
        *self.error.lock() = Some(error.clone());
        for entry in self.groups.iter() {
            entry.value().terminate_with(Some(error.clone()));
        }
        self.groups.clear();
        self.drain();
    }

    fn on_complete(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        for entry in self.groups.iter() {
            entry.value().terminate_with(None);
        }
        self.groups.clear();
        self.drain();
    }
}

impl<T, K, V> Handle for GroupBySink<T, K, V>
where
    T: Send + 'static,
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + 'static,
{
    fn request(&self, n: u64) {
        if !validate_request(n) {
            return;
        }
        self.requested.add(n);
        // 外层需求直接透传上游。
        self.upstream.request(n);
        self.drain();
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.leave_group();
            self.drain();
        }
    }
}

impl<T, K, V> GroupParent<K> for GroupBySink<T, K, V>
where
    T: Send + 'static,
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + 'static,
{
    fn credit(&self, n: u64) {
        self.upstream.request(n);
    }

    fn group_cancelled(&self, key: &K) {
        self.groups.remove(key);
        self.leave_group();
    }
}

// ---- 分组内层状态机 ----

struct GroupState<K, V> {
    key: K,
    queue: SpscLinkedArrayQueue<V>,
    gate: DrainGate,
    requested: Demand,
    downstream: Mutex<Option<SinkRef<V>>>,
    once: AtomicBool,
    cancelled: AtomicBool,
    done: AtomicBool,
    error: Mutex<Option<RillError>>,
    terminated: AtomicBool,
    delay_error: bool,
    parent: Weak<dyn GroupParent<K>>,
    this: Weak<Self>,
}

impl<K, V> GroupState<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + 'static,
{
    fn new(
        key: K,
        buffer_size: usize,
        delay_error: bool,
        parent: Weak<dyn GroupParent<K>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            key,
            queue: SpscLinkedArrayQueue::new(buffer_size),
            gate: DrainGate::new(),
            requested: Demand::new(),
            downstream: Mutex::new(None),
            once: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            done: AtomicBool::new(false),
            error: Mutex::new(None),
            terminated: AtomicBool::new(false),
            delay_error,
            parent,
            this: this.clone(),
        })
    }

    fn push(&self, value: V) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        if self.cancelled.load(Ordering::Acquire) {
            // 与取消竞争而被丢弃的值占用过一个上游槽位，信用必须归还。
            drop(value);
            self.credit(1);
            return;
        }
        self.queue.offer(value);
        self.drain();
    }

    fn terminate_with(&self, error: Option<RillError>) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.error.lock() = error;
        self.drain();
    }

    fn credit(&self, n: u64) {
        if let Some(parent) = self.parent.upgrade() {
            parent.credit(n);
        }
    }

    fn drain(&self) {
        if !self.gate.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                // 取消后丢弃积压：这些槽位占用过共享预算，逐个清点并归还信用。
                let mut dropped = 0u64;
                while self.queue.poll().is_some() {
                    dropped += 1;
                }
                if dropped > 0 {
                    self.credit(dropped);
                }
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
                    self.credit(emitted);
                }
                if self.done.load(Ordering::Acquire) && !self.cancelled.load(Ordering::Acquire) {
                    let error = self.error.lock().clone();
                    match error {
                        Some(err) if !self.delay_error => {
                            self.queue.clear();
                            if !self.terminated.swap(true, Ordering::AcqRel) {
                                downstream.on_error(err);
                            }
                        }
                        Some(err) => {
                            if self.queue.is_empty()
                                && !self.terminated.swap(true, Ordering::AcqRel)
                            {
                                downstream.on_error(err);
                            }
                        }
                        None => {
                            if self.queue.is_empty()
                                && !self.terminated.swap(true, Ordering::AcqRel)
                            {
                                downstream.on_complete();
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

    fn cancel_by_subscriber(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.downstream.lock().take();
        if let Some(parent) = self.parent.upgrade() {
            parent.group_cancelled(&self.key);
        }
        // 积压清理与信用归还由当选排空者完成，维持单消费者纪律。
        self.drain();
    }
}

impl<K, V> StreamSource<V> for GroupState<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + 'static,
{
    fn subscribe(&self, sink: SinkRef<V>) {
        if self.once.swap(true, Ordering::AcqRel) {
            sink.on_subscribe(NoopHandle::shared());
            sink.on_error(RillError::operator(
                codes::SUBJECT_ALREADY_SUBSCRIBED,
                "a group accepts exactly one subscriber",
            ));
            return;
        }
        *self.downstream.lock() = Some(Arc::clone(&sink));
        let state = self.this.upgrade().expect("分组存活期内 Weak 必然可升级");
        sink.on_subscribe(Arc::new(GroupHandle { state }) as HandleRef);
        self.drain();
    }
}

struct GroupHandle<K, V> {
    state: Arc<GroupState<K, V>>,
}

impl<K, V> Handle for GroupHandle<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + 'static,
{
    fn request(&self, n: u64) {
        if !validate_request(n) {
            return;
        }
        self.state.requested.add(n);
        self.state.drain();
    }

    fn cancel(&self) {
        self.state.cancel_by_subscriber();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::TestSink;
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::AtomicU64;

    /// 包装上游、累计 `request` 总量的记账源；专用于信用账本断言。
    struct CountingSource {
        inner: Stream<i64>,
        requested: Arc<AtomicU64>,
    }

    impl StreamSource<i64> for CountingSource {
        fn subscribe(&self, sink: SinkRef<i64>) {
            self.inner.subscribe(Arc::new(CountingTap {
                downstream: sink,
                requested: Arc::clone(&self.requested),
            }) as SinkRef<i64>);
        }
    }

    struct CountingTap {
        downstream: SinkRef<i64>,
        requested: Arc<AtomicU64>,
    }

    impl Sink<i64> for CountingTap {
        fn on_subscribe(&self, handle: HandleRef) {
            self.downstream.on_subscribe(Arc::new(CountingHandle {
                inner: handle,
                requested: Arc::clone(&self.requested),
            }) as HandleRef);
        }

        fn on_next(&self, value: i64) {
            self.downstream.on_next(value);
        }

        fn on_error(&self, error: RillError) {
            self.downstream.on_error(error);
        }

        fn on_complete(&self) {
            self.downstream.on_complete();
        }
    }

    struct CountingHandle {
        inner: HandleRef,
        requested: Arc<AtomicU64>,
    }

    impl Handle for CountingHandle {
        fn request(&self, n: u64) {
            self.requested.fetch_add(n, Ordering::AcqRel);
            self.inner.request(n);
        }

        fn cancel(&self) {
            self.inner.cancel();
        }
    }

    /// 奇偶分组：组内值与完成信号齐备。
    #[test]
    fn splits_by_parity() {
        let groups: Arc<PlMutex<Vec<(i64, Arc<crate::testkit::TestSink<i64>>)>>> =
            Arc::new(PlMutex::new(Vec::new()));
        let registry = Arc::clone(&groups);
        let outer = TestSink::unbounded();
        Stream::range(1, 6)
            .group_by(|v| v % 2)
            .subscribe(outer.clone());

        for group in outer.values() {
            let sink = TestSink::unbounded();
            group.stream().subscribe(sink.clone());
            registry.lock().push((*group.key(), sink));
        }

        let groups = groups.lock();
        assert_eq!(groups.len(), 2, "奇偶两组");
        for (key, sink) in groups.iter() {
            match key {
                1 => sink.assert_values(&[1, 3, 5]),
                0 => sink.assert_values(&[2, 4, 6]),
                other => panic!("意外的组键 {other}"),
            }
            sink.assert_completed();
        }
        outer.assert_completed();
    }

    /// 分组的多重集并集等于源序列的多重集。
    #[test]
    fn multiset_union_matches_source() {
        let collected: Arc<PlMutex<Vec<i64>>> = Arc::new(PlMutex::new(Vec::new()));
        let outer = TestSink::unbounded();
        Stream::range(0, 100)
            .group_by(|v| v % 7)
            .subscribe(outer.clone());
        for group in outer.values() {
            let bucket = Arc::clone(&collected);
            group.stream().subscribe_with(
                move |v| bucket.lock().push(v),
                |_| {},
                || {},
            );
        }
        let mut all = collected.lock().clone();
        all.sort_unstable();
        assert_eq!(all, (0..100).collect::<Vec<i64>>(), "值既不丢也不重");
    }

    /// 分组只接受一个订阅者。
    #[test]
    fn group_rejects_second_subscriber() {
        let outer = TestSink::unbounded();
        Stream::range(1, 4).group_by(|_| 0i64).subscribe(outer.clone());
        let group = outer.values().remove(0);
        let first = TestSink::unbounded();
        let second = TestSink::unbounded();
        group.stream().subscribe(first.clone());
        group.stream().subscribe(second.clone());
        second.assert_error_code(codes::SUBJECT_ALREADY_SUBSCRIBED);
        first.assert_values(&[1, 2, 3]);
    }

    /// 取消带积压的分组订阅者必须归还占用的信用，整体流水不得停摆。
    #[test]
    fn cancelling_buffered_group_returns_credit() {
        let requested = Arc::new(AtomicU64::new(0));
        let source = Stream::new(CountingSource {
            inner: Stream::range(0, 40),
            requested: Arc::clone(&requested),
        });
        let outer = TestSink::with_request(1);
        source
            .group_by_with(|v| if *v < 5 { 0i64 } else { 1 }, |v| v, 4, false)
            .subscribe(outer.clone());

        // 预取 4 加外层需求 1：恰好放行前五个值，全部积压在 0 号组。
        assert_eq!(requested.load(Ordering::Acquire), 5);
        let stalled = TestSink::with_request(0);
        outer.values().remove(0).stream().subscribe(stalled.clone());
        stalled.assert_no_values();

        // 取消积压订阅者：五个未消费槽位的信用必须立即归还上游。
        stalled.cancel();
        assert_eq!(
            requested.load(Ordering::Acquire),
            10,
            "被丢弃积压的信用必须归还，否则共享预算永久缩水"
        );

        // 归还的信用已放行出新键；外层补一个需求后新分组照常流动直至源尽。
        outer.request(1);
        let flowing = TestSink::unbounded();
        outer.values().remove(1).stream().subscribe(flowing.clone());
        flowing.assert_values(&(5..40).collect::<Vec<i64>>());
        flowing.assert_completed();
        outer.assert_completed();
    }

    /// value_of 映射进组值。
    #[test]
    fn value_of_projects_group_values() {
        let outer = TestSink::unbounded();
        Stream::range(1, 4)
            .group_by_with(|_| 0i64, |v| v * 100, 16, false)
            .subscribe(outer.clone());
        let inner = TestSink::unbounded();
        outer.values().remove(0).stream().subscribe(inner.clone());
        inner.assert_values(&[100, 200, 300]);
        inner.assert_completed();
    }
}
