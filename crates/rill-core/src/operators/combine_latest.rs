//! 最新值组合：`combine_latest`。
//!
//! ## 状态机概要（How）
//! - 最新值数组由单一监视器守护：更新槽位与拍快照必须原子；
//! - 每个输入槽位首次到值令 `filled` 递增；填满后每次到值都把
//!   `(来源下标, 快照)` 行压入 SPSC 队列并排空；
//! - 排空每发射一行就向该行的来源补一个需求（逐行补偿）；
//! - 某输入在从未出值时完成：`delay_error == false` 直接清场空完成，
//!   `true` 则不再可能出新行，排空积压后终止；
//! - 错误按发生顺序聚合为带被抑制原因的复合错误。

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::arbiter::SingleAssignmentArbiter;
use crate::demand::Demand;
use crate::drain::DrainGate;
use crate::error::RillError;
use crate::protocol::{Handle, HandleRef, NoopHandle, Sink, SinkRef, validate_request};
use crate::queue::SpscLinkedArrayQueue;
use crate::stream::{Stream, StreamSource};

type Combiner<T, R> = Arc<dyn Fn(&[T]) -> R + Send + Sync>;

pub(crate) fn combine_latest<T, R>(
    sources: Vec<Stream<T>>,
    combiner: Combiner<T, R>,
    buffer_size: usize,
    delay_error: bool,
) -> Stream<R>
where
    T: Clone + Send + Sync + 'static,
    R: Send + 'static,
{
    Stream::new(CombineLatestSource {
        sources,
        combiner,
        buffer_size: buffer_size.max(1),
        delay_error,
    })
}

struct CombineLatestSource<T, R> {
    sources: Vec<Stream<T>>,
    combiner: Combiner<T, R>,
    buffer_size: usize,
    delay_error: bool,
}

impl<T, R> StreamSource<R> for CombineLatestSource<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Send + 'static,
{
    fn subscribe(&self, sink: SinkRef<R>) {
        if self.sources.is_empty() {
            sink.on_subscribe(NoopHandle::shared());
            sink.on_complete();
            return;
        }
        let n = self.sources.len();
        let coordinator =
            Arc::new_cyclic(|this: &Weak<Coordinator<T, R>>| Coordinator {
                downstream: Arc::clone(&sink),
                combiner: Arc::clone(&self.combiner),
                inners: (0..n)
                    .map(|index| {
                        Arc::new(InnerSink {
                            index,
                            handle: SingleAssignmentArbiter::new(),
                            prefetch: self.buffer_size,
                            parent: this.clone(),
                        })
                    })
                    .collect(),
                latest: Mutex::new(LatestState {
                    values: vec![None; n],
                    filled: 0,
                    completed: 0,
                    no_more_rows: false,
                }),
                queue: SpscLinkedArrayQueue::new(self.buffer_size),
                gate: DrainGate::new(),
                requested: Demand::new(),
                delay_error: self.delay_error,
                cancelled: AtomicBool::new(false),
                done: AtomicBool::new(false),
                discard_backlog: AtomicBool::new(false),
                error: Mutex::new(None),
                terminated: AtomicBool::new(false),
            });
        sink.on_subscribe(Arc::clone(&coordinator) as HandleRef);
        for (index, source) in self.sources.iter().enumerate() {
            if coordinator.cancelled.load(Ordering::Acquire) {
                return;
            }
            source.subscribe(Arc::clone(&coordinator.inners[index]) as SinkRef<T>);
        }
    }
}

struct LatestState<T> {
    values: Vec<Option<T>>,
    filled: usize,
    completed: usize,
    /// 不再可能产生新行（空槽输入已完成，或全部输入完成）。
    no_more_rows: bool,
}

struct Coordinator<T, R> {
    downstream: SinkRef<R>,
    combiner: Combiner<T, R>,
    inners: Vec<Arc<InnerSink<T, R>>>,
    latest: Mutex<LatestState<T>>,
    queue: SpscLinkedArrayQueue<(usize, Vec<T>)>,
    gate: DrainGate,
    requested: Demand,
    delay_error: bool,
    cancelled: AtomicBool,
    done: AtomicBool,
    /// 空槽输入提前完成：积压不再有意义，由排空者丢弃后空完成。
    discard_backlog: AtomicBool,
    error: Mutex<Option<RillError>>,
    terminated: AtomicBool,
}

impl<T, R> Coordinator<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Send + 'static,
{
    fn inner_value(&self, index: usize, value: T) {
        if self.done.load(Ordering::Acquire) || self.cancelled.load(Ordering::Acquire) {
            return;
        }
        let row = {
            let mut latest = self.latest.lock();
            if latest.values[index].is_none() {
                latest.filled += 1;
            }
            latest.values[index] = Some(value);
            if latest.filled == latest.values.len() {
                Some((
                    index,
                    latest
                        .values
                        .iter()
                        .map(|slot| slot.clone().expect("槽位已全部填充"))
                        .collect::<Vec<T>>(),
                ))
            } else {
                None
            }
        };
        match row {
            Some(row) => {
                self.queue.offer(row);
                self.drain();
            }
            None => {
                // 槽位未集齐：该值只更新快照，向来源补一个需求维持流动。
                self.inners[index].handle.request(1);
            }
        }
    }

    fn inner_error(&self, index: usize, error: RillError) {
        {
            let mut slot = self.error.lock();
            *slot = Some(match slot.take() {
                None => error,
                Some(existing) => existing.with_suppressed(error),
            });
        }
        if self.delay_error {
            self.inner_complete(index);
        } else {
            self.done.store(true, Ordering::Release);
            self.cancel_all(None);
            self.drain();
        }
    }

    fn inner_complete(&self, index: usize) {
        let finished = {
            let mut latest = self.latest.lock();
            latest.completed += 1;
            if latest.values[index].is_none() || latest.completed == latest.values.len() {
                latest.no_more_rows = true;
            }
            latest.no_more_rows
        };
        if finished {
            self.done.store(true, Ordering::Release);
            if !self.delay_error {
                // 空槽输入提前完成：不再有任何可发射的组合，立即清场空完成。
                let empty_slot = self.latest.lock().values.iter().any(Option::is_none);
                if empty_slot {
                    self.discard_backlog.store(true, Ordering::Release);
                    self.cancel_all(None);
                }
            }
            self.drain();
        }
    }

    fn cancel_all(&self, except: Option<usize>) {
        for inner in &self.inners {
            if Some(inner.index) != except {
                inner.handle.cancel();
            }
        }
    }

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
                    if self.discard_backlog.load(Ordering::Acquire)
                        || (!self.delay_error && self.error.lock().is_some())
                    {
                        break;
                    }
                    match self.queue.poll() {
                        Some((index, row)) => {
                            let combined = (self.combiner)(&row);
                            self.downstream.on_next(combined);
                            emitted += 1;
                            self.inners[index].handle.request(1);
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
                            if self.discard_backlog.load(Ordering::Acquire) {
                                self.queue.clear();
                            }
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
}

impl<T, R> Handle for Coordinator<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Send + 'static,
{
    fn request(&self, n: u64) {
        if !validate_request(n) {
            return;
        }
        self.requested.add(n);
        self.drain();
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.cancel_all(None);
            self.drain();
        }
    }
}

struct InnerSink<T, R> {
    index: usize,
    handle: SingleAssignmentArbiter,
    prefetch: usize,
    parent: Weak<Coordinator<T, R>>,
}

impl<T, R> Sink<T> for InnerSink<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Send + 'static,
{
    fn on_subscribe(&self, handle: HandleRef) {
        if self.handle.set(handle) {
            self.handle.request(self.prefetch as u64);
        }
    }

    fn on_next(&self, value: T) {
        if let Some(parent) = self.parent.upgrade() {
            parent.inner_value(self.index, value);
        }
    }

    fn on_error(&self, error: RillError) {
        if let Some(parent) = self.parent.upgrade() {
            parent.inner_error(self.index, error);
        }
    }

    fn on_complete(&self) {
        if let Some(parent) = self.parent.upgrade() {
            parent.inner_complete(self.index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;
    use crate::subject::PublishSubject;
    use crate::testkit::TestSink;

    /// 两个单值源组合产出一行后完成。
    #[test]
    fn combines_two_scalars() {
        let sink = TestSink::unbounded();
        Stream::combine_latest(
            vec![Stream::just(10), Stream::just(20)],
            |row: &[i32]| row.iter().sum::<i32>(),
        )
        .subscribe(sink.clone());
        sink.assert_values(&[30]);
        sink.assert_completed();
    }

    /// 任一槽位更新都触发新组合；另一侧保持最新值。
    #[test]
    fn recombines_on_every_update() {
        let a = PublishSubject::new();
        let b = PublishSubject::new();
        let sink = TestSink::unbounded();
        Stream::combine_latest(
            vec![a.stream(), b.stream()],
            |row: &[i32]| row[0] * 100 + row[1],
        )
        .subscribe(sink.clone());

        a.on_next(1);
        sink.assert_no_values();
        b.on_next(7);
        a.on_next(2);
        b.on_next(8);
        sink.assert_values(&[107, 207, 208]);
        a.on_complete();
        b.on_complete();
        sink.assert_completed();
    }

    /// 空槽输入提前完成且不延迟错误时，整体空完成。
    #[test]
    fn valueless_completion_short_circuits() {
        let a = PublishSubject::<i32>::new();
        let b = PublishSubject::<i32>::new();
        let sink = TestSink::unbounded();
        Stream::combine_latest(vec![a.stream(), b.stream()], |row: &[i32]| row[0])
            .subscribe(sink.clone());
        a.on_next(1);
        b.on_complete();
        sink.assert_no_values();
        sink.assert_completed();
    }

    /// 错误按发生顺序聚合：首个错误为主，后续进入被抑制列表（延迟模式）。
    #[test]
    fn delayed_errors_accumulate_suppressed() {
        use parking_lot::Mutex as PlMutex;
        let a = PublishSubject::<i32>::new();
        let b = PublishSubject::<i32>::new();
        let captured: Arc<PlMutex<Option<RillError>>> = Arc::new(PlMutex::new(None));
        let slot = Arc::clone(&captured);
        Stream::combine_latest_with(
            vec![a.stream(), b.stream()],
            |row: &[i32]| row[0] + row[1],
            16,
            true,
        )
        .subscribe_with(
            |_| {},
            move |error| *slot.lock() = Some(error),
            || {},
        );
        a.on_next(1);
        b.on_next(2);
        a.on_error(RillError::new(codes::UPSTREAM_FAILURE, "first"));
        b.on_error(RillError::new("upstream.second", "second"));

        let error = captured.lock().clone().expect("应收到聚合错误");
        assert_eq!(error.code(), codes::UPSTREAM_FAILURE, "首个错误充当主错误");
        assert_eq!(error.suppressed().len(), 1, "后续错误必须进入被抑制列表");
        assert_eq!(error.suppressed()[0].code(), "upstream.second");
    }

    /// 非延迟错误立即终止并丢弃积压。
    #[test]
    fn eager_error_terminates_immediately() {
        let a = PublishSubject::new();
        let b = PublishSubject::new();
        let sink = TestSink::with_request(0);
        Stream::combine_latest(vec![a.stream(), b.stream()], |row: &[i32]| row[0] + row[1])
            .subscribe(sink.clone());
        a.on_next(1);
        b.on_next(2);
        a.on_error(RillError::new(codes::UPSTREAM_FAILURE, "boom"));
        sink.assert_error_code(codes::UPSTREAM_FAILURE);
        sink.assert_no_values();
    }
}
