//! 单生产者/单消费者队列的两个变体。
//!
//! - [`SpscLinkedArrayQueue`]：无界；按二的幂容量分块，块间以原子指针链接，
//!   消费者负责回收整块消费完毕的内存。
//! - [`SpscArrayQueue`]：有界环形；槽位携带序号戳（Vyukov 有界队列算法），
//!   `offer` 仅在容量耗尽时返回 `false`。
//!
//! 内存序约定：槽位值写入先于 `ready`/戳的 Release 发布；消费侧以 Acquire
//! 读取发布标记后才触碰值。块回收依赖“最后一槽发布前先链接后继块”的顺序，
//! 保证生产者提示指针永不指向可能已被回收的块。

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

struct Slot<T> {
    ready: AtomicBool,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    fn empty() -> Self {
        Self {
            ready: AtomicBool::new(false),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

struct Chunk<T> {
    base: usize,
    slots: Box<[Slot<T>]>,
    next: AtomicPtr<Chunk<T>>,
}

impl<T> Chunk<T> {
    fn new(base: usize, capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| Slot::empty()).collect::<Vec<_>>();
        Self {
            base,
            slots: slots.into_boxed_slice(),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

/// 无界分块 SPSC 队列。
pub(crate) struct SpscLinkedArrayQueue<T> {
    chunk_cap: usize,
    producer_index: CachePadded<AtomicUsize>,
    producer_chunk: CachePadded<AtomicPtr<Chunk<T>>>,
    consumer_index: CachePadded<AtomicUsize>,
    consumer_chunk: CachePadded<AtomicPtr<Chunk<T>>>,
}

unsafe impl<T: Send> Send for SpscLinkedArrayQueue<T> {}
unsafe impl<T: Send> Sync for SpscLinkedArrayQueue<T> {}

impl<T> SpscLinkedArrayQueue<T> {
    /// 以容量提示创建；块容量向上取整到二的幂，最小为 8。
    pub(crate) fn new(capacity_hint: usize) -> Self {
        let chunk_cap = capacity_hint.max(8).next_power_of_two();
        let first = Box::into_raw(Box::new(Chunk::new(0, chunk_cap)));
        Self {
            chunk_cap,
            producer_index: CachePadded::new(AtomicUsize::new(0)),
            producer_chunk: CachePadded::new(AtomicPtr::new(first)),
            consumer_index: CachePadded::new(AtomicUsize::new(0)),
            consumer_chunk: CachePadded::new(AtomicPtr::new(first)),
        }
    }

    /// 入队；无界变体永远返回 `true`。
    pub(crate) fn offer(&self, value: T) -> bool {
        let index = self.producer_index.fetch_add(1, Ordering::AcqRel);
        let chunk_ptr = self.chunk_for_producer(index);
        // 安全性：fetch_add 为本槽位赋予唯一索引，当前线程是唯一写者；
        // 值写入先于 ready 的 Release 发布，消费侧经 Acquire 观察。
        unsafe {
            let chunk = &*chunk_ptr;
            let offset = index - chunk.base;
            (*chunk.slots[offset].value.get()).write(value);
            if offset == self.chunk_cap - 1 {
                // 最后一槽：发布前必须先链接后继块并推进生产者提示，
                // 消费者据此在整块耗尽时总能找到下一块。
                let next = self.ensure_next(chunk);
                self.producer_chunk.store(next, Ordering::Release);
            }
            chunk.slots[offset].ready.store(true, Ordering::Release);
        }
        true
    }

    /// 出队；队列为空（从消费者视角）时返回 `None`。
    pub(crate) fn poll(&self) -> Option<T> {
        loop {
            let index = self.consumer_index.load(Ordering::Acquire);
            let chunk_ptr = self.consumer_chunk.load(Ordering::Acquire);
            // 安全性：消费者纪律下该块尚未回收；offset 越界说明读到了
            // 跨块推进的中间态，重试即可。
            let chunk = unsafe { &*chunk_ptr };
            let offset = index.wrapping_sub(chunk.base);
            if offset >= self.chunk_cap {
                continue;
            }
            let slot = &chunk.slots[offset];
            if !slot.ready.load(Ordering::Acquire) {
                return None;
            }
            if self
                .consumer_index
                .compare_exchange(index, index + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            // 安全性：索引 CAS 当选后本线程独占该槽位的值。
            let value = unsafe { (*slot.value.get()).assume_init_read() };
            if offset == self.chunk_cap - 1 {
                let next = chunk.next.load(Ordering::Acquire);
                debug_assert!(!next.is_null(), "最后一槽发布前必然已链接后继块");
                self.consumer_chunk.store(next, Ordering::Release);
                // 安全性：整块已消费完毕且提示指针已离开，本线程独占回收权。
                unsafe { drop(Box::from_raw(chunk_ptr)) };
            }
            return Some(value);
        }
    }

    /// 消费者视角的空判定。
    pub(crate) fn is_empty(&self) -> bool {
        let index = self.consumer_index.load(Ordering::Acquire);
        let chunk_ptr = self.consumer_chunk.load(Ordering::Acquire);
        let chunk = unsafe { &*chunk_ptr };
        let offset = index.wrapping_sub(chunk.base);
        if offset >= self.chunk_cap {
            return false;
        }
        !chunk.slots[offset].ready.load(Ordering::Acquire)
    }

    /// 观察队首而不出队。
    pub(crate) fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        let index = self.consumer_index.load(Ordering::Acquire);
        let chunk_ptr = self.consumer_chunk.load(Ordering::Acquire);
        let chunk = unsafe { &*chunk_ptr };
        let offset = index.wrapping_sub(chunk.base);
        if offset >= self.chunk_cap {
            return None;
        }
        let slot = &chunk.slots[offset];
        if !slot.ready.load(Ordering::Acquire) {
            return None;
        }
        // 安全性：单消费者纪律下值在本线程出队前保持有效。
        Some(unsafe { (*slot.value.get()).assume_init_ref().clone() })
    }

    /// 丢弃全部已入队元素。
    pub(crate) fn clear(&self) {
        while self.poll().is_some() {}
    }

    fn chunk_for_producer(&self, index: usize) -> *mut Chunk<T> {
        let mut chunk_ptr = self.producer_chunk.load(Ordering::Acquire);
        loop {
            let chunk = unsafe { &*chunk_ptr };
            if index < chunk.base + self.chunk_cap {
                return chunk_ptr;
            }
            chunk_ptr = self.ensure_next(chunk);
        }
    }

    fn ensure_next(&self, chunk: &Chunk<T>) -> *mut Chunk<T> {
        let next = chunk.next.load(Ordering::Acquire);
        if !next.is_null() {
            return next;
        }
        let fresh = Box::into_raw(Box::new(Chunk::new(chunk.base + self.chunk_cap, self.chunk_cap)));
        match chunk.next.compare_exchange(
            ptr::null_mut(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => fresh,
            Err(existing) => {
                // 安全性：CAS 落败说明 fresh 从未发布，独占回收。
                unsafe { drop(Box::from_raw(fresh)) };
                existing
            }
        }
    }
}

impl<T> Drop for SpscLinkedArrayQueue<T> {
    fn drop(&mut self) {
        while self.poll().is_some() {}
        // 释放残余块链（当前消费块与其后已预分配但为空的块）。
        let mut chunk_ptr = self.consumer_chunk.load(Ordering::Acquire);
        while !chunk_ptr.is_null() {
            // 安全性：&mut self 独占整个队列。
            let chunk = unsafe { Box::from_raw(chunk_ptr) };
            chunk_ptr = chunk.next.load(Ordering::Acquire);
        }
    }
}

struct ArraySlot<T> {
    stamp: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// 有界环形 SPSC 队列（Vyukov 序号戳算法）。
pub(crate) struct SpscArrayQueue<T> {
    mask: usize,
    slots: Box<[ArraySlot<T>]>,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
}

unsafe impl<T: Send> Send for SpscArrayQueue<T> {}
unsafe impl<T: Send> Sync for SpscArrayQueue<T> {}

impl<T> SpscArrayQueue<T> {
    /// 创建容量向上取整到二的幂的有界队列。
    pub(crate) fn new(capacity: usize) -> Self {
        let cap = capacity.max(2).next_power_of_two();
        let slots = (0..cap)
            .map(|i| ArraySlot {
                stamp: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>();
        Self {
            mask: cap - 1,
            slots: slots.into_boxed_slice(),
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// 入队；容量耗尽时返回 `false`。
    pub(crate) fn offer(&self, value: T) -> bool {
        loop {
            let tail = self.tail.load(Ordering::Relaxed);
            let slot = &self.slots[tail & self.mask];
            let stamp = slot.stamp.load(Ordering::Acquire);
            if stamp == tail {
                if self
                    .tail
                    .compare_exchange_weak(tail, tail + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    // 安全性：尾指针 CAS 当选赋予本线程对槽位的独占写权。
                    unsafe { (*slot.value.get()).write(value) };
                    slot.stamp.store(tail + 1, Ordering::Release);
                    return true;
                }
            } else if stamp < tail {
                return false;
            }
        }
    }

    /// 出队；空时返回 `None`。
    pub(crate) fn poll(&self) -> Option<T> {
        loop {
            let head = self.head.load(Ordering::Relaxed);
            let slot = &self.slots[head & self.mask];
            let stamp = slot.stamp.load(Ordering::Acquire);
            if stamp == head + 1 {
                if self
                    .head
                    .compare_exchange_weak(head, head + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    // 安全性：头指针 CAS 当选后本线程独占该槽位的值。
                    let value = unsafe { (*slot.value.get()).assume_init_read() };
                    slot.stamp.store(head + self.mask + 1, Ordering::Release);
                    return Some(value);
                }
            } else if stamp <= head {
                return None;
            }
        }
    }

    /// 观察队首而不出队。
    pub(crate) fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        let head = self.head.load(Ordering::Acquire);
        let slot = &self.slots[head & self.mask];
        if slot.stamp.load(Ordering::Acquire) != head + 1 {
            return None;
        }
        // 安全性：单消费者纪律下值在本线程出队前保持有效。
        Some(unsafe { (*slot.value.get()).assume_init_ref().clone() })
    }

    pub(crate) fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        let slot = &self.slots[head & self.mask];
        slot.stamp.load(Ordering::Acquire) <= head
    }

    pub(crate) fn clear(&self) {
        while self.poll().is_some() {}
    }
}

impl<T> Drop for SpscArrayQueue<T> {
    fn drop(&mut self) {
        while self.poll().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    /// 跨越多个块的入队/出队必须保持 FIFO 且不丢元素。
    #[test]
    fn linked_queue_preserves_fifo_across_chunks() {
        let q = SpscLinkedArrayQueue::new(8);
        for i in 0..100 {
            assert!(q.offer(i));
        }
        assert_eq!(q.peek(), Some(0));
        for i in 0..100 {
            assert_eq!(q.poll(), Some(i));
        }
        assert!(q.is_empty());
        assert_eq!(q.poll(), None);
    }

    /// 单生产单消费并发下全部元素按序到达。
    #[test]
    fn linked_queue_concurrent_transfer() {
        let q = Arc::new(SpscLinkedArrayQueue::new(16));
        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                for i in 0..10_000u64 {
                    q.offer(i);
                }
            })
        };
        let mut expected = 0u64;
        while expected < 10_000 {
            if let Some(v) = q.poll() {
                assert_eq!(v, expected, "消费顺序必须与生产顺序一致");
                expected += 1;
            } else {
                thread::yield_now();
            }
        }
        producer.join().expect("生产线程必须平稳退出");
        assert!(q.is_empty());
    }

    /// 未消费元素在 Drop 时必须逐一析构，不得泄漏。
    #[test]
    fn linked_queue_drop_releases_pending_values() {
        let q = SpscLinkedArrayQueue::new(8);
        for i in 0..40usize {
            q.offer(Arc::new(i));
        }
        let probe = Arc::new(999usize);
        q.offer(Arc::clone(&probe));
        drop(q);
        assert_eq!(Arc::strong_count(&probe), 1, "队列析构必须释放滞留元素");
    }

    /// 有界环形队列在容量耗尽时拒绝入队，消费后恢复。
    #[test]
    fn array_queue_rejects_when_full() {
        let q = SpscArrayQueue::new(4);
        for i in 0..4 {
            assert!(q.offer(i), "容量内必须接受");
        }
        assert!(!q.offer(99), "满载必须返回 false");
        assert_eq!(q.poll(), Some(0));
        assert!(q.offer(4), "腾出槽位后必须恢复接受");
        let drained: Vec<i32> = std::iter::from_fn(|| q.poll()).collect();
        assert_eq!(drained, vec![1, 2, 3, 4]);
    }

    /// 环形队列回绕多圈后序号戳仍保持一致。
    #[test]
    fn array_queue_wraps_many_rounds() {
        let q = SpscArrayQueue::new(2);
        for round in 0..1_000 {
            assert!(q.offer(round));
            assert_eq!(q.poll(), Some(round));
        }
        assert!(q.is_empty());
    }
}
