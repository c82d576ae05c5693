//! 多生产者/单消费者侵入式链表队列（Vyukov 算法）。
//!
//! 生产者以一次 `swap` 接管链尾并随后链接前驱节点的 `next`；
//! 消费者沿 `next` 前进并回收走过的节点。生产侧天然支持任意并发，
//! 消费侧由调用方的排空串行化保证单线程纪律。

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crossbeam_utils::CachePadded;

struct Node<T> {
    value: UnsafeCell<Option<T>>,
    next: AtomicPtr<Node<T>>,
}

impl<T> Node<T> {
    fn boxed(value: Option<T>) -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            value: UnsafeCell::new(value),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }
}

/// 无界 MPSC 队列。
pub(crate) struct MpscLinkedQueue<T> {
    /// 生产端：最近入队节点。
    head: CachePadded<AtomicPtr<Node<T>>>,
    /// 消费端：已消费的前哨节点。
    tail: CachePadded<AtomicPtr<Node<T>>>,
}

unsafe impl<T: Send> Send for MpscLinkedQueue<T> {}
unsafe impl<T: Send> Sync for MpscLinkedQueue<T> {}

impl<T> MpscLinkedQueue<T> {
    pub(crate) fn new() -> Self {
        let stub = Node::boxed(None);
        Self {
            head: CachePadded::new(AtomicPtr::new(stub)),
            tail: CachePadded::new(AtomicPtr::new(stub)),
        }
    }

    /// 入队；任意线程可并发调用，永远返回 `true`。
    pub(crate) fn offer(&self, value: T) -> bool {
        let node = Node::boxed(Some(value));
        let prev = self.head.swap(node, Ordering::AcqRel);
        // 安全性：prev 由 swap 独占取得，在其 next 发布前消费者无法越过它，
        // 节点因此保持存活。
        unsafe { (*prev).next.store(node, Ordering::Release) };
        true
    }

    /// 出队；从消费者视角为空时返回 `None`。
    pub(crate) fn poll(&self) -> Option<T> {
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            // 安全性：tail 节点只会被推进过它的消费者回收；单消费者纪律下
            // 本线程观察到的 tail 始终存活。
            let next = unsafe { (*tail).next.load(Ordering::Acquire) };
            if next.is_null() {
                return None;
            }
            if self
                .tail
                .compare_exchange(tail, next, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            // 安全性：CAS 当选后本线程独占 next 的值与 tail 的回收权。
            let value = unsafe { (*(*next).value.get()).take() };
            unsafe { drop(Box::from_raw(tail)) };
            if let Some(value) = value {
                return Some(value);
            }
            // 前哨节点不携带值，继续推进。
        }
    }

    /// 消费者视角的空判定。
    pub(crate) fn is_empty(&self) -> bool {
        let tail = self.tail.load(Ordering::Acquire);
        unsafe { (*tail).next.load(Ordering::Acquire).is_null() }
    }

    /// 观察队首而不出队。
    pub(crate) fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        let tail = self.tail.load(Ordering::Acquire);
        let next = unsafe { (*tail).next.load(Ordering::Acquire) };
        if next.is_null() {
            return None;
        }
        // 安全性：单消费者纪律下 next 的值在本线程出队前保持有效。
        unsafe { (*(*next).value.get()).clone() }
    }

    /// 丢弃全部已入队元素。
    pub(crate) fn clear(&self) {
        while self.poll().is_some() {}
    }
}

impl<T> Drop for MpscLinkedQueue<T> {
    fn drop(&mut self) {
        while self.poll().is_some() {}
        let tail = self.tail.load(Ordering::Acquire);
        // 安全性：&mut self 独占队列；排空后仅剩前哨节点。
        unsafe { drop(Box::from_raw(tail)) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    /// 单线程路径保持 FIFO。
    #[test]
    fn fifo_in_single_thread() {
        let q = MpscLinkedQueue::new();
        assert!(q.is_empty());
        for i in 0..32 {
            q.offer(i);
        }
        assert_eq!(q.peek(), Some(0));
        let drained: Vec<i32> = std::iter::from_fn(|| q.poll()).collect();
        assert_eq!(drained, (0..32).collect::<Vec<_>>());
        assert!(q.is_empty());
    }

    /// 多生产者并发入队不丢失元素，且每个生产者内部保持顺序。
    #[test]
    fn concurrent_producers_lose_nothing() {
        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 5_000;
        let q = Arc::new(MpscLinkedQueue::new());
        let mut handles = Vec::new();
        for p in 0..PRODUCERS {
            let q = Arc::clone(&q);
            handles.push(thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    q.offer(p * PER_PRODUCER + i);
                }
            }));
        }
        for h in handles {
            h.join().expect("生产线程必须平稳退出");
        }
        let mut last_seen = vec![None::<u64>; PRODUCERS as usize];
        let mut count = 0u64;
        while let Some(v) = q.poll() {
            let producer = (v / PER_PRODUCER) as usize;
            let seq = v % PER_PRODUCER;
            if let Some(prev) = last_seen[producer] {
                assert!(seq > prev, "同一生产者的元素必须保持提交顺序");
            }
            last_seen[producer] = Some(seq);
            count += 1;
        }
        assert_eq!(count, PRODUCERS * PER_PRODUCER);
    }

    /// 未消费节点在 Drop 时必须连同值一起回收。
    #[test]
    fn drop_releases_pending_values() {
        let probe = Arc::new(());
        let q = MpscLinkedQueue::new();
        for _ in 0..16 {
            q.offer(Arc::clone(&probe));
        }
        drop(q);
        assert_eq!(Arc::strong_count(&probe), 1, "析构必须释放滞留元素");
    }
}
