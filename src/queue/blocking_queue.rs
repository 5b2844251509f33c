// Bounded two-lock blocking queue.
//
// Producers serialize on the tail lock and consumers on the head lock, so an
// insert and a remove never wait for each other. The only state shared by both
// sides is the element count. Each side inspects the count value it replaced to
// decide whether it just moved the queue off "empty" (wake a consumer) or off
// "full" (wake a producer); every other insert/remove skips the other side's
// lock entirely.

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use super::error::InsertError;
use super::node::{self, Head, Node, Tail};
use super::stats::{QueueStats, QueueStatsAtomic};
use crate::config::{QueueConfig, clamp_capacity};

/// A bounded multi-producer multi-consumer FIFO queue.
///
/// The queue owns each element from a successful insert until a removal hands
/// it back; [`clear`](Self::clear) and dropping the queue drop whatever is
/// still enqueued.
pub struct BlockingQueue<T> {
    capacity: usize,
    count: CachePadded<AtomicUsize>,

    /// Remove side: the head cursor and consumers waiting for an element.
    head: CachePadded<Mutex<Head<T>>>,
    not_empty: Condvar,

    /// Insert side: the tail cursor and producers waiting for a free slot.
    tail: CachePadded<Mutex<Tail<T>>>,
    not_full: Condvar,

    stats: QueueStatsAtomic,
}

impl<T> BlockingQueue<T> {
    /// Create a queue holding at most `capacity` elements.
    ///
    /// A capacity of zero, or one above [`MAX_CAPACITY`](crate::MAX_CAPACITY),
    /// is clamped to `MAX_CAPACITY`.
    pub fn new(capacity: usize) -> Self {
        Self::with_config(QueueConfig::bounded(capacity))
    }

    pub fn with_config(config: QueueConfig) -> Self {
        let capacity = clamp_capacity(config.capacity);
        if capacity != config.capacity {
            debug!(
                requested = config.capacity,
                capacity, "queue capacity clamped to maximum bound"
            );
        }

        let (head, tail) = node::list();
        Self {
            capacity,
            count: CachePadded::new(AtomicUsize::new(0)),
            head: CachePadded::new(Mutex::new(head)),
            not_empty: Condvar::new(),
            tail: CachePadded::new(Mutex::new(tail)),
            not_full: Condvar::new(),
            stats: QueueStatsAtomic::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of enqueued elements. A snapshot: concurrent inserts and removes
    /// may change it before the caller looks at it.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn remaining_capacity(&self) -> usize {
        self.capacity.saturating_sub(self.len())
    }

    pub fn stats(&self) -> QueueStats {
        self.stats.snapshot()
    }

    /// Insert without waiting. Fails with [`InsertError::Full`] if the queue is
    /// at capacity at the moment of the attempt.
    pub fn try_insert(&self, item: T) -> Result<(), InsertError<T>> {
        if self.count.load(Ordering::Acquire) >= self.capacity {
            self.stats.record_full();
            return Err(InsertError::Full(item));
        }

        let node = self.alloc_node(item)?;

        let mut tail = self.tail.lock();
        if self.count.load(Ordering::Acquire) >= self.capacity {
            drop(tail);
            self.stats.record_full();
            // SAFETY: the node was never linked.
            return Err(InsertError::Full(unsafe { Node::into_item(node) }));
        }
        let prev = self.enqueue(&mut tail, node);
        drop(tail);

        if prev == 0 {
            self.signal_not_empty();
        }
        Ok(())
    }

    /// Insert, waiting as long as necessary for a free slot.
    ///
    /// Only [`InsertError::AllocFailed`] can be returned, and only before the
    /// caller starts waiting.
    pub fn insert(&self, item: T) -> Result<(), InsertError<T>> {
        let node = self.alloc_node(item)?;

        let mut tail = self.tail.lock();
        while self.count.load(Ordering::Acquire) >= self.capacity {
            self.not_full.wait(&mut tail);
        }
        let prev = self.enqueue(&mut tail, node);
        drop(tail);

        if prev == 0 {
            self.signal_not_empty();
        }
        Ok(())
    }

    /// Insert, waiting at most `timeout` for a free slot.
    pub fn insert_timeout(&self, item: T, timeout: Duration) -> Result<(), InsertError<T>> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return self.insert(item);
        };
        let node = self.alloc_node(item)?;

        let mut tail = self.tail.lock();
        while self.count.load(Ordering::Acquire) >= self.capacity {
            if self.not_full.wait_until(&mut tail, deadline).timed_out() {
                // A slot freed right at the deadline is still taken, so a
                // wake meant for this waiter is never dropped on the floor.
                if self.count.load(Ordering::Acquire) < self.capacity {
                    break;
                }
                drop(tail);
                self.stats.record_timeout();
                // SAFETY: the node was never linked.
                return Err(InsertError::Timeout(unsafe { Node::into_item(node) }));
            }
        }
        let prev = self.enqueue(&mut tail, node);
        drop(tail);

        if prev == 0 {
            self.signal_not_empty();
        }
        Ok(())
    }

    /// Remove the head element without waiting. `None` if the queue is empty.
    pub fn try_remove(&self) -> Option<T> {
        if self.count.load(Ordering::Acquire) == 0 {
            return None;
        }

        let head = self.head.lock();
        if self.count.load(Ordering::Acquire) == 0 {
            return None;
        }
        Some(self.dequeue(head))
    }

    /// Remove the head element, waiting as long as necessary for one to arrive.
    pub fn remove(&self) -> T {
        let mut head = self.head.lock();
        while self.count.load(Ordering::Acquire) == 0 {
            self.not_empty.wait(&mut head);
        }
        self.dequeue(head)
    }

    /// Remove the head element, waiting at most `timeout` for one to arrive.
    pub fn remove_timeout(&self, timeout: Duration) -> Option<T> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return Some(self.remove());
        };

        let mut head = self.head.lock();
        while self.count.load(Ordering::Acquire) == 0 {
            if self.not_empty.wait_until(&mut head, deadline).timed_out() {
                if self.count.load(Ordering::Acquire) > 0 {
                    break;
                }
                self.stats.record_timeout();
                return None;
            }
        }
        Some(self.dequeue(head))
    }

    /// Run `f` on the head element without removing it.
    ///
    /// Consumers are held off while `f` runs; producers are not.
    ///
    /// `f` must not call back into the queue. It runs under the remove lock,
    /// which is not reentrant: any consumer-side call, a blocking insert, or a
    /// `try_insert` that has to wake a consumer would wait on that lock
    /// forever. Read-only snapshots such as [`len`](Self::len) and
    /// [`stats`](Self::stats) take no lock and are fine.
    pub fn peek_with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let head = self.head.lock();
        if self.count.load(Ordering::Acquire) == 0 {
            return None;
        }
        // SAFETY: remove lock held, count observed non-zero.
        Some(f(unsafe { head.front() }))
    }

    /// Clone of the head element, if any.
    pub fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        self.peek_with(T::clone)
    }

    /// Drop every enqueued element and return how many there were.
    ///
    /// If the queue was full, one waiting producer is woken; it wakes the next
    /// one after inserting, and so on while space remains.
    pub fn clear(&self) -> usize {
        let (released, chain) = {
            // Lock order: insert side first, then remove side.
            let mut tail = self.tail.lock();
            let mut head = self.head.lock();

            // SAFETY: both halves of the same list, both locks held.
            let chain = unsafe { head.detach_all(&mut tail) };
            let prev = self.count.swap(0, Ordering::AcqRel);
            if prev == self.capacity {
                self.not_full.notify_one();
            }
            (prev, chain)
        };

        self.stats.record_clear(released);
        debug!(released, capacity = self.capacity, "queue cleared");

        // Element destructors run outside both locks, after the bookkeeping in
        // case one of them panics.
        drop(chain);
        released
    }

    fn alloc_node(&self, item: T) -> Result<NonNull<Node<T>>, InsertError<T>> {
        Node::alloc(item).map_err(|item| {
            self.stats.record_alloc_failure();
            warn!(
                len = self.len(),
                capacity = self.capacity,
                "queue node allocation failed, element rejected"
            );
            InsertError::AllocFailed(item)
        })
    }

    /// Link `node` and bump the count. Returns the count before the insert.
    fn enqueue(&self, tail: &mut MutexGuard<'_, Tail<T>>, node: NonNull<Node<T>>) -> usize {
        tail.push_back(node);
        let prev = self.count.fetch_add(1, Ordering::AcqRel);
        if prev + 1 < self.capacity {
            self.not_full.notify_one();
        }
        self.stats.record_insert(prev + 1);
        prev
    }

    /// Unlink the head element and drop the count, then release the remove
    /// lock and wake a producer if this removal took the queue off full.
    fn dequeue(&self, mut head: MutexGuard<'_, Head<T>>) -> T {
        // SAFETY: remove lock held and count observed non-zero by the caller.
        // Only remove-lock holders decrement the count, and `clear` also takes
        // the remove lock, so the element is still there.
        let item = unsafe { head.pop_front() };
        let prev = self.count.fetch_sub(1, Ordering::AcqRel);
        if prev > 1 {
            self.not_empty.notify_one();
        }
        drop(head);

        if prev == self.capacity {
            self.signal_not_full();
        }
        self.stats.record_remove();
        item
    }

    // Cross-side wakes are sent while holding the other side's lock. A waiter
    // rechecks the count under that lock before sleeping, so the notification
    // cannot slip in between its check and its wait.

    fn signal_not_empty(&self) {
        let _head = self.head.lock();
        trace!("queue left empty, waking a consumer");
        self.not_empty.notify_one();
    }

    fn signal_not_full(&self) {
        let _tail = self.tail.lock();
        trace!("queue left full, waking a producer");
        self.not_full.notify_one();
    }
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        Self::with_config(QueueConfig::default())
    }
}

impl<T> std::fmt::Debug for BlockingQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingQueue")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}


/// Property-based tests using proptest
#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    #[derive(Clone, Debug)]
    enum Op {
        TryInsert(u16),
        TryRemove,
        Peek,
        Clear,
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => any::<u16>().prop_map(Op::TryInsert),
            3 => Just(Op::TryRemove),
            1 => Just(Op::Peek),
            1 => Just(Op::Clear),
        ]
    }

    proptest! {
        /// Single-threaded behaviour matches a bounded VecDeque
        #[test]
        fn matches_bounded_deque(capacity in 1usize..8, ops in prop::collection::vec(arb_op(), 0..200)) {
            let queue = BlockingQueue::new(capacity);
            let mut model = VecDeque::new();

            for op in ops {
                match op {
                    Op::TryInsert(v) => {
                        let result = queue.try_insert(v);
                        if model.len() < capacity {
                            prop_assert!(result.is_ok());
                            model.push_back(v);
                        } else {
                            prop_assert_eq!(result, Err(InsertError::Full(v)));
                        }
                    }
                    Op::TryRemove => prop_assert_eq!(queue.try_remove(), model.pop_front()),
                    Op::Peek => prop_assert_eq!(queue.peek(), model.front().copied()),
                    Op::Clear => {
                        prop_assert_eq!(queue.clear(), model.len());
                        model.clear();
                    }
                }
                prop_assert_eq!(queue.len(), model.len());
                prop_assert!(queue.len() <= queue.capacity());
            }
        }
    }
}
