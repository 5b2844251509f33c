// Singly linked node storage with a permanent dummy head.
//
// The list is split into two cursors so each side of the queue can live behind
// its own lock: `Head` is only touched by consumers, `Tail` only by producers.
// The node `head` points at never holds a live element (it is the dummy or the
// node whose element was just taken), so the first element is `head.next` and
// an empty list is simply `head == tail`.

use std::alloc::{self, Layout};
use std::marker::PhantomData;
use std::mem::{self, MaybeUninit};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

pub(crate) struct Node<T> {
    /// Initialized from allocation until the node is promoted to head.
    item: MaybeUninit<T>,
    next: AtomicPtr<Node<T>>,
}

impl<T> Node<T> {
    fn dummy() -> NonNull<Self> {
        let node = Box::new(Node {
            item: MaybeUninit::uninit(),
            next: AtomicPtr::new(ptr::null_mut()),
        });
        NonNull::from(Box::leak(node))
    }

    /// Allocate a detached node holding `item`.
    ///
    /// Allocator exhaustion is reported by handing the element back instead of
    /// aborting the process.
    pub(crate) fn alloc(item: T) -> Result<NonNull<Self>, T> {
        if crate::chaos::should_fail_alloc() {
            return Err(item);
        }

        let layout = Layout::new::<Self>();
        // SAFETY: `Node<T>` always contains an `AtomicPtr`, so the layout is
        // never zero-sized.
        let raw = unsafe { alloc::alloc(layout) }.cast::<Self>();
        let Some(node) = NonNull::new(raw) else {
            return Err(item);
        };

        // SAFETY: freshly allocated with the layout of `Node<T>`.
        unsafe {
            node.as_ptr().write(Node {
                item: MaybeUninit::new(item),
                next: AtomicPtr::new(ptr::null_mut()),
            });
        }
        Ok(node)
    }

    /// Take the element back out of a node that was never linked and free it.
    ///
    /// # Safety
    /// `node` must come from [`Node::alloc`] and must not be reachable from any
    /// list.
    pub(crate) unsafe fn into_item(node: NonNull<Self>) -> T {
        unsafe {
            let item = (*node.as_ptr()).item.assume_init_read();
            Self::free(node);
            item
        }
    }

    /// Release the node's memory without touching its element slot.
    unsafe fn free(node: NonNull<Self>) {
        // `alloc` and `dummy` both allocate with `Layout::new::<Node<T>>()`
        // through the global allocator, which is what `Box` expects.
        drop(unsafe { Box::from_raw(node.as_ptr()) });
    }
}

/// Consumer-side cursor. Owns the current dummy node.
pub(crate) struct Head<T> {
    node: NonNull<Node<T>>,
    _owns: PhantomData<T>,
}

/// Producer-side cursor. Never owns anything; it points at the last node.
pub(crate) struct Tail<T> {
    node: NonNull<Node<T>>,
    _owns: PhantomData<T>,
}

// SAFETY: the cursors only hand elements across threads by value, and every
// node is reachable from exactly one owner (the list, starting at `Head`).
unsafe impl<T: Send> Send for Head<T> {}
unsafe impl<T: Send> Send for Tail<T> {}

/// Create an empty list: both cursors on a fresh dummy node.
pub(crate) fn list<T>() -> (Head<T>, Tail<T>) {
    let dummy = Node::dummy();
    (
        Head {
            node: dummy,
            _owns: PhantomData,
        },
        Tail {
            node: dummy,
            _owns: PhantomData,
        },
    )
}

impl<T> Tail<T> {
    /// Link `node` after the last node and advance the tail.
    ///
    /// Caller holds the insert lock. The link is published with `Release` so a
    /// consumer that later observes the incremented count also sees the node.
    pub(crate) fn push_back(&mut self, node: NonNull<Node<T>>) {
        // SAFETY: the tail node stays alive while the queue is non-empty
        // behind it; consumers never free the node `tail` points at because
        // they only free the old head after advancing past it, and they only
        // advance when the count says a node follows.
        unsafe { self.node.as_ref() }
            .next
            .store(node.as_ptr(), Ordering::Release);
        self.node = node;
    }
}

impl<T> Head<T> {
    /// Unlink the first element, promote its node to dummy, free the old dummy.
    ///
    /// # Safety
    /// Caller holds the remove lock and has observed a non-zero element count.
    pub(crate) unsafe fn pop_front(&mut self) -> T {
        let old = self.node;
        // SAFETY: `old` is owned by this cursor.
        let first = unsafe { old.as_ref() }.next.load(Ordering::Acquire);
        debug_assert!(!first.is_null(), "pop_front on an empty list");
        // SAFETY: a non-zero count means a linked node follows the head.
        let first = unsafe { NonNull::new_unchecked(first) };

        self.node = first;
        // Producers may be writing `first.next` concurrently; only the element
        // slot is touched here.
        unsafe {
            let item = ptr::addr_of_mut!((*first.as_ptr()).item).read().assume_init();
            Node::free(old);
            item
        }
    }

    /// Borrow the first element.
    ///
    /// # Safety
    /// Caller holds the remove lock and has observed a non-zero element count.
    pub(crate) unsafe fn front(&self) -> &T {
        unsafe {
            let first = self.node.as_ref().next.load(Ordering::Acquire);
            debug_assert!(!first.is_null(), "front on an empty list");
            (*ptr::addr_of!((*first).item)).assume_init_ref()
        }
    }

    /// Unlink every node after the head and reset the tail onto the head.
    ///
    /// The detached nodes are returned as a [`Chain`] so their elements can be
    /// dropped after both locks are released.
    ///
    /// # Safety
    /// `tail` must be the other half of the list this head belongs to, and the
    /// caller must hold both locks (or have exclusive access to the queue).
    pub(crate) unsafe fn detach_all(&mut self, tail: &mut Tail<T>) -> Chain<T> {
        // SAFETY: `self.node` is owned by this cursor.
        let first = unsafe { self.node.as_ref() }
            .next
            .swap(ptr::null_mut(), Ordering::AcqRel);
        tail.node = self.node;
        Chain {
            next: first,
            _owns: PhantomData,
        }
    }
}

impl<T> Drop for Head<T> {
    fn drop(&mut self) {
        // The head owns the whole list. Everything after it still carries an
        // element; the head's own slot is uninitialized.
        let rest = Chain {
            next: unsafe { self.node.as_ref() }.next.load(Ordering::Acquire),
            _owns: PhantomData::<T>,
        };
        unsafe { Node::free(self.node) };
        drop(rest);
    }
}

/// Nodes unlinked by [`Head::detach_all`]. Dropping it drops every element.
pub(crate) struct Chain<T> {
    next: *mut Node<T>,
    _owns: PhantomData<T>,
}

impl<T> Chain<T> {
    /// Unlink the first node, free it and hand its element out.
    fn take_first(&mut self) -> Option<T> {
        let node = NonNull::new(self.next)?;
        // SAFETY: detached nodes are exclusively owned by the chain and all of
        // them still carry their element.
        unsafe {
            self.next = node.as_ref().next.load(Ordering::Acquire);
            Some(Node::into_item(node))
        }
    }
}

impl<T> Drop for Chain<T> {
    fn drop(&mut self) {
        // Keeps releasing the rest of the chain if an element's destructor
        // panics.
        struct Rest<'a, T>(&'a mut Chain<T>);

        impl<T> Drop for Rest<'_, T> {
            fn drop(&mut self) {
                while let Some(item) = self.0.take_first() {
                    drop(item);
                }
            }
        }

        while let Some(item) = self.take_first() {
            let rest = Rest(&mut *self);
            drop(item);
            mem::forget(rest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn push<T>(tail: &mut Tail<T>, item: T) {
        let node = Node::alloc(item).unwrap_or_else(|_| panic!("allocation failed"));
        tail.push_back(node);
    }

    #[test]
    fn push_then_pop_is_fifo() {
        let (mut head, mut tail) = list();
        push(&mut tail, 1);
        push(&mut tail, 2);
        push(&mut tail, 3);

        unsafe {
            assert_eq!(*head.front(), 1);
            assert_eq!(head.pop_front(), 1);
            assert_eq!(head.pop_front(), 2);
            assert_eq!(*head.front(), 3);
            assert_eq!(head.pop_front(), 3);
        }
        assert_eq!(head.node, tail.node);
    }

    #[test]
    fn detached_chain_drops_each_element_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let (mut head, mut tail) = list();
        for _ in 0..5 {
            push(&mut tail, DropCounter(drops.clone()));
        }

        // The popped element is handed out, not dropped by the list.
        let popped = unsafe { head.pop_front() };
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        let chain = unsafe { head.detach_all(&mut tail) };
        assert_eq!(head.node, tail.node);
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        drop(chain);
        assert_eq!(drops.load(Ordering::SeqCst), 4);

        drop(popped);
        assert_eq!(drops.load(Ordering::SeqCst), 5);

        // The list is usable again after being emptied.
        push(&mut tail, DropCounter(drops.clone()));
        drop(unsafe { head.pop_front() });
        assert_eq!(drops.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn dropping_head_releases_remaining_nodes() {
        let drops = Arc::new(AtomicUsize::new(0));
        let (head, mut tail) = list();
        for _ in 0..3 {
            push(&mut tail, DropCounter(drops.clone()));
        }

        drop(tail);
        drop(head);
        assert_eq!(drops.load(Ordering::SeqCst), 3);
    }

    struct PanicOnDrop {
        drops: Arc<AtomicUsize>,
        panics: bool,
    }

    impl Drop for PanicOnDrop {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
            if self.panics {
                panic!("element destructor failed");
            }
        }
    }

    #[test]
    fn panicking_element_does_not_leak_the_rest_of_the_chain() {
        let drops = Arc::new(AtomicUsize::new(0));
        let (mut head, mut tail) = list();
        for i in 0..4 {
            push(
                &mut tail,
                PanicOnDrop {
                    drops: drops.clone(),
                    panics: i == 0,
                },
            );
        }

        let chain = unsafe { head.detach_all(&mut tail) };
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| drop(chain)));
        assert!(result.is_err());
        assert_eq!(drops.load(Ordering::SeqCst), 4);
        assert_eq!(head.node, tail.node);
    }

    #[test]
    fn unlinked_node_gives_its_element_back() {
        let node = Node::alloc(String::from("kept")).unwrap_or_else(|_| panic!("allocation failed"));
        let item = unsafe { Node::into_item(node) };
        assert_eq!(item, "kept");
    }
}
