//! Lock free multi-producer, single-consumer message queue.
//!
//! The queue is a singly linked list with atomic head and tail pointers. The
//! tail pointer is only ever a hint: the authoritative append point is the
//! unique node whose `next` pointer is null, and producers walk forward from
//! the hint before attempting to install a new node with a compare-and-swap.
//!
//! Only one consumer may pop. This is enforced by convention (the writer owns
//! the consuming end); a failed pop CAS indicates a second consumer and is
//! treated as a programming error rather than retried.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crate::message::Message;

/// Producers give up after this many failed append attempts.
const PUSH_RETRY_LIMIT: usize = 100;

struct Node {
    msg: Option<Message>,
    next: AtomicPtr<Node>,
}

impl Node {
    fn boxed(msg: Message) -> *mut Node {
        Box::into_raw(Box::new(Node {
            msg: Some(msg),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }
}

/// Multi-producer single-consumer FIFO of [`Message`]s.
pub struct MessageQueue {
    head: AtomicPtr<Node>,
    tail: AtomicPtr<Node>,
    valid: AtomicBool,
}

unsafe impl Send for MessageQueue {}
unsafe impl Sync for MessageQueue {}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageQueue {
    /// Create an empty queue. The queue refuses pushes until [`init`] has
    /// been called.
    ///
    /// [`init`]: MessageQueue::init
    pub fn new() -> Self {
        MessageQueue {
            head: AtomicPtr::new(ptr::null_mut()),
            tail: AtomicPtr::new(ptr::null_mut()),
            valid: AtomicBool::new(false),
        }
    }

    /// Mark the queue ready for use. Fails if the queue is already valid or
    /// partially populated. The validity flag is set last.
    pub fn init(&self) -> bool {
        if self.valid.load(Ordering::Acquire)
            || !self.head.load(Ordering::Acquire).is_null()
            || !self.tail.load(Ordering::Acquire).is_null()
        {
            return false;
        }
        self.valid.store(true, Ordering::Release);
        true
    }

    #[inline(always)]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Append a message. Ownership transfers to the queue on success; on
    /// failure the message is dropped and false is returned.
    ///
    /// Messages from a single producer are dequeued in push order. The global
    /// order across producers is whatever order the append CASes linearize
    /// in.
    pub fn push(&self, msg: Message) -> bool {
        if !self.is_valid() {
            return false;
        }
        let node = Node::boxed(msg);

        // Empty queue: install as both head and tail
        if self.head.load(Ordering::Acquire).is_null() {
            if self
                .head
                .compare_exchange(ptr::null_mut(), node, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.tail.store(node, Ordering::Release);
                return true;
            }
            // Lost the race; fall through to the append path
        }

        let mut qi = self.tail.load(Ordering::Acquire);
        if qi.is_null() {
            qi = self.head.load(Ordering::Acquire);
        }
        if qi.is_null() {
            // Queue emptied under us and someone else holds the install
            // race. Rather than spin on the head CAS, fail the push.
            unsafe { drop(Box::from_raw(node)) };
            return false;
        }

        let mut attempts = 0;
        while attempts < PUSH_RETRY_LIMIT {
            // Walk from the hint to the true tail
            unsafe {
                loop {
                    let next = (*qi).next.load(Ordering::Acquire);
                    if next.is_null() {
                        break;
                    }
                    qi = next;
                }
                if (*qi)
                    .next
                    .compare_exchange(ptr::null_mut(), node, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    // On contention another producer may already have
                    // appended behind us, which is fine: the hint only needs
                    // to be near the end of the list.
                    self.tail.store(node, Ordering::Release);
                    return true;
                }
            }
            attempts += 1;
        }

        unsafe { drop(Box::from_raw(node)) };
        false
    }

    /// Detach and return the oldest message.
    ///
    /// Single consumer only. A failed head CAS means a second consumer is
    /// racing us; per the queue contract that is a programming error and the
    /// pop is abandoned rather than retried.
    pub fn pop(&self) -> Option<Message> {
        if !self.is_valid() {
            return None;
        }
        let head = self.head.load(Ordering::Acquire);
        if head.is_null() {
            return None;
        }
        let next = unsafe { (*head).next.load(Ordering::Acquire) };
        if self
            .head
            .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // Drop the stale tail hint if it pointed at the node we removed
            let _ = self
                .tail
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire);
            let mut node = unsafe { Box::from_raw(head) };
            node.msg.take()
        } else {
            None
        }
    }

    /// Number of queued messages, by traversal. Returns `None` if the queue
    /// is invalid.
    pub fn count(&self) -> Option<usize> {
        if !self.is_valid() {
            return None;
        }
        let mut count = 0;
        let mut node = self.head.load(Ordering::Acquire);
        while !node.is_null() {
            count += 1;
            node = unsafe { (*node).next.load(Ordering::Acquire) };
        }
        Some(count)
    }

    /// Invalidate the queue and free any remaining nodes and their messages.
    /// The validity flag is cleared first so concurrent pushes fail fast.
    pub fn destroy(&self) {
        self.valid.store(false, Ordering::Release);
        let mut node = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
        self.tail.store(ptr::null_mut(), Ordering::Release);
        while !node.is_null() {
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next.load(Ordering::Acquire);
        }
    }
}

impl Drop for MessageQueue {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn push_requires_init() {
        let q = MessageQueue::new();
        assert!(!q.push(Message::new_float(1, 4, 0.0)));
        assert!(q.init());
        assert!(!q.init(), "double init must be refused");
        assert!(q.push(Message::new_float(1, 4, 0.0)));
        assert_eq!(q.count(), Some(1));
    }

    #[test]
    fn pop_returns_push_order() {
        let q = MessageQueue::new();
        q.init();
        for i in 0..100u32 {
            assert!(q.push(Message::new_timestamp(2, 2, i)));
        }
        for i in 0..100u32 {
            let m = q.pop().expect("message expected");
            assert_eq!(m.value, crate::message::DataValue::Timestamp(i));
        }
        assert!(q.pop().is_none());
        assert_eq!(q.count(), Some(0));
    }

    #[test]
    fn invalid_queue_rejects_everything() {
        let q = MessageQueue::new();
        q.init();
        q.push(Message::new_float(1, 4, 1.0));
        q.destroy();
        assert!(!q.push(Message::new_float(1, 4, 2.0)));
        assert!(q.pop().is_none());
        assert_eq!(q.count(), None);
    }

    #[test]
    fn no_loss_under_producer_contention() {
        const PRODUCERS: usize = 8;
        const PER_PRODUCER: u32 = 500;

        let q = Arc::new(MessageQueue::new());
        q.init();
        let mut handles = Vec::new();
        for p in 0..PRODUCERS {
            let q = Arc::clone(&q);
            handles.push(std::thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    assert!(q.push(Message::new_timestamp(p as u8, 2, i)));
                }
            }));
        }
        for h in handles {
            h.join().expect("producer panicked");
        }

        // Per-producer FIFO: timestamps from any one source must be strictly
        // increasing in the drain order.
        let mut last_seen = [None::<u32>; PRODUCERS];
        let mut total = 0usize;
        while let Some(m) = q.pop() {
            total += 1;
            if let crate::message::DataValue::Timestamp(t) = m.value {
                let slot = &mut last_seen[m.source as usize];
                if let Some(prev) = *slot {
                    assert!(t > prev, "per-producer order violated");
                }
                *slot = Some(t);
            }
        }
        assert_eq!(total, PRODUCERS * PER_PRODUCER as usize);
    }
}
