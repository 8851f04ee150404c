// =============================================================================
// ARNm Runtime — Process Mailbox (lock-free MPSC queue)
// =============================================================================
//
// Each process owns exactly one mailbox. Any thread may send into it; only
// the owning process consumes from it. The queue is the classic
// dummy-node MPSC shape: producers contend only on `tail` (an atomic
// exchange), the consumer walks `next` links from `head`, and `head`
// always points at a dummy — the node whose payload was consumed last.
//
//   head ──► [dummy] ──next──► [msg] ──► [msg] ──► null ◄── tail
//
// SEND:    link a fresh envelope after the current tail.
// RECEIVE: if the dummy's `next` is null the queue is empty; otherwise
//          move `next`'s payload into the dummy, advance `head`, and hand
//          the *old* dummy to the caller as the message. `next` is the new
//          dummy. Every delivered message therefore recycles one node.
//
// Payloads are copied at send time when a size is given; a zero-size send
// adopts the raw data pointer without copying (the compiler uses this for
// immediates and pre-owned buffers).
//
// Envelopes come from a per-thread block pool (memory/pool.rs): allocated
// on the sending thread, freed into the receiving thread's pool.
//
// `count` is advisory and may briefly lag the linked list under
// contention; emptiness is defined by it.
// =============================================================================

use std::alloc::{self, Layout};
use std::cell::RefCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::memory::pool::BlockPool;

/// Envelopes a thread's pool will retain for reuse.
const ENVELOPE_POOL_CAP: usize = 256;

/// Message payloads are aligned generously so compiled code can overlay
/// any of its struct layouts on the bytes.
const PAYLOAD_ALIGN: usize = 16;

thread_local! {
    static ENVELOPE_POOL: RefCell<BlockPool> = RefCell::new(BlockPool::new(
        size_of::<Envelope>(),
        align_of::<Envelope>(),
        ENVELOPE_POOL_CAP,
    ));
}

// =============================================================================
// Envelope
// =============================================================================

/// A mailbox node: tag, payload, and the intrusive queue link.
///
/// This is also the message handle the receiver gets back — the ABI's
/// `arnm_message_*` accessors read these fields.
#[repr(C)]
pub struct Envelope {
    /// Next node toward the tail; null at the tail.
    next: AtomicPtr<Envelope>,
    /// User-defined 64-bit tag, matched by compiled receive blocks.
    pub(crate) tag: u64,
    /// Payload bytes (owned copy when `size > 0`, adopted pointer otherwise).
    pub(crate) data: *mut u8,
    /// Payload size in bytes; 0 means `data` was adopted, not copied.
    pub(crate) size: usize,
}

impl Envelope {
    /// The message's 64-bit tag.
    pub fn tag(&self) -> u64 {
        self.tag
    }

    /// The payload pointer (an owned copy, or the adopted pointer for
    /// zero-size sends).
    pub fn data(&self) -> *mut u8 {
        self.data
    }

    /// Payload size in bytes; 0 for adopted-pointer sends.
    pub fn size(&self) -> usize {
        self.size
    }
}

fn payload_layout(size: usize) -> Option<Layout> {
    Layout::from_size_align(size, PAYLOAD_ALIGN).ok()
}

/// Allocate an envelope from the calling thread's pool.
fn alloc_envelope(tag: u64, data: *mut u8, size: usize) -> *mut Envelope {
    ENVELOPE_POOL.with(|pool| {
        let raw = pool.borrow_mut().alloc() as *mut Envelope;
        if raw.is_null() {
            return raw;
        }
        // SAFETY: `raw` is fresh, correctly sized and aligned for Envelope.
        unsafe {
            raw.write(Envelope {
                next: AtomicPtr::new(ptr::null_mut()),
                tag,
                data,
                size,
            });
        }
        raw
    })
}

/// Free a message envelope: release the owned payload (copied sends only)
/// and return the node to the calling thread's pool.
///
/// # Safety
/// `env` must be a delivered message or a retired dummy, not reachable
/// from any mailbox.
pub unsafe fn free_envelope(env: *mut Envelope) {
    unsafe {
        let size = (*env).size;
        if size > 0 {
            let layout = payload_layout(size).expect("payload layout");
            alloc::dealloc((*env).data, layout);
        }
        ENVELOPE_POOL.with(|pool| pool.borrow_mut().free(env as *mut u8));
    }
}

// =============================================================================
// Mailbox
// =============================================================================

/// The MPSC message queue owned by one process.
pub struct Mailbox {
    /// Consumer end; always points at the current dummy node.
    head: AtomicPtr<Envelope>,
    /// Producer end; the most recently linked node.
    tail: AtomicPtr<Envelope>,
    /// Advisory message count.
    count: AtomicUsize,
}

// SAFETY: producers only touch `tail` and a published node's `next`;
// the single consumer (the owning process) is the only toucher of `head`
// and of dummy payload fields. Exactly-one-consumer is enforced by
// process ownership.
unsafe impl Send for Mailbox {}
unsafe impl Sync for Mailbox {}

impl Mailbox {
    /// Create a mailbox with a fresh dummy node.
    pub fn new() -> Result<Mailbox, &'static str> {
        let dummy = alloc_envelope(0, ptr::null_mut(), 0);
        if dummy.is_null() {
            return Err("mailbox dummy allocation failed");
        }
        Ok(Mailbox {
            head: AtomicPtr::new(dummy),
            tail: AtomicPtr::new(dummy),
            count: AtomicUsize::new(0),
        })
    }

    /// Append a message. Callable from any thread.
    ///
    /// `size > 0` copies that many bytes from `data` into an owned payload;
    /// `size == 0` adopts `data` as the payload pointer without copying.
    pub fn send(&self, tag: u64, data: *const u8, size: usize) -> Result<(), &'static str> {
        let payload = if size > 0 {
            if data.is_null() {
                return Err("send: null payload with nonzero size");
            }
            let layout = payload_layout(size).ok_or("send: payload size overflow")?;
            // SAFETY: layout is nonzero-sized here.
            let copy = unsafe { alloc::alloc(layout) };
            if copy.is_null() {
                return Err("send: payload allocation failed");
            }
            // SAFETY: `data` is readable for `size` bytes per the contract;
            // `copy` is a fresh allocation of that size.
            unsafe { ptr::copy_nonoverlapping(data, copy, size) };
            copy
        } else {
            data as *mut u8
        };

        let node = alloc_envelope(tag, payload, size);
        if node.is_null() {
            if size > 0 {
                // SAFETY: freeing the copy we just made.
                unsafe { alloc::dealloc(payload, payload_layout(size).unwrap()) };
            }
            return Err("send: envelope allocation failed");
        }

        // The count leads the list: incrementing before the node is
        // reachable means the consumer's decrement can never underflow,
        // at the cost of `len()` briefly over-reporting.
        self.count.fetch_add(1, Ordering::Release);
        // Publish: the release exchange makes the payload writes visible
        // to whoever follows the link; the previous tail's `next` is the
        // only word a consumer will cross to reach the new node.
        let prev = self.tail.swap(node, Ordering::AcqRel);
        // SAFETY: `prev` is either the dummy or a node no consumer frees
        // until its `next` is published — which is exactly this store.
        unsafe { (*prev).next.store(node, Ordering::Release) };
        Ok(())
    }

    /// Dequeue one message if present. Only the owning process may call.
    ///
    /// Returns the message envelope; the caller owns it and must free it
    /// with [`free_envelope`] (ABI: `arnm_message_free`).
    pub fn try_receive(&self) -> Option<*mut Envelope> {
        let dummy = self.head.load(Ordering::Relaxed);
        // Acquire pairs with the producer's release store of `next`.
        let next = unsafe { (*dummy).next.load(Ordering::Acquire) };
        if next.is_null() {
            return None;
        }
        // Move the delivered payload into the old dummy and retire `next`
        // as the new dummy (its payload fields are cleared so a mailbox
        // drop won't free the payload twice).
        unsafe {
            (*dummy).tag = (*next).tag;
            (*dummy).data = (*next).data;
            (*dummy).size = (*next).size;
            (*next).tag = 0;
            (*next).data = ptr::null_mut();
            (*next).size = 0;
        }
        self.head.store(next, Ordering::Relaxed);
        self.count.fetch_sub(1, Ordering::Release);
        Some(dummy)
    }

    /// Advisory message count.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Emptiness as defined by the advisory count.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        // Drain unread messages, then free the trailing dummy.
        while let Some(msg) = self.try_receive() {
            // SAFETY: `msg` was just dequeued; nobody else owns it.
            unsafe { free_envelope(msg) };
        }
        let dummy = self.head.load(Ordering::Relaxed);
        // SAFETY: the queue is empty, so `dummy` is unreachable from
        // producers that could still hold `&self` — dropping the mailbox
        // means its owning process is gone and senders are done.
        unsafe { free_envelope(dummy) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn recv_all(mbox: &Mailbox) -> Vec<(u64, Vec<u8>)> {
        let mut out = Vec::new();
        while let Some(msg) = mbox.try_receive() {
            unsafe {
                let bytes = if (*msg).size > 0 {
                    std::slice::from_raw_parts((*msg).data, (*msg).size).to_vec()
                } else {
                    Vec::new()
                };
                out.push(((*msg).tag, bytes));
                free_envelope(msg);
            }
        }
        out
    }

    #[test]
    fn roundtrip_preserves_tag_and_bytes() {
        let mbox = Mailbox::new().unwrap();
        let payload = [1u8, 2, 3, 4, 5];
        mbox.send(7, payload.as_ptr(), payload.len()).unwrap();
        assert_eq!(mbox.len(), 1);

        let got = recv_all(&mbox);
        assert_eq!(got, vec![(7, payload.to_vec())]);
        assert!(mbox.is_empty());
    }

    #[test]
    fn zero_size_send_adopts_pointer() {
        let mbox = Mailbox::new().unwrap();
        let sentinel = 0x1000_0001usize as *const u8;
        mbox.send(9, sentinel, 0).unwrap();

        let msg = mbox.try_receive().unwrap();
        unsafe {
            assert_eq!((*msg).tag, 9);
            assert_eq!((*msg).data, sentinel as *mut u8);
            assert_eq!((*msg).size, 0);
            free_envelope(msg);
        }
    }

    #[test]
    fn null_payload_with_size_is_rejected() {
        let mbox = Mailbox::new().unwrap();
        assert!(mbox.send(1, ptr::null(), 8).is_err());
        assert!(mbox.is_empty());
    }

    #[test]
    fn fifo_order_for_a_single_sender() {
        let mbox = Mailbox::new().unwrap();
        for tag in 0..100u64 {
            mbox.send(tag, ptr::null(), 0).unwrap();
        }
        let tags: Vec<u64> = recv_all(&mbox).into_iter().map(|(t, _)| t).collect();
        assert_eq!(tags, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn mpsc_delivers_all_in_per_producer_order() {
        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 2_000;

        let mbox = Arc::new(Mailbox::new().unwrap());
        let handles: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let mbox = Arc::clone(&mbox);
                std::thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        // Tag encodes (producer, sequence).
                        let tag = (p << 32) | i;
                        let seq = i.to_le_bytes();
                        mbox.send(tag, seq.as_ptr(), seq.len()).unwrap();
                    }
                })
            })
            .collect();

        let mut next_expected = [0u64; PRODUCERS as usize];
        let mut received = 0u64;
        while received < PRODUCERS * PER_PRODUCER {
            let Some(msg) = mbox.try_receive() else {
                std::hint::spin_loop();
                continue;
            };
            unsafe {
                let producer = ((*msg).tag >> 32) as usize;
                let seq = (*msg).tag & 0xFFFF_FFFF;
                assert_eq!(
                    seq, next_expected[producer],
                    "per-producer send order violated"
                );
                let bytes = std::slice::from_raw_parts((*msg).data, (*msg).size);
                assert_eq!(bytes, &seq.to_le_bytes()[..]);
                next_expected[producer] += 1;
                free_envelope(msg);
            }
            received += 1;
        }

        for h in handles {
            h.join().unwrap();
        }
        assert!(mbox.is_empty());
    }

    #[test]
    fn drop_drains_unread_messages() {
        let mbox = Mailbox::new().unwrap();
        let payload = [0xEEu8; 32];
        for tag in 0..10 {
            mbox.send(tag, payload.as_ptr(), payload.len()).unwrap();
        }
        drop(mbox); // must free the 10 payloads and the dummy
    }
}
