//! Lock-free recorder stacks and owned recorder chains.
//!
//! The recorder pool and the pending queue are both intrusive LIFO stacks
//! keyed on the recorder's `next` link, with the head updated by
//! compare-and-swap. Ownership of a recorder transfers into the stack on
//! push and back out on pop; the stack is the only place a recorder is ever
//! reachable from more than one thread.

use std::ptr;
use std::sync::atomic;
use std::sync::atomic::{AtomicPtr, AtomicUsize};

use crate::recorder::Recorder;

/// A lock-free LIFO stack of recorders.
#[derive(Debug)]
pub(crate) struct RecorderStack {
    head: AtomicPtr<Recorder>,
    len: AtomicUsize,
}

impl RecorderStack {
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            len: AtomicUsize::new(0),
        }
    }

    /// Pushes a recorder, transferring its ownership into the stack.
    pub(crate) fn push(&self, recorder: Box<Recorder>) {
        let raw = Box::into_raw(recorder);

        let mut head = self.head.load(atomic::Ordering::Acquire);
        loop {
            // SAFETY: We own `raw` until the CAS below publishes it; nothing
            // else can observe the node while we write its link.
            unsafe {
                (*raw).set_next(head);
            }

            match self.head.compare_exchange_weak(
                head,
                raw,
                atomic::Ordering::Release,
                atomic::Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }

        self.len.fetch_add(1, atomic::Ordering::Relaxed);
    }

    /// Pops the most recently pushed recorder, if any.
    pub(crate) fn pop(&self) -> Option<Box<Recorder>> {
        let mut head = self.head.load(atomic::Ordering::Acquire);
        loop {
            if head.is_null() {
                return None;
            }

            // SAFETY: A linked node is never freed while it is reachable from
            // the head; recorders leave the stack (and are unlinked) before
            // being dropped, so `head` stays valid for this read even if we
            // lose the CAS race below.
            let next = unsafe { (*head).next() };

            match self.head.compare_exchange_weak(
                head,
                next,
                atomic::Ordering::Acquire,
                atomic::Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.len.fetch_sub(1, atomic::Ordering::Relaxed);

                    // SAFETY: The successful CAS removed the node from the
                    // stack, making us its unique owner again. It was created
                    // by `Box::into_raw` in `push`.
                    let mut recorder = unsafe { Box::from_raw(head) };
                    recorder.set_next(ptr::null_mut());
                    return Some(recorder);
                }
                Err(current) => head = current,
            }
        }
    }

    /// Detaches the entire stack contents as one owned chain, leaving the
    /// stack empty. The chain is in LIFO-of-arrival order.
    pub(crate) fn drain(&self) -> RecorderChain {
        let head = self.head.swap(ptr::null_mut(), atomic::Ordering::AcqRel);
        self.len.store(0, atomic::Ordering::Relaxed);

        // SAFETY: The swap removed every linked node from shared reach in one
        // step; the chain now exclusively owns them.
        unsafe { RecorderChain::from_raw(head) }
    }

    pub(crate) fn len(&self) -> usize {
        self.len.load(atomic::Ordering::Relaxed)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(atomic::Ordering::Acquire).is_null()
    }
}

impl Drop for RecorderStack {
    fn drop(&mut self) {
        drop(self.drain());
    }
}

/// An exclusively owned, linked batch of recorders.
///
/// Produced by draining the pending queue; consumed by the merge worker one
/// recorder at a time. Dropping the chain drops every recorder still in it.
#[derive(Debug)]
pub(crate) struct RecorderChain {
    head: *mut Recorder,
}

// SAFETY: The chain exclusively owns every linked node; moving the chain
// moves that ownership wholesale.
unsafe impl Send for RecorderChain {}

impl RecorderChain {
    pub(crate) fn empty() -> Self {
        Self {
            head: ptr::null_mut(),
        }
    }

    /// Takes ownership of a raw linked list of recorders.
    ///
    /// # Safety
    ///
    /// `head` must be null or the head of a `next`-linked list of recorders
    /// originally produced by `Box::into_raw`, with no other owner.
    pub(crate) unsafe fn from_raw(head: *mut Recorder) -> Self {
        Self { head }
    }

    pub(crate) fn push_front(&mut self, mut recorder: Box<Recorder>) {
        recorder.set_next(self.head);
        self.head = Box::into_raw(recorder);
    }

    /// Appends another chain after the last recorder of this one.
    pub(crate) fn append(&mut self, other: RecorderChain) {
        let other_head = other.head;
        // The raw nodes change hands manually; `other` must not drop them.
        std::mem::forget(other);

        if self.head.is_null() {
            self.head = other_head;
            return;
        }

        let mut tail = self.head;
        // SAFETY: Every node in the chain is exclusively owned by us and
        // remains valid while we walk the links.
        unsafe {
            while !(*tail).next().is_null() {
                tail = (*tail).next();
            }
            (*tail).set_next(other_head);
        }
    }

    pub(crate) fn pop(&mut self) -> Option<Box<Recorder>> {
        if self.head.is_null() {
            return None;
        }

        // SAFETY: The chain owns its nodes; `head` came from `Box::into_raw`.
        let mut recorder = unsafe { Box::from_raw(self.head) };
        self.head = recorder.next();
        recorder.set_next(ptr::null_mut());
        Some(recorder)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    pub(crate) fn count(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.head;
        while !cursor.is_null() {
            count += 1;
            // SAFETY: Owned, valid nodes as above.
            cursor = unsafe { (*cursor).next() };
        }
        count
    }
}

impl Drop for RecorderChain {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}
