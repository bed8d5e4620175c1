//! Fair (FIFO) serialized access
//!
//! Threads take a ticket and are admitted strictly in ticket order. The
//! waiting queue is bounded: a full queue is an error rather than an
//! unbounded wait. Every wait observes the session cancellation flag so a
//! broadcast exception can never leave a thread parked here.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use tracing::trace;

use crate::control::{Cancellation, Wake};
use crate::error::{Result, RtcpError};

#[derive(Debug, Default)]
struct TicketQueue {
    /// Ticket currently holding the access, 0 when free
    holder: u64,
    waiting: VecDeque<u64>,
    next: u64,
}

pub struct SerializedAccess {
    name: &'static str,
    capacity: usize,
    queue: Mutex<TicketQueue>,
    cond: Condvar,
}

/// A place in the queue. Dropping it without waiting gives the place up.
pub struct Ticket<'a> {
    access: &'a SerializedAccess,
    id: u64,
}

/// Exclusive access; released on drop
pub struct SerialGuard<'a> {
    access: &'a SerializedAccess,
    id: u64,
}

impl SerializedAccess {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity: capacity.max(1),
            queue: Mutex::new(TicketQueue::default()),
            cond: Condvar::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Join the queue without blocking
    pub fn enqueue(&self) -> Result<Ticket<'_>> {
        let mut q = self.queue.lock();
        if q.waiting.len() >= self.capacity {
            return Err(RtcpError::QueueFull(self.name));
        }
        q.next += 1;
        let id = q.next;
        q.waiting.push_back(id);
        trace!(lock = self.name, ticket = id, queued = q.waiting.len(), "enqueue");
        Ok(Ticket { access: self, id })
    }

    /// Join the queue and wait for our turn
    pub fn acquire(&self, cancel: &Cancellation) -> Result<SerialGuard<'_>> {
        self.enqueue()?.wait(cancel)
    }

    /// Number of threads waiting (not counting the holder)
    pub fn waiting(&self) -> usize {
        self.queue.lock().waiting.len()
    }

    pub fn is_held(&self) -> bool {
        self.queue.lock().holder != 0
    }

    fn leave(&self, id: u64) {
        let mut q = self.queue.lock();
        q.waiting.retain(|t| *t != id);
        // Head of queue may have changed
        self.cond.notify_all();
    }
}

impl Wake for SerializedAccess {
    fn wake_all(&self) {
        let _q = self.queue.lock();
        self.cond.notify_all();
    }
}

impl<'a> Ticket<'a> {
    /// Block until this ticket is at the head of the queue and the access is
    /// free, or until the session is cancelled.
    pub fn wait(self, cancel: &Cancellation) -> Result<SerialGuard<'a>> {
        let access = self.access;
        let id = self.id;
        std::mem::forget(self);

        let mut q = access.queue.lock();
        loop {
            if cancel.is_cancelled() {
                q.waiting.retain(|t| *t != id);
                access.cond.notify_all();
                return Err(RtcpError::Cancelled);
            }
            if q.holder == 0 && q.waiting.front() == Some(&id) {
                q.waiting.pop_front();
                q.holder = id;
                return Ok(SerialGuard { access, id });
            }
            access.cond.wait(&mut q);
        }
    }
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        self.access.leave(self.id);
    }
}

impl Drop for SerialGuard<'_> {
    fn drop(&mut self) {
        let mut q = self.access.queue.lock();
        if q.holder == self.id {
            q.holder = 0;
        }
        self.access.cond.notify_all();
    }
}
