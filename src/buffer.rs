//! Fixed pool of transfer buffers shared by the tape worker and disk workers
//!
//! Each buffer cycles Empty -> Filling -> Full -> Draining -> Empty. The
//! producer takes a [`FillLease`], the consumer a [`DrainLease`]; a lease
//! moves the buffer's memory out of the slot for its lifetime and puts it
//! back on drop, so at any moment a buffer is owned by at most one side.

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::control::{Cancellation, Wake};
use crate::error::{Result, RtcpError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Empty,
    Filling,
    Full,
    Draining,
}

#[derive(Debug)]
struct Slot {
    state: BufferState,
    /// None while leased out or after the pool was freed
    data: Option<Vec<u8>>,
    length: usize,
    end_of_tape_file: bool,
    last_buffer: bool,
    waiters: usize,
    freed: bool,
}

pub struct Buffer {
    index: usize,
    slot: Mutex<Slot>,
    cond: Condvar,
}

pub struct BufferPool {
    buffers: Vec<Buffer>,
    buffer_size: usize,
}

/// Per-buffer size for a configured total pool size
pub fn buffer_size_for(total: usize, count: usize) -> usize {
    total / count.max(1)
}

/// Available memory using sysinfo. 0 when the platform can't tell us.
fn available_memory() -> u64 {
    use sysinfo::System;
    let mut sys = System::new();
    sys.refresh_memory();
    sys.available_memory()
}

impl BufferPool {
    /// Allocate `count` buffers of `size` bytes each.
    ///
    /// Fails with OutOfMemory (reselect another server) when the host does
    /// not have the memory; nothing is kept from a partial allocation.
    pub fn allocate(count: usize, size: usize) -> Result<Self> {
        if count == 0 || size == 0 {
            return Err(RtcpError::InvalidRequest(format!(
                "invalid buffer pool geometry {count} x {size}"
            )));
        }
        let total = (count as u64).saturating_mul(size as u64);
        let available = available_memory();
        if available > 0 && total > available {
            warn!(total, available, "buffer pool does not fit in available memory");
            return Err(RtcpError::OutOfMemory { count, size });
        }

        let mut buffers = Vec::with_capacity(count);
        for index in 0..count {
            let mut data = Vec::new();
            data.try_reserve_exact(size)
                .map_err(|_| RtcpError::OutOfMemory { count, size })?;
            buffers.push(Buffer {
                index,
                slot: Mutex::new(Slot {
                    state: BufferState::Empty,
                    data: Some(data),
                    length: 0,
                    end_of_tape_file: false,
                    last_buffer: false,
                    waiters: 0,
                    freed: false,
                }),
                cond: Condvar::new(),
            });
        }
        info!(count, size, "allocated buffer pool");
        Ok(Self {
            buffers,
            buffer_size: size,
        })
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn buffer(&self, index: usize) -> &Buffer {
        &self.buffers[index % self.buffers.len()]
    }

    /// Bytes of each buffer usable for a file with the given block size: the
    /// largest multiple of the block size that fits. None if not even one
    /// block fits.
    pub fn useful_size(&self, block_size: usize) -> Option<usize> {
        if block_size == 0 || block_size > self.buffer_size {
            return None;
        }
        Some((self.buffer_size / block_size) * block_size)
    }

    /// Return every buffer to Empty with cleared flags, ready for a retry.
    /// Must only be called when no worker holds a lease.
    pub fn reset(&self) {
        for b in &self.buffers {
            let mut slot = b.slot.lock();
            if slot.waiters > 0 {
                warn!(buffer = b.index, waiters = slot.waiters, "resetting buffer with waiters");
            }
            slot.state = BufferState::Empty;
            slot.length = 0;
            slot.end_of_tape_file = false;
            slot.last_buffer = false;
            if let Some(data) = slot.data.as_mut() {
                data.clear();
            }
            b.cond.notify_all();
        }
    }

    /// Release the data areas; metadata survives until the pool is dropped
    pub fn free(&self) {
        let mut released = 0usize;
        for b in &self.buffers {
            let mut slot = b.slot.lock();
            if slot.data.take().is_some() {
                released += 1;
            }
            slot.freed = true;
            slot.state = BufferState::Empty;
            slot.length = 0;
            b.cond.notify_all();
        }
        debug!(released, "freed buffer pool data");
    }

    /// Buffers whose data area is still allocated and not leased out
    pub fn owned_count(&self) -> usize {
        self.buffers
            .iter()
            .filter(|b| b.slot.lock().data.is_some())
            .count()
    }
}

impl Wake for BufferPool {
    fn wake_all(&self) {
        for b in &self.buffers {
            let _slot = b.slot.lock();
            b.cond.notify_all();
        }
    }
}

impl Buffer {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> BufferState {
        self.slot.lock().state
    }

    /// Block until the buffer is in `want`, the pool was freed, or the
    /// session is cancelled. Returns with the slot locked.
    fn wait_for(
        &self,
        want: BufferState,
        cancel: &Cancellation,
    ) -> Result<parking_lot::MutexGuard<'_, Slot>> {
        let mut slot = self.slot.lock();
        loop {
            if cancel.is_cancelled() || slot.freed {
                return Err(RtcpError::Cancelled);
            }
            if slot.state == want {
                return Ok(slot);
            }
            slot.waiters += 1;
            self.cond.wait(&mut slot);
            slot.waiters -= 1;
        }
    }

    /// Wait for an empty buffer and lease it for filling
    pub fn fill(&self, cancel: &Cancellation) -> Result<FillLease<'_>> {
        let mut slot = self.wait_for(BufferState::Empty, cancel)?;
        let mut data = slot.data.take().ok_or(RtcpError::Cancelled)?;
        data.clear();
        slot.state = BufferState::Filling;
        slot.length = 0;
        slot.end_of_tape_file = false;
        slot.last_buffer = false;
        Ok(FillLease {
            buffer: self,
            data: Some(data),
        })
    }

    /// Wait for a full buffer and lease it for draining
    pub fn drain(&self, cancel: &Cancellation) -> Result<DrainLease<'_>> {
        let mut slot = self.wait_for(BufferState::Full, cancel)?;
        let data = slot.data.take().ok_or(RtcpError::Cancelled)?;
        slot.state = BufferState::Draining;
        Ok(DrainLease {
            buffer: self,
            data: Some(data),
            length: slot.length,
            end_of_tape_file: slot.end_of_tape_file,
            last_buffer: slot.last_buffer,
        })
    }

    fn give_back(&self, data: Vec<u8>, next: BufferState, length: usize, eof: bool, last: bool) {
        let mut slot = self.slot.lock();
        if !slot.freed {
            slot.data = Some(data);
            slot.state = next;
            slot.length = length;
            slot.end_of_tape_file = eof;
            slot.last_buffer = last;
        }
        self.cond.notify_all();
    }
}

/// Producer's exclusive hold on a buffer being filled
pub struct FillLease<'a> {
    buffer: &'a Buffer,
    data: Option<Vec<u8>>,
}

impl FillLease<'_> {
    /// Data area; its length is the buffer's data length
    pub fn data_mut(&mut self) -> &mut Vec<u8> {
        self.data.get_or_insert_with(Vec::new)
    }

    pub fn len(&self) -> usize {
        self.data.as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hand the buffer over to the consumer
    pub fn commit(mut self, end_of_tape_file: bool, last_buffer: bool) {
        let data = self.data.take().unwrap_or_default();
        let len = data.len();
        self.buffer
            .give_back(data, BufferState::Full, len, end_of_tape_file, last_buffer);
    }
}

impl Drop for FillLease<'_> {
    // Abandoned fill: the buffer goes back empty
    fn drop(&mut self) {
        if let Some(mut data) = self.data.take() {
            data.clear();
            self.buffer
                .give_back(data, BufferState::Empty, 0, false, false);
        }
    }
}

/// Consumer's exclusive hold on a full buffer
pub struct DrainLease<'a> {
    buffer: &'a Buffer,
    data: Option<Vec<u8>>,
    length: usize,
    end_of_tape_file: bool,
    last_buffer: bool,
}

impl DrainLease<'_> {
    pub fn data(&self) -> &[u8] {
        match &self.data {
            Some(d) => &d[..self.length.min(d.len())],
            None => &[],
        }
    }

    pub fn end_of_tape_file(&self) -> bool {
        self.end_of_tape_file
    }

    pub fn last_buffer(&self) -> bool {
        self.last_buffer
    }
}

impl Drop for DrainLease<'_> {
    fn drop(&mut self) {
        if let Some(mut data) = self.data.take() {
            data.clear();
            self.buffer
                .give_back(data, BufferState::Empty, 0, false, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_lifecycle_empty_full_empty() {
        let pool = BufferPool::allocate(2, 1024).unwrap();
        let cancel = Cancellation::new();
        let b = pool.buffer(0);

        let mut lease = b.fill(&cancel).unwrap();
        assert_eq!(b.state(), BufferState::Filling);
        lease.data_mut().extend_from_slice(b"hello");
        lease.commit(true, false);
        assert_eq!(b.state(), BufferState::Full);

        let drain = b.drain(&cancel).unwrap();
        assert_eq!(b.state(), BufferState::Draining);
        assert_eq!(drain.data(), b"hello");
        assert!(drain.end_of_tape_file());
        assert!(!drain.last_buffer());
        drop(drain);
        assert_eq!(b.state(), BufferState::Empty);
        assert_eq!(pool.owned_count(), 2);
    }

    #[test]
    fn test_abandoned_fill_returns_empty() {
        let pool = BufferPool::allocate(1, 64).unwrap();
        let cancel = Cancellation::new();
        {
            let mut lease = pool.buffer(0).fill(&cancel).unwrap();
            lease.data_mut().push(1);
        }
        assert_eq!(pool.buffer(0).state(), BufferState::Empty);
        assert_eq!(pool.owned_count(), 1);
    }

    #[test]
    fn test_consumer_waits_for_producer() {
        let pool = Arc::new(BufferPool::allocate(1, 64).unwrap());
        let cancel = Arc::new(Cancellation::new());

        let (p, c) = (Arc::clone(&pool), Arc::clone(&cancel));
        let consumer = thread::spawn(move || {
            let lease = p.buffer(0).drain(&c).unwrap();
            lease.data().to_vec()
        });

        let mut lease = pool.buffer(0).fill(&cancel).unwrap();
        lease.data_mut().extend_from_slice(&[7; 10]);
        lease.commit(false, true);

        assert_eq!(consumer.join().unwrap(), vec![7; 10]);
    }

    #[test]
    fn test_useful_size_rounds_to_blocks() {
        let pool = BufferPool::allocate(1, 1000).unwrap();
        assert_eq!(pool.useful_size(300), Some(900));
        assert_eq!(pool.useful_size(1000), Some(1000));
        assert_eq!(pool.useful_size(1001), None);
        assert_eq!(pool.useful_size(0), None);
    }

    #[test]
    fn test_invalid_geometry_rejected() {
        assert!(BufferPool::allocate(0, 10).is_err());
        assert!(BufferPool::allocate(10, 0).is_err());
    }

    #[test]
    fn test_absurd_pool_is_out_of_memory() {
        let err = BufferPool::allocate(1 << 20, 1 << 40).err().unwrap();
        assert!(matches!(err, RtcpError::OutOfMemory { .. }));
    }

    #[test]
    fn test_free_wakes_waiters_and_drops_data() {
        let pool = Arc::new(BufferPool::allocate(1, 64).unwrap());
        let cancel = Arc::new(Cancellation::new());
        let (p, c) = (Arc::clone(&pool), Arc::clone(&cancel));
        let waiter = thread::spawn(move || p.buffer(0).drain(&c).map(|_| ()));

        thread::sleep(std::time::Duration::from_millis(20));
        pool.free();
        assert!(matches!(waiter.join().unwrap(), Err(RtcpError::Cancelled)));
        assert_eq!(pool.owned_count(), 0);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_allocate_then_free_owns_nothing() {
        for (count, size) in [(1, 1), (3, 7), (8, 4096)] {
            let pool = BufferPool::allocate(count, size).unwrap();
            pool.free();
            assert_eq!(pool.owned_count(), 0);
        }
    }

    #[test]
    fn test_reset_returns_full_buffers_to_empty() {
        let pool = BufferPool::allocate(2, 64).unwrap();
        let cancel = Cancellation::new();
        let mut lease = pool.buffer(1).fill(&cancel).unwrap();
        lease.data_mut().push(3);
        lease.commit(true, true);
        pool.reset();
        assert_eq!(pool.buffer(1).state(), BufferState::Empty);
    }
}
